//! Scheduler tick loop (§4, §5).
//!
//! Glues the other five components together into the single-threaded
//! cooperative loop the Python original runs as `scheduler_loop`: reap
//! finished children, rescale elastic jobs, admit pending jobs, sleep.
//! Parallelism comes only from the OS child processes the supervisor spawns
//! — the loop itself never spawns a thread.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::elastic::{self, ScaleEvent};
use crate::error::Result;
use crate::job::JobStatus;
use crate::ledger::ResourceLedger;
use crate::placement::{self, PlacementDecision};
use crate::store::JobStore;
use crate::supervisor::{self, ProcessSupervisor};
use crate::topology::Topology;

/// Owns every component the tick loop touches for one scheduler process.
pub struct Scheduler {
    store: JobStore,
    topology: Topology,
    ledger: ResourceLedger,
    supervisor: ProcessSupervisor,
    cfg: ClusterConfig,
}

impl Scheduler {
    /// Open the store, load (or default) the topology, and rebuild the
    /// ledger from whatever is currently `RUNNING` (§4.3 — the ledger is
    /// never trusted across a restart, only rebuilt).
    pub fn new(cfg: ClusterConfig) -> Result<Self> {
        let store = JobStore::open(&cfg.db_path)?;

        let mut topology = Topology::default_for_cluster(cfg.total_cpus, cfg.total_mem_mb);
        if cfg.topology_config_path.exists() {
            match topology.load(&cfg.topology_config_path) {
                Ok(true) => info!(path = %cfg.topology_config_path.display(), "loaded topology config"),
                Ok(false) => {}
                Err(e) => warn!(path = %cfg.topology_config_path.display(), error = %e, "failed to load topology config, using default"),
            }
        }

        let mut ledger = ResourceLedger::new(cfg.total_cpus, cfg.total_mem_mb);
        let running = store.select_by_status(JobStatus::Running)?;
        ledger.rebuild(&running);

        Ok(Self {
            store,
            topology,
            ledger,
            supervisor: ProcessSupervisor::new(),
            cfg,
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Run the scheduler loop until interrupted (`Ctrl-C`/`SIGTERM`). In-flight
    /// children are detached into their own session at spawn time (§4.5 step
    /// 6), so they survive this process's exit — there is deliberately no
    /// signal handler here to kill them (§5 "Shutdown").
    pub fn run(&mut self) -> Result<()> {
        info!(
            total_cpus = self.cfg.total_cpus,
            total_mem_mb = self.cfg.total_mem_mb,
            elastic_enabled = self.cfg.elastic_enabled,
            elastic_scale_threshold = self.cfg.elastic_scale_threshold,
            "starting scheduler"
        );
        loop {
            self.tick()?;
            std::thread::sleep(Duration::from_secs_f64(self.cfg.poll_interval_secs.max(0.0)));
        }
    }

    /// One iteration of the loop: reap, scale, admit (§5, exact order
    /// mirrored from `scheduler_loop`). Exposed separately from [`Self::run`]
    /// so tests can drive individual ticks without sleeping.
    pub fn tick(&mut self) -> Result<()> {
        self.reap_finished()?;

        if self.cfg.elastic_enabled {
            self.scale_elastic_jobs()?;
        }

        self.admit_pending()?;
        Ok(())
    }

    fn reap_finished(&mut self) -> Result<()> {
        self.supervisor.sample_cpu_times();
        for finished in self.supervisor.reap() {
            let end_time = crate::epoch_now();
            self.ledger.release(finished.id);
            self.store.update_on_finish(
                finished.id,
                end_time,
                finished.return_code,
                finished.cpu_user_time,
                finished.cpu_system_time,
            )?;
            info!(
                job_id = finished.id,
                return_code = finished.return_code,
                "job finished"
            );
        }
        Ok(())
    }

    fn scale_elastic_jobs(&mut self) -> Result<()> {
        let running = self.store.select_by_status(JobStatus::Running)?;
        let elastic_jobs = elastic::running_elastic_candidates(&running);
        if elastic_jobs.is_empty() {
            return Ok(());
        }

        let scale_up = elastic::plan_scale_up(&elastic_jobs, &self.ledger, self.cfg.elastic_scale_threshold);
        for event in &scale_up {
            self.apply_scale_event(event, "up")?;
        }

        // Refresh candidates' current_cpus before planning scale-down so a
        // job just scaled up isn't immediately reconsidered at its stale
        // pre-scale-up cpu count.
        let elastic_jobs = elastic::running_elastic_candidates(&self.store.select_by_status(JobStatus::Running)?);
        let pending = self.store.select_pending()?;
        let scale_down = elastic::plan_scale_down(&elastic_jobs, &self.ledger, &pending);
        for event in &scale_down {
            self.apply_scale_event(event, "down")?;
        }

        Ok(())
    }

    fn apply_scale_event(&mut self, event: &ScaleEvent, direction: &str) -> Result<()> {
        self.ledger.rescale(event.job_id, event.new_cpus);
        self.store.update_elastic_cpus(event.job_id, event.new_cpus)?;
        if let Some(control_file) = &event.control_file {
            self.supervisor
                .notify_scale(event.job_id, &PathBuf::from(control_file), event.new_cpus);
        }
        info!(
            job_id = event.job_id,
            old_cpus = event.old_cpus,
            new_cpus = event.new_cpus,
            direction,
            utilization_pct = self.ledger.utilization_pct(),
            "rescaled elastic job"
        );
        Ok(())
    }

    /// Admit as many pending jobs as current capacity allows (§4.4). Each
    /// candidate that can't be placed this tick — for lack of raw capacity
    /// or a viable node set — is skipped without blocking candidates behind
    /// it (no head-of-line blocking, §4.4 step 3).
    fn admit_pending(&mut self) -> Result<()> {
        let pending = self.store.select_pending()?;
        let mut used_nodes = self.ledger.used_nodes();

        for job in pending {
            let avail_cpus = self.ledger.free_cpus();
            let avail_mem = self.ledger.free_mem_mb();

            match placement::evaluate(&job, avail_cpus, avail_mem, &self.topology, &used_nodes) {
                PlacementDecision::Admit { nodes } => {
                    let cpu_indices = if self.topology.is_enabled() && !nodes.is_empty() {
                        Some(supervisor::cpu_indices_for_nodes(&nodes, self.topology.cpus_per_node))
                    } else {
                        None
                    };

                    let start_time = crate::epoch_now();
                    let outcome = match self.supervisor.spawn(&job, &self.cfg, cpu_indices, start_time) {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(job_id = job.id, error = %e, "failed to spawn job, will retry next tick");
                            continue;
                        }
                    };

                    self.ledger.hold(job.id, job.effective_cpus(), job.mem_mb, nodes.clone());
                    self.store.update_on_start(
                        job.id,
                        start_time,
                        nodes.clone(),
                        outcome.stdout_path,
                        outcome.stderr_path,
                        outcome.control_file,
                    )?;
                    used_nodes.extend(nodes);
                }
                PlacementDecision::InsufficientResources | PlacementDecision::NoViableNodeSet => {
                    continue;
                }
            }
        }
        Ok(())
    }
}
