//! Job Record Store (C1, §3.3, §4.1).
//!
//! spec.md treats the backing table as abstract ("a transactional,
//! key-ordered table"); the Python original backs it with sqlite. This crate
//! uses `sled` instead — grounded in the same embedded-ordered-KV role it
//! plays for cluster/job state in distributed schedulers such as Ballista —
//! keyed by big-endian-encoded `u64` ids so that `scan_prefix`/iteration
//! yields ascending id order for free, and JSON-encoded values via
//! `serde_json` so that adding a `Job` field is forward-compatible with rows
//! written by an older build (§4.1/§7's additive-migration requirement,
//! mirrored here from `Job`'s own `#[serde(default)]` fields instead of SQL
//! `ALTER TABLE`).

use std::path::Path;

use crate::error::{MiniSlurmError, Result};
use crate::job::{Job, JobStatus, NewJob};

/// Handle onto the on-disk job table.
pub struct JobStore {
    db: sled::Db,
    jobs: sled::Tree,
    /// Counter tree holding a single key, `next_id`, so id assignment is
    /// part of the same transactional store as the rows themselves.
    meta: sled::Tree,
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

impl JobStore {
    /// Open (creating if absent) the job table at `path` (§6.2).
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        let jobs = db.open_tree("jobs")?;
        let meta = db.open_tree("meta")?;
        Ok(Self { db, jobs, meta })
    }

    fn next_id(&self) -> Result<u64> {
        let id = self
            .meta
            .fetch_and_update("next_id", |old| {
                let current = old
                    .map(|bytes| {
                        let mut buf = [0u8; 8];
                        buf.copy_from_slice(bytes);
                        u64::from_be_bytes(buf)
                    })
                    .unwrap_or(0);
                Some((current + 1).to_be_bytes().to_vec())
            })?
            .map(|bytes| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                u64::from_be_bytes(buf)
            })
            .unwrap_or(0);
        Ok(id + 1)
    }

    fn put(&self, job: &Job) -> Result<()> {
        let bytes = serde_json::to_vec(job)?;
        self.jobs.insert(id_key(job.id), bytes)?;
        Ok(())
    }

    fn get_raw(&self, id: u64) -> Result<Option<Job>> {
        match self.jobs.get(id_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert a new job in `PENDING` status and return the assigned id
    /// (§4.1).
    pub fn insert_pending(&self, new_job: NewJob, submit_time: f64) -> Result<u64> {
        new_job.validate()?;
        let id = self.next_id()?;
        let job = Job {
            id,
            command: new_job.command,
            cpus: new_job.cpus,
            mem_mb: new_job.mem_mb,
            priority: new_job.priority,
            status: JobStatus::Pending,
            submit_time,
            start_time: None,
            end_time: None,
            wait_time: None,
            runtime: None,
            return_code: None,
            user: new_job.user,
            stdout_path: None,
            stderr_path: None,
            control_file: None,
            is_elastic: new_job.is_elastic,
            min_cpus: new_job.min_cpus,
            max_cpus: new_job.max_cpus,
            current_cpus: if new_job.is_elastic {
                Some(new_job.cpus)
            } else {
                None
            },
            nodes: vec![],
            cpu_user_time: None,
            cpu_system_time: None,
        };
        self.put(&job)?;
        Ok(id)
    }

    /// Fetch one job by id (§4.1 `select_by_id`).
    pub fn select_by_id(&self, id: u64) -> Result<Job> {
        self.get_raw(id)?.ok_or(MiniSlurmError::JobNotFound(id))
    }

    /// All jobs in `PENDING` status, ordered by descending priority then
    /// ascending submit time (§3.1 invariant I1, §4.4 admission order).
    pub fn select_pending(&self) -> Result<Vec<Job>> {
        let mut pending = self.select_by_status(JobStatus::Pending)?;
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submit_time.partial_cmp(&b.submit_time).unwrap_or(std::cmp::Ordering::Equal))
        });
        Ok(pending)
    }

    /// All jobs with the given status, in ascending id order (§4.1).
    pub fn select_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let mut out = Vec::new();
        for entry in self.jobs.iter() {
            let (_, bytes) = entry?;
            let job: Job = serde_json::from_slice(&bytes)?;
            if job.status == status {
                out.push(job);
            }
        }
        Ok(out)
    }

    /// All jobs in the table, in ascending id order — used by `queue`/`stats`
    /// (§5.2, §5.5).
    pub fn select_all(&self) -> Result<Vec<Job>> {
        let mut out = Vec::new();
        for entry in self.jobs.iter() {
            let (_, bytes) = entry?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }

    /// Transition a job to `RUNNING`, recording its start time, wait time,
    /// placement, and supervision paths (§4.4 step 5).
    #[allow(clippy::too_many_arguments)]
    pub fn update_on_start(
        &self,
        id: u64,
        start_time: f64,
        nodes: Vec<String>,
        stdout_path: String,
        stderr_path: String,
        control_file: Option<String>,
    ) -> Result<()> {
        let mut job = self.select_by_id(id)?;
        job.status = JobStatus::Running;
        job.start_time = Some(start_time);
        job.wait_time = Some(start_time - job.submit_time);
        job.nodes = nodes;
        job.stdout_path = Some(stdout_path);
        job.stderr_path = Some(stderr_path);
        job.control_file = control_file;
        self.put(&job)
    }

    /// Transition a `RUNNING` job to its terminal status (§4.5).
    pub fn update_on_finish(
        &self,
        id: u64,
        end_time: f64,
        return_code: i32,
        cpu_user_time: Option<f64>,
        cpu_system_time: Option<f64>,
    ) -> Result<()> {
        let mut job = self.select_by_id(id)?;
        let start = job.start_time.unwrap_or(end_time);
        job.status = if return_code == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        job.end_time = Some(end_time);
        job.runtime = Some(end_time - start);
        job.return_code = Some(return_code);
        job.cpu_user_time = cpu_user_time;
        job.cpu_system_time = cpu_system_time;
        self.put(&job)
    }

    /// Update an elastic job's live CPU allocation (§4.6).
    pub fn update_elastic_cpus(&self, id: u64, new_cpus: u32) -> Result<()> {
        let mut job = self.select_by_id(id)?;
        job.current_cpus = Some(new_cpus);
        self.put(&job)
    }

    /// Cancel a job if and only if it is still `PENDING` (§4.1 `cancel`,
    /// invariant I2 — running jobs are not killed by cancel, per
    /// Non-goals).
    pub fn cancel_if_pending(&self, id: u64) -> Result<()> {
        let mut job = self.select_by_id(id)?;
        if job.status != JobStatus::Pending {
            return Err(MiniSlurmError::NotPending(id));
        }
        job.status = JobStatus::Cancelled;
        self.put(&job)
    }

    /// Aggregate counts and totals for the `stats` subcommand (§5.5, SPEC_FULL
    /// §2).
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for job in self.select_all()? {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
            if let Some(runtime) = job.runtime {
                stats.total_runtime += runtime;
                stats.finished_with_runtime += 1;
            }
            let is_terminal = matches!(job.status, JobStatus::Completed | JobStatus::Failed);
            if is_terminal {
                if let Some(wait) = job.wait_time {
                    stats.total_wait += wait;
                    stats.started_with_wait += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Flush to disk. Cheap no-op wrapper so callers don't reach into `sled`
    /// directly.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Aggregate counters backing the `stats` subcommand.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    total_runtime: f64,
    finished_with_runtime: u64,
    total_wait: f64,
    started_with_wait: u64,
}

impl StoreStats {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    pub fn avg_runtime(&self) -> Option<f64> {
        (self.finished_with_runtime > 0).then(|| self.total_runtime / self.finished_with_runtime as f64)
    }

    pub fn avg_wait(&self) -> Option<f64> {
        (self.started_with_wait > 0).then(|| self.total_wait / self.started_with_wait as f64)
    }
}
