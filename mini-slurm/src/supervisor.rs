//! Process Supervisor (C5, §4.5).
//!
//! Spawns each admitted job as an OS child with affinity and memory caps,
//! captures its stdout/stderr to per-job files, and detects exit. Mirrors
//! `MiniSlurm._start_job`/`_update_running_jobs` in the Python original, but
//! replaces `preexec_fn` + `psutil` with `std::os::unix::process::CommandExt`
//! and a `sysinfo`-backed best-effort CPU-time sampler.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::job::Job;

/// Environment variables injected into an elastic child (§4.5 step 3, §6.4).
struct ElasticEnv<'a> {
    job_id: u64,
    control_file: &'a Path,
    current_cpus: u32,
    min_cpus: u32,
    max_cpus: u32,
}

/// Paths/handles produced by [`ProcessSupervisor::spawn`], handed back to the
/// caller so it can transition the job row to `RUNNING` (§4.1 `update_on_start`).
pub struct SpawnOutcome {
    pub stdout_path: String,
    pub stderr_path: String,
    pub control_file: Option<String>,
}

/// One supervised child: the process handle plus enough bookkeeping to reap
/// it and clean up after it exits.
struct ChildHandle {
    child: Child,
    start_time: f64,
    control_file: Option<PathBuf>,
    /// Best-effort CPU time sample taken on the last tick the process was
    /// still observed alive. Used as the reported figure on exit, since by
    /// the time `try_wait` reports the child as reaped there is usually
    /// nothing left in `/proc` to sample (§4.5 step 8 — best-effort).
    last_cpu_sample: Option<(f64, f64)>,
}

/// Outcome of reaping one finished child (§4.5 steps 8-9).
pub struct FinishedJob {
    pub id: u64,
    pub return_code: i32,
    pub cpu_user_time: Option<f64>,
    pub cpu_system_time: Option<f64>,
}

/// Owns every child process the scheduler currently supervises.
pub struct ProcessSupervisor {
    children: HashMap<u64, ChildHandle>,
    sys: sysinfo::System,
    last_sample_at: Option<std::time::Instant>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            children: HashMap::new(),
            sys: sysinfo::System::new(),
            last_sample_at: None,
        }
    }

    pub fn running_count(&self) -> usize {
        self.children.len()
    }

    /// Spawn `job` as a child process (§4.5 steps 1-8, minus the store
    /// transition which the caller performs once this returns).
    ///
    /// `cpu_indices` is `Some` when the caller wants the child pinned to
    /// specific CPU indices (derived from the assigned node set or, absent
    /// topology, `0..cpus`), `None` when no affinity should be applied.
    pub fn spawn(
        &mut self,
        job: &Job,
        cfg: &ClusterConfig,
        cpu_indices: Option<Vec<u32>>,
        start_time: f64,
    ) -> Result<SpawnOutcome> {
        std::fs::create_dir_all(&cfg.log_dir)?;

        let stdout_path = cfg.log_dir.join(format!("job_{}.out", job.id));
        let stderr_path = cfg.log_dir.join(format!("job_{}.err", job.id));
        let stdout_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stdout_path)?;
        let stderr_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stderr_path)?;

        let control_file = if job.is_elastic {
            let path = cfg.log_dir.join(format!("job_{}.control", job.id));
            let min_cpus = job.min_cpus.unwrap_or(job.cpus);
            let max_cpus = job.max_cpus.unwrap_or(job.cpus);
            write_control_file(&path, job.cpus, job.mem_mb, min_cpus, max_cpus)?;
            Some(path)
        } else {
            None
        };

        let mut command = platform_shell_command(&job.command);
        command.stdout(Stdio::from(stdout_file));
        command.stderr(Stdio::from(stderr_file));
        command.envs(std::env::vars());

        if job.is_elastic {
            if let Some(path) = &control_file {
                apply_elastic_env(
                    &mut command,
                    ElasticEnv {
                        job_id: job.id,
                        control_file: path,
                        current_cpus: job.cpus,
                        min_cpus: job.min_cpus.unwrap_or(job.cpus),
                        max_cpus: job.max_cpus.unwrap_or(job.cpus),
                    },
                );
            }
        }

        apply_affinity(&mut command, &cpu_indices, job.cpus);
        apply_resource_limits(&mut command, job.mem_mb);

        let child = command.spawn()?;

        info!(
            job_id = job.id,
            cpus = job.cpus,
            mem_mb = job.mem_mb,
            elastic = job.is_elastic,
            nodes = ?job.nodes,
            "started job"
        );

        self.children.insert(
            job.id,
            ChildHandle {
                child,
                start_time,
                control_file: control_file.clone(),
                last_cpu_sample: None,
            },
        );

        Ok(SpawnOutcome {
            stdout_path: stdout_path.display().to_string(),
            stderr_path: stderr_path.display().to_string(),
            control_file: control_file.map(|p| p.display().to_string()),
        })
    }

    /// Best-effort CPU-time sampling (§4.5 step 9, §7 "Supervision
    /// transient"). Call once per tick before [`Self::reap`] so a sample
    /// taken while the process was still alive is available to report once
    /// it exits.
    pub fn sample_cpu_times(&mut self) {
        if self.children.is_empty() {
            self.last_sample_at = None;
            return;
        }
        self.sys.refresh_all();
        let now = std::time::Instant::now();
        let elapsed = self
            .last_sample_at
            .map(|prev| now.duration_since(prev).as_secs_f64())
            .unwrap_or(0.0);
        self.last_sample_at = Some(now);

        if elapsed <= 0.0 {
            // First sample after (re)populating the process table: no
            // elapsed-time baseline yet, nothing to accumulate against.
            return;
        }

        for handle in self.children.values_mut() {
            let pid = sysinfo::Pid::from_u32(handle.child.id());
            if let Some(proc_) = self.sys.process(pid) {
                // `cpu_usage` is a percentage of one core; approximate
                // consumed CPU-seconds this interval from it rather than
                // trying to read `/proc/[pid]/stat` ourselves. Attributed
                // entirely to "user" time since sysinfo doesn't split
                // user/system on every platform.
                let delta = proc_.cpu_usage() as f64 / 100.0 * elapsed;
                let (prev_user, prev_sys) = handle.last_cpu_sample.unwrap_or((0.0, 0.0));
                handle.last_cpu_sample = Some((prev_user + delta, prev_sys));
            }
        }
    }

    /// Poll every supervised child for exit (§4.5 step 9). Finished jobs are
    /// removed from the supervisor's bookkeeping; their control file (if
    /// any) is deleted.
    pub fn reap(&mut self) -> Vec<FinishedJob> {
        let mut finished = Vec::new();
        let mut done_ids = Vec::new();

        for (&id, handle) in self.children.iter_mut() {
            match handle.child.try_wait() {
                Ok(Some(status)) => {
                    let return_code = exit_code_of(&status);
                    let (cpu_user_time, cpu_system_time) = handle
                        .last_cpu_sample
                        .map(|(u, s)| (Some(u), Some(s)))
                        .unwrap_or((None, None));
                    finished.push(FinishedJob {
                        id,
                        return_code,
                        cpu_user_time,
                        cpu_system_time,
                    });
                    done_ids.push(id);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = id, error = %e, "failed to poll child status");
                }
            }
        }

        for id in done_ids {
            if let Some(handle) = self.children.remove(&id) {
                if let Some(path) = handle.control_file {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!(job_id = id, path = %path.display(), error = %e, "failed to remove control file");
                    }
                }
            }
        }

        finished
    }

    /// Rewrite an elastic job's control file with its new allocation and
    /// best-effort-signal the child to re-read it (§4.6).
    pub fn notify_scale(&self, job_id: u64, control_file: &Path, new_cpus: u32) {
        if let Err(e) = rewrite_control_file_cpus(control_file, new_cpus) {
            warn!(job_id, path = %control_file.display(), error = %e, "failed to update control file on scale event");
        }
        self.send_scale_signal(job_id);
    }

    #[cfg(unix)]
    fn send_scale_signal(&self, job_id: u64) {
        if let Some(handle) = self.children.get(&job_id) {
            let pid = handle.child.id() as libc::pid_t;
            // SAFETY: `pid` is our own child's pid; sending SIGUSR1 to it is
            // harmless even if the child has just exited (returns ESRCH,
            // which we swallow per §7's "supervision transient" policy).
            let rc = unsafe { libc::kill(pid, libc::SIGUSR1) };
            if rc != 0 {
                warn!(job_id, "failed to deliver SIGUSR1 scale notification");
            }
        }
    }

    #[cfg(not(unix))]
    fn send_scale_signal(&self, _job_id: u64) {
        // No signal-delivery primitive on this platform; the child is
        // expected to notice the control file change on its own periodic
        // re-read (§6.4).
    }

    /// Time the job started, used by the caller to compute runtime on finish
    /// without a second store round-trip.
    pub fn start_time_of(&self, job_id: u64) -> Option<f64> {
        self.children.get(&job_id).map(|h| h.start_time)
    }
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            // Platform-conventional "killed by signal" encoding.
            return -signal;
        }
    }
    -1
}

/// Build the platform shell invocation for a free-form command string (§4.5
/// step 7 — executed through a shell so env-var prefixes and pipelines in
/// user commands work).
fn platform_shell_command(command: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
    #[cfg(not(unix))]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
}

fn apply_elastic_env(command: &mut Command, env: ElasticEnv<'_>) {
    command
        .env("MINI_SLURM_ELASTIC", "1")
        .env("MINI_SLURM_JOB_ID", env.job_id.to_string())
        .env("MINI_SLURM_CONTROL_FILE", env.control_file)
        .env("MINI_SLURM_CURRENT_CPUS", env.current_cpus.to_string())
        .env("MINI_SLURM_MIN_CPUS", env.min_cpus.to_string())
        .env("MINI_SLURM_MAX_CPUS", env.max_cpus.to_string());
}

/// Apply CPU affinity (§4.5 step 4). On Linux, pin the child to
/// `cpu_indices` (or `0..cpus` absent topology) via `sched_setaffinity` in a
/// `pre_exec` hook. Elsewhere, fall back to the thread-count environment
/// variables the Python original sets on macOS.
fn apply_affinity(command: &mut Command, cpu_indices: &Option<Vec<u32>>, cpus: u32) {
    let indices = cpu_indices
        .clone()
        .unwrap_or_else(|| (0..cpus).collect());

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::process::CommandExt;
        let indices = indices.clone();
        unsafe {
            command.pre_exec(move || {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_ZERO(&mut set);
                for &cpu in &indices {
                    libc::CPU_SET(cpu as usize, &mut set);
                }
                // Best-effort: a nonzero return is swallowed (§7). We can't
                // log from inside a post-fork, pre-exec hook (not
                // async-signal-safe), so failure is silent here by design.
                libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
                Ok(())
            });
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        command.env("OMP_NUM_THREADS", cpus.to_string());
        command.env("MKL_NUM_THREADS", cpus.to_string());
        command.env("NUMEXPR_NUM_THREADS", cpus.to_string());
    }
}

/// Apply the memory resource limit and detach the child into its own process
/// group (§4.5 steps 5-6).
#[cfg(unix)]
fn apply_resource_limits(command: &mut Command, mem_mb: u64) {
    use std::os::unix::process::CommandExt;
    let mem_bytes = mem_mb.saturating_mul(1024 * 1024);
    unsafe {
        command.pre_exec(move || {
            let limit = libc::rlimit {
                rlim_cur: mem_bytes,
                rlim_max: mem_bytes,
            };
            // Best-effort (§7): some platforms (notably macOS) reject
            // RLIMIT_AS; a nonzero return is silently ignored.
            libc::setrlimit(libc::RLIMIT_AS, &limit);
            // New session + process group, so the scheduler's own exit (or a
            // future group-wide signal) doesn't take the child down with it.
            libc::setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_resource_limits(_command: &mut Command, _mem_mb: u64) {
    // No POSIX rlimit/session primitives on this platform.
}

/// Write the initial control file for a freshly admitted elastic job (§4.5
/// step 2, §6.4).
fn write_control_file(
    path: &Path,
    cpus: u32,
    mem_mb: u64,
    min_cpus: u32,
    max_cpus: u32,
) -> std::io::Result<()> {
    let content = format!(
        "CPUS={cpus}\nMEM_MB={mem_mb}\nMIN_CPUS={min_cpus}\nMAX_CPUS={max_cpus}\nSTATUS=RUNNING\n"
    );
    std::fs::write(path, content)
}

/// Rewrite `CPUS=` (and append/overwrite `SCALE_EVENT=`) in an existing
/// control file, preserving every other line (§4.6).
fn rewrite_control_file_cpus(path: &Path, new_cpus: u32) -> std::io::Result<()> {
    let existing = std::fs::read_to_string(path).unwrap_or_default();
    let mut saw_scale_event = false;
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            if line.starts_with("CPUS=") {
                format!("CPUS={new_cpus}")
            } else if line.starts_with("SCALE_EVENT=") {
                saw_scale_event = true;
                format!("SCALE_EVENT={}", crate::epoch_now())
            } else {
                line.to_string()
            }
        })
        .collect();
    if !saw_scale_event {
        lines.push(format!("SCALE_EVENT={}", crate::epoch_now()));
    }
    let mut content = lines.join("\n");
    content.push('\n');
    std::fs::write(path, content)
}

/// Map an assigned node set to concrete CPU indices (§4.5 step 4): node
/// number `n` maps to CPU indices `[(n-1)*k .. (n-1)*k + k - 1]` where `k` is
/// `cpus_per_node`. Nodes whose name doesn't end in a parseable number are
/// skipped.
pub fn cpu_indices_for_nodes(nodes: &[String], cpus_per_node: u32) -> Vec<u32> {
    let mut indices = Vec::new();
    for node in nodes {
        if let Some(n) = trailing_number(node) {
            let base = (n.saturating_sub(1)) * cpus_per_node as u64;
            for i in 0..cpus_per_node as u64 {
                indices.push((base + i) as u32);
            }
        }
    }
    indices
}

fn trailing_number(name: &str) -> Option<u64> {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.chars().rev().collect::<String>().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cpu_indices_for_nodes_maps_node_number_to_range() {
        let nodes = vec!["node1".to_string(), "node3".to_string()];
        let indices = cpu_indices_for_nodes(&nodes, 2);
        assert_eq!(indices, vec![0, 1, 4, 5]);
    }

    #[test]
    fn cpu_indices_for_nodes_single_cpu_per_node() {
        let nodes = vec!["node1".to_string(), "node2".to_string()];
        let indices = cpu_indices_for_nodes(&nodes, 1);
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn trailing_number_parses_suffix_digits() {
        assert_eq!(trailing_number("node42"), Some(42));
        assert_eq!(trailing_number("switch1"), Some(1));
        assert_eq!(trailing_number("core"), None);
    }

    #[test]
    fn write_control_file_contains_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job_1.control");
        write_control_file(&path, 2, 1024, 2, 8).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("CPUS=2"));
        assert!(content.contains("MEM_MB=1024"));
        assert!(content.contains("MIN_CPUS=2"));
        assert!(content.contains("MAX_CPUS=8"));
        assert!(content.contains("STATUS=RUNNING"));
    }

    #[test]
    fn rewrite_control_file_cpus_updates_in_place_and_adds_scale_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job_1.control");
        write_control_file(&path, 2, 1024, 2, 8).unwrap();
        rewrite_control_file_cpus(&path, 6).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("CPUS=6"));
        assert!(content.contains("SCALE_EVENT="));
        assert!(content.contains("MIN_CPUS=2"));
    }

    #[test]
    fn rewrite_control_file_cpus_updates_existing_scale_event_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job_1.control");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "CPUS=2\nSCALE_EVENT=100.0\n").unwrap();
        drop(f);
        rewrite_control_file_cpus(&path, 4).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let scale_event_lines: Vec<&str> = content
            .lines()
            .filter(|l| l.starts_with("SCALE_EVENT="))
            .collect();
        assert_eq!(scale_event_lines.len(), 1);
        assert!(!scale_event_lines[0].contains("100.0"));
    }

    #[test]
    fn spawn_and_reap_true_command_reports_completed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ClusterConfig {
            db_path: dir.path().join("db"),
            log_dir: dir.path().join("logs"),
            topology_config_path: dir.path().join("topo.conf"),
            total_cpus: 4,
            total_mem_mb: 4096,
            poll_interval_secs: 0.01,
            elastic_scale_threshold: 50.0,
            elastic_enabled: true,
        };
        let job = crate::job::Job {
            id: 1,
            command: "true".into(),
            cpus: 1,
            mem_mb: 64,
            priority: 0,
            status: crate::job::JobStatus::Pending,
            submit_time: 0.0,
            start_time: None,
            end_time: None,
            wait_time: None,
            runtime: None,
            return_code: None,
            user: "tester".into(),
            stdout_path: None,
            stderr_path: None,
            control_file: None,
            is_elastic: false,
            min_cpus: None,
            max_cpus: None,
            current_cpus: None,
            nodes: vec![],
            cpu_user_time: None,
            cpu_system_time: None,
        };

        let mut sup = ProcessSupervisor::new();
        let outcome = sup.spawn(&job, &cfg, None, 0.0).unwrap();
        assert!(std::path::Path::new(&outcome.stdout_path).exists());

        let mut finished = Vec::new();
        for _ in 0..200 {
            finished = sup.reap();
            if !finished.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, 1);
        assert_eq!(finished[0].return_code, 0);
    }
}
