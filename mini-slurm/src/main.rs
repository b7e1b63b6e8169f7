//! `mini-slurm` CLI entry point (§6.1).
//!
//! Mirrors `cli.py`'s subcommand surface and rendering exactly: `submit`,
//! `queue`, `show`, `cancel`, `scheduler`, `stats`. Engine errors
//! ([`mini_slurm::MiniSlurmError`]) are converted to `anyhow::Error` at this
//! boundary via `?`/`.context(...)`, the same split the teacher crate's
//! `main.rs`/`scheduler/error.rs` draw between engine and CLI error types.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use mini_slurm::config::ClusterConfig;
use mini_slurm::job::{Job, JobStatus, NewJob};
use mini_slurm::memsize::parse_mem;
use mini_slurm::scheduler::Scheduler;
use mini_slurm::store::JobStore;
use mini_slurm::{current_user, epoch_now, format_ts};

#[derive(Parser)]
#[command(name = "mini-slurm", about = "Mini-SLURM: a tiny local HPC-style job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a job
    Submit {
        #[arg(long)]
        cpus: u32,
        #[arg(long)]
        mem: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[arg(long)]
        elastic: bool,
        #[arg(long = "min-cpus")]
        min_cpus: Option<u32>,
        #[arg(long = "max-cpus")]
        max_cpus: Option<u32>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Show job queue
    Queue {
        #[arg(long)]
        status: Option<StatusFilter>,
    },
    /// Show job details
    Show { job_id: u64 },
    /// Cancel a pending job
    Cancel { job_id: u64 },
    /// Run the scheduler loop
    Scheduler {
        #[arg(long = "total-cpus")]
        total_cpus: Option<u32>,
        #[arg(long = "total-mem")]
        total_mem: Option<String>,
        #[arg(long = "poll-interval", default_value_t = 1.0)]
        poll_interval: f64,
        #[arg(long = "elastic-threshold", default_value_t = 50.0)]
        elastic_threshold: f64,
        #[arg(long = "disable-elastic")]
        disable_elastic: bool,
        #[arg(long = "topology-config")]
        topology_config: Option<String>,
    },
    /// Show system statistics and job metrics
    Stats {
        #[arg(long = "total-cpus")]
        total_cpus: Option<u32>,
        #[arg(long = "total-mem")]
        total_mem: Option<String>,
    },
}

/// `--status` filter for `queue` (§6.1), mirroring argparse's `choices=`.
#[derive(Clone, Copy, ValueEnum)]
enum StatusFilter {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<StatusFilter> for JobStatus {
    fn from(value: StatusFilter) -> Self {
        match value {
            StatusFilter::Pending => JobStatus::Pending,
            StatusFilter::Running => JobStatus::Running,
            StatusFilter::Completed => JobStatus::Completed,
            StatusFilter::Failed => JobStatus::Failed,
            StatusFilter::Cancelled => JobStatus::Cancelled,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Submit {
            cpus,
            mem,
            priority,
            elastic,
            min_cpus,
            max_cpus,
            command,
        } => cmd_submit(cpus, mem, priority, elastic, min_cpus, max_cpus, command),
        Command::Queue { status } => cmd_queue(status),
        Command::Show { job_id } => cmd_show(job_id),
        Command::Cancel { job_id } => cmd_cancel(job_id),
        Command::Scheduler {
            total_cpus,
            total_mem,
            poll_interval,
            elastic_threshold,
            disable_elastic,
            topology_config,
        } => cmd_scheduler(
            total_cpus,
            total_mem,
            poll_interval,
            elastic_threshold,
            disable_elastic,
            topology_config,
        ),
        Command::Stats { total_cpus, total_mem } => cmd_stats(total_cpus, total_mem),
    }
}

fn cmd_submit(
    cpus: u32,
    mem: String,
    priority: i64,
    is_elastic: bool,
    min_cpus: Option<u32>,
    max_cpus: Option<u32>,
    command_words: Vec<String>,
) -> Result<()> {
    let cfg = ClusterConfig::default_paths();
    let store = JobStore::open(&cfg.db_path).context("opening job store")?;

    let mem_mb = parse_mem(&mem)?;
    let command = command_words.join(" ");

    let (min_cpus, max_cpus) = if is_elastic {
        (
            Some(min_cpus.unwrap_or(cpus)),
            Some(max_cpus.unwrap_or(cfg.total_cpus)),
        )
    } else {
        (min_cpus, max_cpus)
    };

    let new_job = NewJob {
        command: command.clone(),
        cpus,
        mem_mb,
        priority,
        user: current_user(),
        is_elastic,
        min_cpus,
        max_cpus,
    };
    let job_id = store.insert_pending(new_job, epoch_now())?;

    println!("Submitted job {job_id}");
    if is_elastic {
        println!(
            "  [ELASTIC] cpus={cpus} (min={}, max={}), mem={mem_mb}MB, priority={priority}",
            min_cpus.unwrap_or(cpus),
            max_cpus.unwrap_or(cpus)
        );
    } else {
        println!("  cpus={cpus}, mem={mem_mb}MB, priority={priority}");
    }
    println!("  command={command}");
    Ok(())
}

fn cmd_queue(status: Option<StatusFilter>) -> Result<()> {
    let cfg = ClusterConfig::default_paths();
    let store = JobStore::open(&cfg.db_path).context("opening job store")?;

    let mut rows = match status {
        Some(s) => store.select_by_status(s.into())?,
        None => store.select_all()?,
    };
    rows.sort_by_key(|j| j.id);

    if rows.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:>4} {:>8} {:>3} {:>7} {:>3} {:>8} {:>8} {:>8} {:>19} COMMAND",
        "ID", "STAT", "CPU", "MEM(MB)", "PRI", "WAIT(s)", "RUN(s)", "ELASTIC", "SUBMIT"
    );
    for job in &rows {
        let elastic_str = if job.is_elastic {
            format!(
                "{}/{}",
                job.current_cpus.unwrap_or(job.cpus),
                job.max_cpus.unwrap_or(job.cpus)
            )
        } else {
            String::new()
        };
        println!(
            "{:>4} {:>8} {:>3} {:>7} {:>3} {:>8.1} {:>8.1} {:>8} {:>19} {}",
            job.id,
            job.status.to_string(),
            job.cpus,
            job.mem_mb,
            job.priority,
            job.wait_time.unwrap_or(0.0),
            job.runtime.unwrap_or(0.0),
            elastic_str,
            format_ts(Some(job.submit_time)),
            job.command,
        );
    }
    Ok(())
}

fn cmd_show(job_id: u64) -> Result<()> {
    let cfg = ClusterConfig::default_paths();
    let store = JobStore::open(&cfg.db_path).context("opening job store")?;

    let job = match store.select_by_id(job_id) {
        Ok(job) => job,
        Err(mini_slurm::MiniSlurmError::JobNotFound(id)) => {
            println!("Job {id} not found");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    print_job_details(&job);
    Ok(())
}

fn print_job_details(job: &Job) {
    println!("Job {}", job.id);
    println!("  User:        {}", job.user);
    println!("  Status:      {}", job.status);
    println!("  Priority:    {}", job.priority);
    println!("  Command:     {}", job.command);
    if job.is_elastic {
        println!("  Type:        ELASTIC");
        println!(
            "  CPUs:        {} (current: {}, min: {}, max: {})",
            job.cpus,
            job.current_cpus.unwrap_or(job.cpus),
            job.min_cpus.unwrap_or(job.cpus),
            job.max_cpus.unwrap_or(job.cpus),
        );
    } else {
        println!("  CPUs:        {}", job.cpus);
    }
    println!("  Mem (MB):    {}", job.mem_mb);
    if !job.nodes.is_empty() {
        println!("  Nodes:       {}", job.nodes.join(","));
    }
    println!("  Submitted:   {}", format_ts(Some(job.submit_time)));
    println!("  Started:     {}", format_ts(job.start_time));
    println!("  Ended:       {}", format_ts(job.end_time));
    match job.wait_time {
        Some(w) => println!("  Wait time:   {w:.2}s"),
        None => println!("  Wait time:   -"),
    }
    match job.runtime {
        Some(r) => println!("  Runtime:     {r:.2}s"),
        None => println!("  Runtime:     -"),
    }
    match job.return_code {
        Some(rc) => println!("  Return code: {rc}"),
        None => println!("  Return code: -"),
    }
    println!("  Stdout:      {}", job.stdout_path.as_deref().unwrap_or("-"));
    println!("  Stderr:      {}", job.stderr_path.as_deref().unwrap_or("-"));
    if let Some(cpu_user_time) = job.cpu_user_time {
        println!("  CPU user:    {cpu_user_time:.2}s");
    }
    if let Some(cpu_system_time) = job.cpu_system_time {
        println!("  CPU system:  {cpu_system_time:.2}s");
    }
    if let Some(control_file) = &job.control_file {
        println!("  Control:     {control_file}");
    }
}

fn cmd_cancel(job_id: u64) -> Result<()> {
    let cfg = ClusterConfig::default_paths();
    let store = JobStore::open(&cfg.db_path).context("opening job store")?;

    match store.cancel_if_pending(job_id) {
        Ok(()) => println!("Cancelled job {job_id}"),
        Err(_) => println!("Could not cancel job {job_id} (maybe it is not PENDING or does not exist)"),
    }
    Ok(())
}

fn cmd_scheduler(
    total_cpus: Option<u32>,
    total_mem: Option<String>,
    poll_interval: f64,
    elastic_threshold: f64,
    disable_elastic: bool,
    topology_config: Option<String>,
) -> Result<()> {
    let mut cfg = ClusterConfig::default_paths();
    if let Some(total_cpus) = total_cpus {
        cfg.total_cpus = total_cpus;
    }
    if let Some(total_mem) = total_mem {
        cfg.total_mem_mb = parse_mem(&total_mem)?;
    }
    if let Some(topology_config) = topology_config {
        cfg.topology_config_path = topology_config.into();
    }
    cfg.poll_interval_secs = poll_interval;
    cfg.elastic_scale_threshold = elastic_threshold;
    cfg.elastic_enabled = !disable_elastic;

    let mut scheduler = Scheduler::new(cfg).context("initializing scheduler")?;
    scheduler.run().context("scheduler loop")?;
    Ok(())
}

fn cmd_stats(total_cpus: Option<u32>, total_mem: Option<String>) -> Result<()> {
    let mut cfg = ClusterConfig::default_paths();
    if let Some(total_cpus) = total_cpus {
        cfg.total_cpus = total_cpus;
    }
    if let Some(total_mem) = total_mem {
        cfg.total_mem_mb = parse_mem(&total_mem)?;
    }

    let store = JobStore::open(&cfg.db_path).context("opening job store")?;
    let running = store.select_by_status(JobStatus::Running)?;
    let used_cpus: u32 = running.iter().map(|j| j.effective_cpus()).sum();
    let used_mem_mb: u64 = running.iter().map(|j| j.mem_mb).sum();
    let stats = store.stats()?;

    println!("{}", "=".repeat(60));
    println!("Mini-SLURM Statistics");
    println!("{}", "=".repeat(60));
    println!();

    println!("System Resources:");
    println!(
        "  Total CPUs:     {}",
        cfg.total_cpus
    );
    println!(
        "  Used CPUs:      {used_cpus} ({:.1}%)",
        pct(used_cpus as f64, cfg.total_cpus as f64)
    );
    println!("  Available CPUs: {}", cfg.total_cpus.saturating_sub(used_cpus));
    println!(
        "  Total Memory:   {} MB ({:.1} GB)",
        cfg.total_mem_mb,
        cfg.total_mem_mb as f64 / 1024.0
    );
    println!(
        "  Used Memory:    {used_mem_mb} MB ({:.1}%)",
        pct(used_mem_mb as f64, cfg.total_mem_mb as f64)
    );
    println!("  Available Mem:  {} MB", cfg.total_mem_mb.saturating_sub(used_mem_mb));
    println!();

    println!("Job Statistics:");
    println!("  Total Jobs:     {}", stats.total());
    println!("  Running:        {}", stats.running);
    println!("  Pending:        {}", stats.pending);
    for (label, count) in [("COMPLETED", stats.completed), ("FAILED", stats.failed), ("CANCELLED", stats.cancelled)] {
        if count > 0 {
            println!("  {label:<12} {count}");
        }
    }
    println!();

    let completed_count = stats.completed + stats.failed;
    if completed_count > 0 {
        println!("Performance Metrics (completed jobs):");
        println!("  Average Wait Time:  {:.2} seconds", stats.avg_wait().unwrap_or(0.0));
        println!("  Average Runtime:    {:.2} seconds", stats.avg_runtime().unwrap_or(0.0));
        println!();
    }

    let total = stats.total();
    if total > 0 {
        println!("Status Breakdown:");
        let mut breakdown: Vec<(&str, u64)> = vec![
            ("CANCELLED", stats.cancelled),
            ("COMPLETED", stats.completed),
            ("FAILED", stats.failed),
            ("PENDING", stats.pending),
            ("RUNNING", stats.running),
        ];
        breakdown.retain(|(_, count)| *count > 0);
        breakdown.sort_by_key(|(label, _)| *label);
        for (label, count) in breakdown {
            println!("  {label:<12} {count:>4} ({:>5.1}%)", pct(count as f64, total as f64));
        }
    }

    Ok(())
}

fn pct(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        0.0
    } else {
        used / total * 100.0
    }
}
