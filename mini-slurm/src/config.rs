//! Scheduler configuration (§6.2, Design Notes §9).
//!
//! The Python original keeps `LOG_DIR` and `TOPOLOGY_CONFIG_PATH` as
//! process-global constants computed at import time. Per the Design Notes
//! ("fold these into a scheduler configuration value passed explicitly"),
//! everything lives in [`ClusterConfig`], built once in `main.rs` and handed
//! down to the store, supervisor, and scheduler loop.

use std::path::PathBuf;

/// Default cluster utilization threshold (%) below which elastic jobs scale up (§4.6).
pub const DEFAULT_ELASTIC_THRESHOLD: f64 = 50.0;

/// Default inter-tick sleep (§5).
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 1.0;

/// Default total memory when not overridden and not detectable (§6.5): 16 GiB.
pub const DEFAULT_TOTAL_MEM_MB: u64 = 16 * 1024;

/// Fallback CPU count when detection fails (§6.5).
pub const DEFAULT_TOTAL_CPUS: u32 = 4;

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// All externally-configurable, process-wide state for one scheduler/client
/// invocation.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub topology_config_path: PathBuf,

    pub total_cpus: u32,
    pub total_mem_mb: u64,

    pub poll_interval_secs: f64,
    pub elastic_scale_threshold: f64,
    pub elastic_enabled: bool,
}

impl ClusterConfig {
    /// Build the default configuration (§6.2 persistent state layout).
    pub fn default_paths() -> Self {
        let home = home_dir();
        Self {
            db_path: home.join(".mini_slurm.db"),
            log_dir: home.join(".mini_slurm_logs"),
            topology_config_path: home.join(".mini_slurm_topology.conf"),
            total_cpus: detect_total_cpus(),
            total_mem_mb: DEFAULT_TOTAL_MEM_MB,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            elastic_scale_threshold: DEFAULT_ELASTIC_THRESHOLD,
            elastic_enabled: true,
        }
    }
}

/// Detected core count, falling back to [`DEFAULT_TOTAL_CPUS`] (§6.5).
pub fn detect_total_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(DEFAULT_TOTAL_CPUS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_are_rooted_under_home() {
        let cfg = ClusterConfig::default_paths();
        assert!(cfg.db_path.ends_with(".mini_slurm.db"));
        assert!(cfg.log_dir.ends_with(".mini_slurm_logs"));
        assert!(cfg.topology_config_path.ends_with(".mini_slurm_topology.conf"));
    }

    #[test]
    fn detect_total_cpus_is_never_zero() {
        assert!(detect_total_cpus() > 0);
    }
}
