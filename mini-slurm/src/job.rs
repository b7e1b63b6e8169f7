//! Core job data model (§3.1).
//!
//! Mirrors the C++-vs-Rust improvements the teacher crate made to `Task` in
//! `task.rs`: a plain `status: JobStatus` enum instead of a bare string, and
//! `Option<T>` instead of sentinel values (`-1`, `NULL` columns) for fields
//! that are only meaningful at certain lifecycle stages.

use serde::{Deserialize, Serialize};

/// Job lifecycle status (§3.1 invariant I2).
///
/// Legal transitions: `Pending -> Running -> {Completed, Failed}` or
/// `Pending -> Cancelled`. No other transition is constructed anywhere in
/// this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// A single scheduled unit of work.
///
/// New fields must be added with `#[serde(default)]` so that rows written by
/// an older build of this crate still deserialize — the additive-migration
/// contract of §4.1/§7, implemented here via serde defaults instead of
/// `ALTER TABLE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub command: String,
    pub cpus: u32,
    pub mem_mb: u64,
    pub priority: i64,
    pub status: JobStatus,

    pub submit_time: f64,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub wait_time: Option<f64>,
    pub runtime: Option<f64>,

    pub return_code: Option<i32>,
    pub user: String,

    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    #[serde(default)]
    pub control_file: Option<String>,

    #[serde(default)]
    pub is_elastic: bool,
    #[serde(default)]
    pub min_cpus: Option<u32>,
    #[serde(default)]
    pub max_cpus: Option<u32>,
    #[serde(default)]
    pub current_cpus: Option<u32>,

    #[serde(default)]
    pub nodes: Vec<String>,

    #[serde(default)]
    pub cpu_user_time: Option<f64>,
    #[serde(default)]
    pub cpu_system_time: Option<f64>,
}

/// Fields supplied by the client at submission time, before an id is
/// assigned (§4.1 `insert_pending`).
#[derive(Debug, Clone)]
pub struct NewJob {
    pub command: String,
    pub cpus: u32,
    pub mem_mb: u64,
    pub priority: i64,
    pub user: String,
    pub is_elastic: bool,
    pub min_cpus: Option<u32>,
    pub max_cpus: Option<u32>,
}

impl Job {
    /// Current effective CPU allocation: `current_cpus` for elastic jobs
    /// (once set), else the static `cpus` field.
    pub fn effective_cpus(&self) -> u32 {
        self.current_cpus.unwrap_or(self.cpus)
    }
}

impl NewJob {
    /// Validate the elastic min/max invariant (§3.1 invariant I3) before a
    /// row is ever inserted. Kept on the engine side of the CLI boundary so
    /// `JobStore::insert_pending` is the single place this is enforced,
    /// regardless of caller.
    pub fn validate(&self) -> crate::error::Result<()> {
        if let (Some(min_cpus), Some(max_cpus)) = (self.min_cpus, self.max_cpus) {
            if min_cpus > max_cpus {
                return Err(crate::error::MiniSlurmError::MinCpusExceedsMax { min_cpus, max_cpus });
            }
            if self.is_elastic && (self.cpus < min_cpus || self.cpus > max_cpus) {
                return Err(crate::error::MiniSlurmError::CpusOutsideElasticRange {
                    cpus: self.cpus,
                    min_cpus,
                    max_cpus,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_new_job(cpus: u32, is_elastic: bool, min_cpus: Option<u32>, max_cpus: Option<u32>) -> NewJob {
        NewJob {
            command: "true".into(),
            cpus,
            mem_mb: 128,
            priority: 0,
            user: "tester".into(),
            is_elastic,
            min_cpus,
            max_cpus,
        }
    }

    #[test]
    fn validate_rejects_min_cpus_above_max_cpus() {
        let job = sample_new_job(2, true, Some(4), Some(2));
        assert!(job.validate().is_err());
    }

    #[test]
    fn validate_rejects_elastic_initial_cpus_outside_range() {
        let job = sample_new_job(10, true, Some(1), Some(4));
        assert!(job.validate().is_err());
    }

    #[test]
    fn validate_accepts_elastic_initial_cpus_within_range() {
        let job = sample_new_job(2, true, Some(1), Some(4));
        assert!(job.validate().is_ok());
    }

    #[test]
    fn validate_ignores_range_fields_for_non_elastic_job() {
        let job = sample_new_job(100, false, None, None);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn job_status_round_trips_through_display_and_from_str() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let text = s.to_string();
            let parsed: JobStatus = text.parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn job_status_from_str_is_case_insensitive() {
        assert_eq!("pending".parse::<JobStatus>().unwrap(), JobStatus::Pending);
        assert_eq!("Running".parse::<JobStatus>().unwrap(), JobStatus::Running);
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert!("SUSPENDED".parse::<JobStatus>().is_err());
    }

    #[test]
    fn effective_cpus_prefers_current_cpus_when_set() {
        let mut job = sample_job();
        job.cpus = 2;
        job.current_cpus = Some(6);
        assert_eq!(job.effective_cpus(), 6);
    }

    #[test]
    fn effective_cpus_falls_back_to_cpus_when_not_elastic() {
        let mut job = sample_job();
        job.cpus = 3;
        job.current_cpus = None;
        assert_eq!(job.effective_cpus(), 3);
    }

    fn sample_job() -> Job {
        Job {
            id: 1,
            command: "true".into(),
            cpus: 1,
            mem_mb: 128,
            priority: 0,
            status: JobStatus::Pending,
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
        }
    }
}
