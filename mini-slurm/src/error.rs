//! Structured error types for the mini-slurm scheduling engine.
//!
//! Mirrors the two-layer split the teacher crate uses in
//! `scheduler/error.rs`: a top-level, `thiserror`-derived enum for everything
//! that can go wrong inside the engine, kept separate from `anyhow::Error`,
//! which is reserved for the CLI boundary (`main.rs`).

use thiserror::Error;

/// Errors the mini-slurm engine itself can raise.
///
/// Every variant maps to one of the error classes in the validation /
/// not-found / record-store taxonomy: validation errors are raised at
/// submit time and reported to the client without inserting a row;
/// not-found and illegal-transition errors are raised by `show`/`cancel`;
/// `Store` wraps the one class of failure (§7) that is allowed to be fatal.
#[derive(Debug, Error)]
pub enum MiniSlurmError {
    #[error("invalid memory size '{0}': expected forms like 512, 512MB, 2GB, 2g")]
    InvalidMemSize(String),

    #[error("min_cpus ({min_cpus}) > max_cpus ({max_cpus})")]
    MinCpusExceedsMax { min_cpus: u32, max_cpus: u32 },

    #[error("initial cpus ({cpus}) must be between min_cpus ({min_cpus}) and max_cpus ({max_cpus})")]
    CpusOutsideElasticRange {
        cpus: u32,
        min_cpus: u32,
        max_cpus: u32,
    },

    #[error("job {0} not found")]
    JobNotFound(u64),

    #[error("job {0} is not PENDING and cannot be cancelled")]
    NotPending(u64),

    #[error("record store error: {0}")]
    Store(#[from] sled::Error),

    #[error("record store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MiniSlurmError>;
