//! Admission & Placement (C4, §4.4).
//!
//! Decides, for one tick, which `PENDING` jobs can start right now given the
//! ledger's free capacity and (if enabled) the topology's free node sets.
//! Kept pure/testable: it consumes a snapshot of the ledger's free capacity
//! and the topology, and returns decisions without mutating anything itself
//! — `scheduler.rs` applies each decision (ledger hold + supervisor spawn)
//! one at a time so that later candidates see earlier admissions' effect.

use crate::job::Job;
use crate::topology::Topology;

/// Outcome of evaluating one pending candidate against current capacity.
#[derive(Debug, Clone, PartialEq)]
pub enum PlacementDecision {
    /// Enough CPU, memory, and (if applicable) topology-local nodes exist.
    Admit { nodes: Vec<String> },
    /// Not enough CPU or memory right now; try again next tick.
    InsufficientResources,
    /// Enough raw CPU/mem, but the topology could not produce a qualifying
    /// node set this tick (§4.4 step 3 — skipped without reservation).
    NoViableNodeSet,
}

/// Evaluate one candidate job against the given free capacity (§4.4 steps
/// 2–3). Does not consult priority ordering — callers are expected to have
/// already sorted candidates via `JobStore::select_pending`.
pub fn evaluate(
    job: &Job,
    avail_cpus: u32,
    avail_mem_mb: u64,
    topology: &Topology,
    used_nodes: &std::collections::HashSet<String>,
) -> PlacementDecision {
    if job.cpus > avail_cpus || job.mem_mb > avail_mem_mb {
        return PlacementDecision::InsufficientResources;
    }

    if !topology.is_enabled() {
        return PlacementDecision::Admit { nodes: vec![] };
    }

    let cpus_per_node = topology.cpus_per_node.max(1);
    let num_nodes = job.cpus.div_ceil(cpus_per_node);

    match topology.find_best_nodes(num_nodes, cpus_per_node, topology.mem_per_node, used_nodes) {
        Some(nodes) => PlacementDecision::Admit { nodes },
        None => PlacementDecision::NoViableNodeSet,
    }
}
