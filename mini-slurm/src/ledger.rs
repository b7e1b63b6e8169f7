//! Resource Ledger (C3, §3.3, §4.3).
//!
//! Tracks what the cluster's finite CPU/memory/node resources are currently
//! committed to by `RUNNING` jobs. Rebuilt from the record store on
//! scheduler startup (§3.3 invariant: the ledger is a derived view, never
//! the source of truth) rather than persisted itself.

use std::collections::{BTreeMap, HashSet};

use crate::job::Job;

/// One job's resource hold, as tracked by the ledger.
#[derive(Debug, Clone)]
struct Allocation {
    cpus: u32,
    mem_mb: u64,
    nodes: Vec<String>,
}

/// In-memory view of what is currently allocated to running jobs.
///
/// Uses a `BTreeMap` keyed by job id (matching the teacher's preference for
/// deterministic iteration order over running state) so that `reconcile`
/// diagnostics and iteration in tests are reproducible.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    allocations: BTreeMap<u64, Allocation>,
    total_cpus: u32,
    total_mem_mb: u64,
}

impl ResourceLedger {
    pub fn new(total_cpus: u32, total_mem_mb: u64) -> Self {
        Self {
            allocations: BTreeMap::new(),
            total_cpus,
            total_mem_mb,
        }
    }

    /// Rebuild ledger state from the store's `RUNNING` jobs (§4.4 step 0 —
    /// the scheduler re-derives the ledger on every startup instead of
    /// trusting any cached value, per the resolved Open Question on
    /// orphaned rows in SPEC_FULL.md §3).
    pub fn rebuild(&mut self, running_jobs: &[Job]) {
        self.allocations.clear();
        for job in running_jobs {
            self.allocations.insert(
                job.id,
                Allocation {
                    cpus: job.effective_cpus(),
                    mem_mb: job.mem_mb,
                    nodes: job.nodes.clone(),
                },
            );
        }
    }

    pub fn hold(&mut self, job_id: u64, cpus: u32, mem_mb: u64, nodes: Vec<String>) {
        self.allocations.insert(job_id, Allocation { cpus, mem_mb, nodes });
    }

    pub fn release(&mut self, job_id: u64) {
        self.allocations.remove(&job_id);
    }

    /// Adjust a held job's CPU count in place, used by the elastic
    /// controller after a scale event (§4.6).
    pub fn rescale(&mut self, job_id: u64, new_cpus: u32) {
        if let Some(alloc) = self.allocations.get_mut(&job_id) {
            alloc.cpus = new_cpus;
        }
    }

    pub fn used_cpus(&self) -> u32 {
        self.allocations.values().map(|a| a.cpus).sum()
    }

    pub fn used_mem_mb(&self) -> u64 {
        self.allocations.values().map(|a| a.mem_mb).sum()
    }

    pub fn free_cpus(&self) -> u32 {
        self.total_cpus.saturating_sub(self.used_cpus())
    }

    pub fn free_mem_mb(&self) -> u64 {
        self.total_mem_mb.saturating_sub(self.used_mem_mb())
    }

    pub fn cpus_for(&self, job_id: u64) -> Option<u32> {
        self.allocations.get(&job_id).map(|a| a.cpus)
    }

    /// Every node currently held by any running job, for topology-aware
    /// placement's "skip already-used nodes" rule (§4.2, §4.4 step 3).
    pub fn used_nodes(&self) -> HashSet<String> {
        self.allocations
            .values()
            .flat_map(|a| a.nodes.iter().cloned())
            .collect()
    }

    pub fn running_job_ids(&self) -> Vec<u64> {
        self.allocations.keys().copied().collect()
    }

    /// Cluster utilization as the mean of CPU and memory fractional use
    /// (§4.6: the elastic controller's admission signal). Returns 0.0 on a
    /// zero-capacity cluster rather than dividing by zero.
    pub fn utilization_pct(&self) -> f64 {
        let cpu_frac = if self.total_cpus == 0 {
            0.0
        } else {
            self.used_cpus() as f64 / self.total_cpus as f64
        };
        let mem_frac = if self.total_mem_mb == 0 {
            0.0
        } else {
            self.used_mem_mb() as f64 / self.total_mem_mb as f64
        };
        (cpu_frac + mem_frac) / 2.0 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ledger_has_full_free_capacity() {
        let ledger = ResourceLedger::new(8, 16384);
        assert_eq!(ledger.free_cpus(), 8);
        assert_eq!(ledger.free_mem_mb(), 16384);
        assert_eq!(ledger.utilization_pct(), 0.0);
    }

    #[test]
    fn hold_reduces_free_capacity_and_release_restores_it() {
        let mut ledger = ResourceLedger::new(8, 16384);
        ledger.hold(1, 4, 8192, vec!["node1".into()]);
        assert_eq!(ledger.free_cpus(), 4);
        assert_eq!(ledger.free_mem_mb(), 8192);
        ledger.release(1);
        assert_eq!(ledger.free_cpus(), 8);
        assert_eq!(ledger.free_mem_mb(), 16384);
    }

    #[test]
    fn rescale_changes_only_cpu_hold() {
        let mut ledger = ResourceLedger::new(8, 16384);
        ledger.hold(1, 2, 1024, vec![]);
        ledger.rescale(1, 6);
        assert_eq!(ledger.used_cpus(), 6);
        assert_eq!(ledger.used_mem_mb(), 1024);
    }

    #[test]
    fn utilization_is_mean_of_cpu_and_mem_fractions() {
        let mut ledger = ResourceLedger::new(8, 16384);
        ledger.hold(1, 4, 4096, vec![]); // 50% cpu, 25% mem
        assert_eq!(ledger.utilization_pct(), 37.5);
    }

    #[test]
    fn used_nodes_aggregates_across_all_held_jobs() {
        let mut ledger = ResourceLedger::new(8, 16384);
        ledger.hold(1, 1, 128, vec!["node1".into(), "node2".into()]);
        ledger.hold(2, 1, 128, vec!["node3".into()]);
        let mut nodes: Vec<String> = ledger.used_nodes().into_iter().collect();
        nodes.sort();
        assert_eq!(nodes, vec!["node1", "node2", "node3"]);
    }

    #[test]
    fn rebuild_replaces_all_prior_state() {
        let mut ledger = ResourceLedger::new(8, 16384);
        ledger.hold(99, 4, 4096, vec![]);
        let job = crate::job::Job {
            id: 1,
            command: "true".into(),
            cpus: 2,
            mem_mb: 512,
            priority: 0,
            status: crate::job::JobStatus::Running,
            submit_time: 0.0,
            start_time: Some(0.0),
            end_time: None,
            wait_time: Some(0.0),
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
            nodes: vec!["node1".into()],
            cpu_user_time: None,
            cpu_system_time: None,
        };
        ledger.rebuild(&[job]);
        assert_eq!(ledger.running_job_ids(), vec![1]);
        assert_eq!(ledger.used_cpus(), 2);
    }
}
