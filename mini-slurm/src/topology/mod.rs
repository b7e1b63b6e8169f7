//! Topology Model (C2, §3.2, §4.2).
//!
//! Mirrors `TopologyConfig` in the Python original and the teacher's
//! `config::NodeConfigManager` in spirit (a loaded, queryable map of static
//! hardware facts), but the wire format here is the original's line-oriented
//! `SwitchName=...` grammar (§6.3), not YAML — so this module owns its own
//! small parser instead of delegating to `serde_yaml`.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::{info, warn};

/// Switch kind in the topology tree (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchKind {
    Leaf,
    Core,
}

#[derive(Debug, Clone)]
struct SwitchInfo {
    kind: SwitchKind,
    parent: Option<String>,
    children: Vec<String>,
}

/// Static per-node capacity used by the default topology and by
/// [`Topology::find_best_nodes`]'s per-node capacity check.
#[derive(Debug, Clone, Copy)]
pub struct NodeCapacity {
    pub cpus: u32,
    pub mem_mb: u64,
}

/// A static tree of switches and leaf nodes (§3.2), with distance and
/// best-fit node selection (§4.2).
#[derive(Debug, Clone)]
pub struct Topology {
    enabled: bool,
    switches: HashMap<String, SwitchInfo>,
    node_to_switch: HashMap<String, String>,
    nodes: HashMap<String, NodeCapacity>,
    /// Per-node CPU/mem used by the default topology's admission math when a
    /// job needs more than one node's worth of CPUs (§4.4 step 3).
    pub cpus_per_node: u32,
    pub mem_per_node: u64,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            enabled: false,
            switches: HashMap::new(),
            node_to_switch: HashMap::new(),
            nodes: HashMap::new(),
            cpus_per_node: 1,
            mem_per_node: 1024,
        }
    }
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.nodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_capacity(&self, name: &str) -> Option<NodeCapacity> {
        self.nodes.get(name).copied()
    }

    /// Build the default topology (§3.2 "Default topology"): one virtual
    /// node per CPU, grouped four-per-leaf-switch, with a single core switch
    /// parenting all leaf switches when there is more than one.
    pub fn default_for_cluster(total_cpus: u32, total_mem_mb: u64) -> Self {
        const NODES_PER_SWITCH: u32 = 4;
        let num_nodes = total_cpus.max(1);
        let num_switches = num_nodes.div_ceil(NODES_PER_SWITCH);
        let mem_per_node = total_mem_mb / num_nodes as u64;

        let mut topo = Topology {
            enabled: true,
            cpus_per_node: 1,
            mem_per_node,
            ..Default::default()
        };

        for i in 0..num_nodes {
            let node_name = format!("node{}", i + 1);
            let switch_name = format!("switch{}", i / NODES_PER_SWITCH + 1);
            topo.nodes.insert(
                node_name.clone(),
                NodeCapacity {
                    cpus: 1,
                    mem_mb: mem_per_node,
                },
            );
            topo.node_to_switch
                .insert(node_name.clone(), switch_name.clone());
            topo.switches.entry(switch_name).or_insert(SwitchInfo {
                kind: SwitchKind::Leaf,
                parent: None,
                children: vec![],
            });
        }

        if num_switches > 1 {
            let core_name = "core1".to_string();
            let mut children = Vec::new();
            for i in 0..num_switches {
                let leaf = format!("switch{}", i + 1);
                if let Some(sw) = topo.switches.get_mut(&leaf) {
                    sw.parent = Some(core_name.clone());
                    children.push(leaf);
                }
            }
            topo.switches.insert(
                core_name,
                SwitchInfo {
                    kind: SwitchKind::Core,
                    parent: None,
                    children,
                },
            );
        }

        topo
    }

    /// Parse the topology config grammar (§6.3). Returns `Ok(true)` if the
    /// file enables topology-aware scheduling, `Ok(false)` if it parses but
    /// disables it (e.g. `TopologyPlugin=no`), and propagates an IO error if
    /// the file cannot be read.
    pub fn load(&mut self, path: &std::path::Path) -> std::io::Result<bool> {
        let content = std::fs::read_to_string(path)?;
        self.enabled = true;

        let switch_line =
            Regex::new(r"^SwitchName=(\S+)\s+(Nodes|Switches)=(.+)$").expect("valid regex");

        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if key == "TopologyPlugin" {
                    let value = value.trim().to_ascii_lowercase();
                    self.enabled = matches!(
                        value.as_str(),
                        "topology/tree" | "topology" | "yes" | "1" | "true"
                    );
                    continue;
                }
            }

            if let Some(caps) = switch_line.captures(line) {
                let switch_name = caps[1].to_string();
                let link_type = &caps[2];
                let targets = Self::parse_range(&caps[3]);

                self.switches.entry(switch_name.clone()).or_insert(SwitchInfo {
                    kind: SwitchKind::Leaf,
                    parent: None,
                    children: vec![],
                });

                match link_type {
                    "Nodes" => {
                        for node in targets {
                            self.node_to_switch.insert(node.clone(), switch_name.clone());
                            self.nodes.entry(node).or_insert(NodeCapacity {
                                cpus: self.cpus_per_node,
                                mem_mb: self.mem_per_node,
                            });
                        }
                    }
                    "Switches" => {
                        if let Some(sw) = self.switches.get_mut(&switch_name) {
                            sw.kind = SwitchKind::Core;
                        }
                        for child in targets {
                            let existing = self.switches.contains_key(&child);
                            if existing {
                                if let Some(child_sw) = self.switches.get_mut(&child) {
                                    child_sw.parent = Some(switch_name.clone());
                                }
                            } else {
                                self.switches.insert(
                                    child.clone(),
                                    SwitchInfo {
                                        kind: SwitchKind::Leaf,
                                        parent: Some(switch_name.clone()),
                                        children: vec![],
                                    },
                                );
                            }
                            if let Some(parent_sw) = self.switches.get_mut(&switch_name) {
                                parent_sw.children.push(child);
                            }
                        }
                    }
                    _ => unreachable!("regex only captures Nodes|Switches"),
                }
            }
        }

        if self.enabled {
            info!(nodes = self.nodes.len(), switches = self.switches.len(), path = %path.display(), "topology-aware scheduling enabled");
        } else {
            warn!(path = %path.display(), "topology config parsed but TopologyPlugin disabled");
        }

        Ok(self.enabled)
    }

    /// Parse `prefix[a-b]` (inclusive) or a comma-separated list (§6.3).
    fn parse_range(spec: &str) -> Vec<String> {
        let bracket = Regex::new(r"^(\w+)\[(\d+)-(\d+)\]$").expect("valid regex");
        if let Some(caps) = bracket.captures(spec.trim()) {
            let prefix = &caps[1];
            let start: u64 = caps[2].parse().unwrap_or(0);
            let end: u64 = caps[3].parse().unwrap_or(0);
            (start..=end).map(|i| format!("{prefix}{i}")).collect()
        } else {
            spec.split(',').map(|s| s.trim().to_string()).collect()
        }
    }

    /// Node distance (§3.2): 0 for identical nodes or nodes sharing a leaf
    /// switch; otherwise the sum of hops from each node up to their lowest
    /// common ancestor switch. A sentinel (999) for nodes absent from the
    /// topology.
    pub fn distance(&self, a: &str, b: &str) -> u32 {
        if a == b {
            return 0;
        }
        let (Some(switch_a), Some(switch_b)) =
            (self.node_to_switch.get(a), self.node_to_switch.get(b))
        else {
            return 999;
        };
        if switch_a == switch_b {
            return 0;
        }

        let path_a = self.switch_path(switch_a);
        let path_b = self.switch_path(switch_b);

        let mut common_depth = 0usize;
        for (sa, sb) in path_a.iter().zip(path_b.iter()) {
            if sa == sb {
                common_depth += 1;
            } else {
                break;
            }
        }

        ((path_a.len() - common_depth) + (path_b.len() - common_depth)) as u32
    }

    /// Root-to-switch path, used by [`Self::distance`] to find the LCA.
    fn switch_path(&self, switch_name: &str) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = Some(switch_name.to_string());
        while let Some(name) = current {
            path.insert(0, name.clone());
            current = self.switches.get(&name).and_then(|s| s.parent.clone());
        }
        path
    }

    /// Select `num_nodes` currently-free nodes with sufficient per-node
    /// capacity, preferring a single leaf switch (§4.2).
    ///
    /// Falls back to a greedy nearest-first expansion when no single leaf
    /// switch has enough free, sufficiently-sized nodes. Returns `None` if
    /// fewer than `num_nodes` qualifying free nodes exist anywhere.
    pub fn find_best_nodes(
        &self,
        num_nodes: u32,
        cpus_per_node: u32,
        mem_per_node: u64,
        used: &HashSet<String>,
    ) -> Option<Vec<String>> {
        let num_nodes = num_nodes as usize;

        // Iteration order follows HashMap's arbitrary but stable-within-a-run
        // order, matching the Python original's dict iteration order — the
        // spec's tie-break is "first sufficient leaf in iteration order",
        // not "the fullest leaf" (§9).
        let available: Vec<&String> = self
            .nodes
            .iter()
            .filter(|(name, cap)| {
                !used.contains(name.as_str())
                    && cap.cpus >= cpus_per_node
                    && cap.mem_mb >= mem_per_node
            })
            .map(|(name, _)| name)
            .collect();

        if available.len() < num_nodes {
            return None;
        }

        let mut switch_to_nodes: HashMap<&str, Vec<&String>> = HashMap::new();
        for node in &available {
            if let Some(switch) = self.node_to_switch.get(node.as_str()) {
                switch_to_nodes.entry(switch.as_str()).or_default().push(node);
            }
        }
        for nodes in switch_to_nodes.values() {
            if nodes.len() >= num_nodes {
                return Some(nodes.iter().take(num_nodes).map(|s| s.to_string()).collect());
            }
        }

        if available.is_empty() {
            return None;
        }

        let mut selected: Vec<String> = vec![available[0].clone()];
        let mut remaining: Vec<String> = available[1..].iter().map(|s| s.to_string()).collect();

        while selected.len() < num_nodes && !remaining.is_empty() {
            let mut best_idx = None;
            let mut best_distance = u32::MAX;
            for (idx, candidate) in remaining.iter().enumerate() {
                let min_dist = selected
                    .iter()
                    .map(|sel| self.distance(candidate, sel))
                    .min()
                    .unwrap_or(u32::MAX);
                if min_dist < best_distance {
                    best_distance = min_dist;
                    best_idx = Some(idx);
                }
            }
            match best_idx {
                Some(idx) => selected.push(remaining.remove(idx)),
                None => break,
            }
        }

        if selected.len() == num_nodes {
            Some(selected)
        } else {
            None
        }
    }
}
