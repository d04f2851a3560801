// src/core/scheduler.rs

//! Usage scheduler (spec §4.4, C6): pluggable node scoring. Lower score
//! wins. `recompute_online_node_usage` (called by the CRM) rebuilds these
//! counters from scratch every tick; they are never incremental.

use crate::core::config_model::ServiceId;
use crate::core::registry::ServiceStaticStats;
use std::collections::BTreeMap;

pub trait UsageScheduler: Send + Sync {
    /// Registers a node so it participates in scoring even before any
    /// service has been charged to it.
    fn add_node(&mut self, node: &str);

    /// Charges `sid`'s load to `node`. `source`/`target` distinguish a
    /// service's current placement from a relocation candidate the caller
    /// is probing, matching spec §4.4's signature.
    fn add_service_usage_to_node(&mut self, node: &str, sid: &ServiceId, stats: Option<&ServiceStaticStats>);

    /// Scores every known node for starting `sid`; lower is better. `current`
    /// is excluded from nothing special here; callers decide what to do
    /// with ties via node-name ordering (spec §4.5 step 8).
    fn score_nodes(&self, sid: &ServiceId) -> BTreeMap<String, f64>;

    fn reset(&mut self);
}

/// Counts services currently accounted to each node. Ties are broken by the
/// caller sorting `(score, node_name)`.
#[derive(Debug, Default)]
pub struct BasicScheduler {
    counts: BTreeMap<String, u64>,
}

impl UsageScheduler for BasicScheduler {
    fn add_node(&mut self, node: &str) {
        self.counts.entry(node.to_string()).or_insert(0);
    }

    fn add_service_usage_to_node(
        &mut self,
        node: &str,
        _sid: &ServiceId,
        _stats: Option<&ServiceStaticStats>,
    ) {
        *self.counts.entry(node.to_string()).or_insert(0) += 1;
    }

    fn score_nodes(&self, _sid: &ServiceId) -> BTreeMap<String, f64> {
        self.counts.iter().map(|(n, c)| (n.clone(), *c as f64)).collect()
    }

    fn reset(&mut self) {
        for v in self.counts.values_mut() {
            *v = 0;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct NodeCapacity {
    cpus: f64,
    memory: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct NodeLoad {
    cpu: f64,
    mem: u64,
}

/// Weighted CPU/memory utilisation: `cpu_share^2 + mem_share^2`. Falls back
/// to basic counting if a node's static capacity is unknown (spec §4.4:
/// "Fails-closed to basic if static stats are unavailable").
#[derive(Debug, Default)]
pub struct StaticScheduler {
    capacity: BTreeMap<String, NodeCapacity>,
    load: BTreeMap<String, NodeLoad>,
    fallback: BasicScheduler,
}

impl StaticScheduler {
    pub fn set_node_capacity(&mut self, node: &str, cpus: f64, memory_bytes: u64) {
        self.capacity.insert(
            node.to_string(),
            NodeCapacity {
                cpus,
                memory: memory_bytes,
            },
        );
    }
}

impl UsageScheduler for StaticScheduler {
    fn add_node(&mut self, node: &str) {
        self.load.entry(node.to_string()).or_default();
        self.fallback.add_node(node);
    }

    fn add_service_usage_to_node(
        &mut self,
        node: &str,
        sid: &ServiceId,
        stats: Option<&ServiceStaticStats>,
    ) {
        self.fallback.add_service_usage_to_node(node, sid, stats);
        let Some(stats) = stats else { return };
        let entry = self.load.entry(node.to_string()).or_default();
        entry.cpu += stats.max_cpu;
        entry.mem += stats.max_mem_bytes;
    }

    fn score_nodes(&self, sid: &ServiceId) -> BTreeMap<String, f64> {
        let mut scores = BTreeMap::new();
        for (node, cap) in &self.capacity {
            let load = self.load.get(node).copied().unwrap_or_default();
            if cap.cpus <= 0.0 || cap.memory == 0 {
                continue;
            }
            let cpu_share = load.cpu / cap.cpus;
            let mem_share = load.mem as f64 / cap.memory as f64;
            scores.insert(node.clone(), cpu_share * cpu_share + mem_share * mem_share);
        }
        if scores.len() != self.load.len() {
            // At least one known node lacks static capacity; fail closed to
            // basic scoring for everybody so the ranking stays consistent.
            return self.fallback.score_nodes(sid);
        }
        scores
    }

    fn reset(&mut self) {
        for v in self.load.values_mut() {
            *v = NodeLoad::default();
        }
        self.fallback.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_scheduler_counts_services() {
        let mut sched = BasicScheduler::default();
        sched.add_node("n1");
        sched.add_node("n2");
        let sid = ServiceId::new("vm", "100");
        sched.add_service_usage_to_node("n1", &sid, None);
        sched.add_service_usage_to_node("n1", &sid, None);
        let scores = sched.score_nodes(&sid);
        assert_eq!(scores["n1"], 2.0);
        assert_eq!(scores["n2"], 0.0);
    }

    #[test]
    fn static_scheduler_falls_back_without_capacity() {
        let mut sched = StaticScheduler::default();
        sched.add_node("n1");
        let sid = ServiceId::new("vm", "100");
        sched.add_service_usage_to_node("n1", &sid, None);
        // No capacity configured at all -> falls back to basic counting.
        let scores = sched.score_nodes(&sid);
        assert_eq!(scores["n1"], 1.0);
    }

    #[test]
    fn static_scheduler_weights_cpu_and_memory() {
        let mut sched = StaticScheduler::default();
        sched.set_node_capacity("n1", 4.0, 8_000_000_000);
        sched.set_node_capacity("n2", 4.0, 8_000_000_000);
        sched.add_node("n1");
        sched.add_node("n2");
        let sid = ServiceId::new("vm", "100");
        let stats = ServiceStaticStats {
            max_cpu: 2.0,
            max_mem_bytes: 4_000_000_000,
        };
        sched.add_service_usage_to_node("n1", &sid, Some(&stats));
        let scores = sched.score_nodes(&sid);
        assert!(scores["n1"] > scores["n2"]);
    }
}
