// src/core/node_status.rs

//! Node status tracker (spec §4.2, C5): the per-node state machine the CRM
//! drives every tick from cluster membership and reported LRM modes.

use crate::core::manager_status::{LrmMode, NodeState};
use std::collections::HashMap;

/// How long a node must be continuously non-online before it's eligible for
/// fencing (spec §4.2 `node_is_offline_delayed`).
pub const FENCE_DELAY_SECS: u64 = 60;

/// How long a `gone` node sits around before its entry is dropped entirely
/// (spec §4.2, "gone" row, "delayed-offline: delete entry").
pub const GONE_EXPIRY_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy)]
struct Tracked {
    state: NodeState,
    last_online: Option<u64>,
}

/// Drives the online/maintenance/unknown/fence/gone state machine for every
/// node the CRM has ever seen.
#[derive(Debug, Default)]
pub struct NodeStatusTracker {
    nodes: HashMap<String, Tracked>,
}

impl NodeStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_of(&self, node: &str) -> NodeState {
        self.nodes
            .get(node)
            .map(|t| t.state)
            .unwrap_or(NodeState::Unknown)
    }

    pub fn snapshot(&self) -> HashMap<String, NodeState> {
        self.nodes.iter().map(|(n, t)| (n.clone(), t.state)).collect()
    }

    /// Applies one CRM tick's membership + LRM-mode observation for `node`,
    /// per the transition table in spec §4.2. `present` is false when the
    /// node has been deleted from cluster membership entirely.
    pub fn observe(&mut self, node: &str, now: u64, online: bool, present: bool, mode: Option<LrmMode>) {
        let entry = self.nodes.entry(node.to_string()).or_insert(Tracked {
            state: NodeState::Unknown,
            last_online: None,
        });

        if online {
            entry.last_online = Some(now);
        }

        entry.state = match entry.state {
            NodeState::Online => {
                if !present || !online {
                    NodeState::Unknown
                } else if mode == Some(LrmMode::Maintenance) {
                    NodeState::Maintenance
                } else {
                    NodeState::Online
                }
            }
            NodeState::Maintenance => {
                if !present || !online {
                    NodeState::Unknown
                } else if mode != Some(LrmMode::Maintenance) {
                    NodeState::Online
                } else {
                    NodeState::Maintenance
                }
            }
            NodeState::Unknown => {
                if !present {
                    NodeState::Gone
                } else if online {
                    NodeState::Online
                } else {
                    NodeState::Unknown
                }
            }
            // `fence` only advances via `enter_fence`/`confirm_fenced` below;
            // it never reverts on its own (spec §4.2 "fence" row: "wait").
            NodeState::Fence => NodeState::Fence,
            NodeState::Gone => {
                if online {
                    NodeState::Online
                } else {
                    NodeState::Gone
                }
            }
        };
    }

    /// Called by the CRM's fencing block (spec §4.6 step 9) when a service
    /// on `node` enters the `fence` state.
    pub fn enter_fence(&mut self, node: &str) {
        self.nodes
            .entry(node.to_string())
            .or_insert(Tracked {
                state: NodeState::Unknown,
                last_online: None,
            })
            .state = NodeState::Fence;
    }

    /// Called once fencing succeeds (spec §4.3: "the node's state
    /// transitions to `unknown` so that recovery may proceed").
    pub fn confirm_fenced(&mut self, node: &str) {
        if let Some(t) = self.nodes.get_mut(node) {
            t.state = NodeState::Unknown;
        }
    }

    /// Drops long-gone nodes whose membership gap exceeds `GONE_EXPIRY_SECS`.
    pub fn expire_gone(&mut self, now: u64) {
        self.nodes.retain(|_, t| {
            !(t.state == NodeState::Gone
                && t.last_online
                    .map(|lo| now.saturating_sub(lo) > GONE_EXPIRY_SECS)
                    .unwrap_or(true))
        });
    }

    /// True only if `node` has been continuously non-online for `delay`
    /// seconds (spec §4.2 `node_is_offline_delayed`).
    pub fn is_offline_delayed(&self, node: &str, now: u64, delay: u64) -> bool {
        match self.nodes.get(node) {
            Some(t) if t.state == NodeState::Online || t.state == NodeState::Maintenance => false,
            Some(t) => match t.last_online {
                Some(lo) => now.saturating_sub(lo) >= delay,
                None => true,
            },
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_node_tracks_maintenance_transition() {
        let mut tracker = NodeStatusTracker::new();
        tracker.observe("n1", 0, true, true, Some(LrmMode::Active));
        assert_eq!(tracker.state_of("n1"), NodeState::Online);

        tracker.observe("n1", 10, true, true, Some(LrmMode::Maintenance));
        assert_eq!(tracker.state_of("n1"), NodeState::Maintenance);

        tracker.observe("n1", 20, true, true, Some(LrmMode::Active));
        assert_eq!(tracker.state_of("n1"), NodeState::Online);
    }

    #[test]
    fn offline_delay_requires_continuous_gap() {
        let mut tracker = NodeStatusTracker::new();
        tracker.observe("n1", 0, true, true, Some(LrmMode::Active));
        tracker.observe("n1", 5, false, true, None);
        assert!(!tracker.is_offline_delayed("n1", 10, FENCE_DELAY_SECS));
        assert!(tracker.is_offline_delayed("n1", 5 + FENCE_DELAY_SECS, FENCE_DELAY_SECS));
    }

    #[test]
    fn deleted_from_membership_goes_gone_then_expires() {
        let mut tracker = NodeStatusTracker::new();
        tracker.observe("n1", 0, true, true, Some(LrmMode::Active));
        tracker.observe("n1", 5, false, false, None); // unknown
        tracker.observe("n1", 6, false, false, None); // gone
        assert_eq!(tracker.state_of("n1"), NodeState::Gone);

        tracker.expire_gone(6 + GONE_EXPIRY_SECS);
        assert!(!tracker.expire_gone_contains("n1"));
    }

    impl NodeStatusTracker {
        fn expire_gone_contains(&self, node: &str) -> bool {
            self.nodes.contains_key(node)
        }
    }

    #[test]
    fn fence_state_only_clears_via_confirm_fenced() {
        let mut tracker = NodeStatusTracker::new();
        tracker.observe("n1", 0, true, true, Some(LrmMode::Active));
        tracker.enter_fence("n1");
        tracker.observe("n1", 10, false, true, None);
        assert_eq!(tracker.state_of("n1"), NodeState::Fence);
        tracker.confirm_fenced("n1");
        assert_eq!(tracker.state_of("n1"), NodeState::Unknown);
    }
}
