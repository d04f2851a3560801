// src/core/notify.rs

//! The `fencing` notification template payload (spec §6, "Notifications").
//! Template rendering itself is out of scope (spec §1); this module only
//! defines the event shape the `Environment` hands to whatever renderer is
//! wired in, and the two events the fence orchestrator actually raises.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FenceStatus {
    Fence,
    Succeed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FencingEvent {
    pub fence_prefix: String,
    pub fence_status: FenceStatus,
    pub failed_node: String,
    pub master_node: String,
    pub fence_timestamp: u64,
    pub nodes: Vec<String>,
    pub resources: Vec<String>,
}

impl FencingEvent {
    pub fn new(
        status: FenceStatus,
        failed_node: impl Into<String>,
        master_node: impl Into<String>,
        timestamp: u64,
        nodes: Vec<String>,
        resources: Vec<String>,
    ) -> Self {
        Self {
            fence_prefix: "HA fencing".to_string(),
            fence_status: status,
            failed_node: failed_node.into(),
            master_node: master_node.into(),
            fence_timestamp: timestamp,
            nodes,
            resources,
        }
    }
}
