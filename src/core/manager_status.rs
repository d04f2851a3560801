// src/core/manager_status.rs

//! The two documents that carry cross-process HA state (spec §3): the
//! CRM-owned `ManagerStatus` and the per-node, LRM-owned `LRMStatus`.

use crate::core::config_model::ServiceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The exit-code contract shared between the LRM's resource drivers and the
/// CRM's `next_state_*` transitions (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCode {
    Success,
    Error,
    EWrongNode,
    Ignored,
}

impl ExitCode {
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => ExitCode::Success,
            2 => ExitCode::EWrongNode,
            3 => ExitCode::Ignored,
            _ => ExitCode::Error,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Error => 1,
            ExitCode::EWrongNode => 2,
            ExitCode::Ignored => 3,
        }
    }
}

/// Per-node LRM run mode, driven by local systemd/admin state (spec §4.8(3)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrmMode {
    Active,
    Maintenance,
    Restart,
    Shutdown,
}

/// The CRM-side state machine position of a single service (`sd` in spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStateKind {
    Stopped,
    RequestStop,
    RequestStart,
    RequestStartBalance,
    Started,
    Fence,
    Recovery,
    Migrate,
    Relocate,
    Freeze,
    Error,
}

/// A pending command attached to a service by the CRM command queue (spec §4.7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingCommand {
    Migrate { target: String },
    Relocate { target: String },
    Stop { timeout_secs: u64 },
}

/// The CRM's authoritative runtime record for a single service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    pub state: ServiceStateKind,
    pub node: String,
    pub target: Option<String>,
    pub cmd: Option<PendingCommand>,
    pub uid: String,
    #[serde(default)]
    pub failed_nodes: Vec<String>,
    pub maintenance_node: Option<String>,
    #[serde(default)]
    pub running: bool,
    pub timeout: Option<u64>,
}

impl ServiceState {
    pub fn new(node: impl Into<String>, state: ServiceStateKind, uid: String) -> Self {
        Self {
            state,
            node: node.into(),
            target: None,
            cmd: None,
            uid,
            failed_nodes: Vec::new(),
            maintenance_node: None,
            running: false,
            timeout: None,
        }
    }

    /// Reifies the "read-only except for recovery" exception noted in spec
    /// §9: the recovery path is the only place that moves `sd.node` outside
    /// of the ordinary transition return value.
    pub fn recover_to(&mut self, node: impl Into<String>, fresh_uid: String) {
        self.node = node.into();
        self.target = None;
        self.uid = fresh_uid;
    }

    /// A verbose, user-facing state string combining CRM/LRM/config views
    /// (spec §7, "User-visible behaviour").
    pub fn verbose_state(&self) -> String {
        if self.state == ServiceStateKind::Error {
            format!(
                "error (failed on: {})",
                if self.failed_nodes.is_empty() {
                    "-".to_string()
                } else {
                    self.failed_nodes.join(", ")
                }
            )
        } else if self.running {
            format!("{:?} (running)", self.state).to_lowercase()
        } else {
            format!("{:?}", self.state).to_lowercase()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Online,
    Maintenance,
    Unknown,
    Fence,
    Gone,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRequest {
    pub maintenance: Option<bool>,
}

/// The CRM-owned document: the single shared-mutable structure allowed
/// outside of per-node `LRMStatus` (spec §9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub master_node: String,
    pub timestamp: u64,
    pub node_status: BTreeMap<String, NodeState>,
    #[serde(with = "service_status_serde")]
    pub service_status: BTreeMap<ServiceId, ServiceState>,
    pub node_request: BTreeMap<String, NodeRequest>,
}

/// `ServiceId` isn't a plain string, so `service_status` is (de)serialized
/// through a `sid -> ServiceState` string-keyed map.
mod service_status_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<ServiceId, ServiceState>,
        ser: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let as_strings: BTreeMap<String, &ServiceState> =
            map.iter().map(|(k, v)| (k.to_string(), v)).collect();
        as_strings.serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> std::result::Result<BTreeMap<ServiceId, ServiceState>, D::Error> {
        let as_strings: BTreeMap<String, ServiceState> = BTreeMap::deserialize(de)?;
        as_strings
            .into_iter()
            .map(|(k, v)| {
                ServiceId::parse(&k)
                    .map(|sid| (sid, v))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// A single LRM's report of one worker's exit code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LrmResult {
    pub exit_code: ExitCode,
}

/// The LRM-owned document for a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LrmStatus {
    pub mode: LrmMode,
    pub timestamp: u64,
    pub results: BTreeMap<String, LrmResult>,
}

impl Default for LrmStatus {
    fn default() -> Self {
        Self {
            mode: LrmMode::Active,
            timestamp: 0,
            results: BTreeMap::new(),
        }
    }
}

/// Mints a fresh, opaque per-transition token (spec §3 "UID"). Regenerated
/// on every CRM-side state transition and whenever the manager intentionally
/// re-requests an LRM attempt on the same state (spec §4.6 "Tie-breaks").
pub fn new_uid() -> String {
    let mut bytes = [0u8; 12];
    getrandom::fill(&mut bytes).expect("system RNG must be available");
    hex::encode(bytes)
}
