// src/core/config_model.rs

//! Parses and validates the cluster-KV-native configuration documents named
//! in spec §6: `resources.cfg`, `groups.cfg`, `fence.cfg` and the datacenter
//! (HA-wide) settings. None of these are TOML/JSON, so they get small
//! hand-written line parsers instead of a serde derive.

use crate::core::errors::{ClusterHaError, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies a managed service as `"<type>:<name>"`, e.g. `vm:100`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId {
    pub ty: String,
    pub name: String,
}

impl ServiceId {
    pub fn new(ty: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            name: name.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (ty, name) = s
            .split_once(':')
            .ok_or_else(|| ClusterHaError::InvalidConfig(format!("malformed service id '{s}'")))?;
        if ty.is_empty() || name.is_empty() {
            return Err(ClusterHaError::InvalidConfig(format!(
                "malformed service id '{s}'"
            )));
        }
        Ok(Self::new(ty, name))
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ty, self.name)
    }
}

/// The configured target state of a service, as set by an administrator.
/// `Enabled` is a pure alias of `Started`, folded away at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfiguredState {
    Started,
    Stopped,
    Disabled,
    Ignored,
}

impl ConfiguredState {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "started" | "enabled" => Ok(Self::Started),
            "stopped" => Ok(Self::Stopped),
            "disabled" => Ok(Self::Disabled),
            "ignored" => Ok(Self::Ignored),
            other => Err(ClusterHaError::InvalidConfig(format!(
                "unknown service state '{other}'"
            ))),
        }
    }
}

/// Static, admin-authored configuration for a single service (`cd` in spec).
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub node: String,
    pub state: ConfiguredState,
    pub group: Option<String>,
    pub failback: bool,
    pub max_restart: u32,
    pub max_relocate: u32,
    pub comment: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            node: String::new(),
            state: ConfiguredState::Stopped,
            group: None,
            failback: true,
            max_restart: 1,
            max_relocate: 1,
            comment: None,
        }
    }
}

/// A named placement policy: per-node priorities plus the restricted/nofailback flags.
#[derive(Debug, Clone, Default)]
pub struct Group {
    /// Higher priority wins.
    pub nodes: BTreeMap<String, i64>,
    pub restricted: bool,
    pub nofailback: bool,
}

/// Cluster-wide HA settings (datacenter config).
#[derive(Debug, Clone)]
pub struct DatacenterConfig {
    pub rebalance_on_start: bool,
    pub scheduler: SchedulerKind,
    pub fence_mode: FenceMode,
    /// Per-node `{cpus, memory}` for `crs static` (spec §4.4, C6). Only
    /// consulted when `scheduler` is `Static`; a node missing here makes
    /// `StaticScheduler` fail closed to basic counting for every node.
    pub node_capacity: BTreeMap<String, NodeCapacity>,
}

impl Default for DatacenterConfig {
    fn default() -> Self {
        Self {
            rebalance_on_start: false,
            scheduler: SchedulerKind::Basic,
            fence_mode: FenceMode::Watchdog,
            node_capacity: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NodeCapacity {
    pub cpus: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Basic,
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceMode {
    Watchdog,
    Hardware,
}

/// One fence device: an agent invoked against a single node.
#[derive(Debug, Clone)]
pub struct FenceDeviceConfig {
    pub name: String,
    pub agent: String,
    pub params: BTreeMap<String, String>,
    pub timeout_secs: u64,
}

/// The fence configuration for one node: an ordered list of device groups.
/// The overall fence succeeds when any one group succeeds; a group succeeds
/// only when every device in it succeeds.
#[derive(Debug, Clone, Default)]
pub struct NodeFenceConfig {
    pub groups: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct FenceConfig {
    pub devices: BTreeMap<String, FenceDeviceConfig>,
    pub nodes: BTreeMap<String, NodeFenceConfig>,
}

/// Splits `resources.cfg`/`groups.cfg`/`fence.cfg` text into sections, each
/// headed by an unindented `key: value` line and followed by indented
/// `key value` body lines, terminated by a blank line or the next header.
fn split_sections(text: &str) -> Vec<(String, String, Vec<(String, String)>)> {
    let mut sections = Vec::new();
    let mut cur: Option<(String, String, Vec<(String, String)>)> = None;

    for raw_line in text.lines() {
        if raw_line.trim().is_empty() {
            continue;
        }
        if !raw_line.starts_with(char::is_whitespace) {
            if let Some(done) = cur.take() {
                sections.push(done);
            }
            if let Some((head, rest)) = raw_line.split_once(':') {
                cur = Some((head.trim().to_string(), rest.trim().to_string(), Vec::new()));
            }
            continue;
        }
        if let Some((_, _, body)) = cur.as_mut() {
            let trimmed = raw_line.trim();
            if let Some((key, val)) = trimmed.split_once(char::is_whitespace) {
                body.push((key.trim().to_string(), val.trim().to_string()));
            } else if !trimmed.is_empty() {
                body.push((trimmed.to_string(), String::new()));
            }
        }
    }
    if let Some(done) = cur.take() {
        sections.push(done);
    }
    sections
}

pub fn parse_resources_cfg(text: &str) -> Result<BTreeMap<ServiceId, ServiceConfig>> {
    let mut out = BTreeMap::new();
    for (ty, name, body) in split_sections(text) {
        let sid = ServiceId::new(ty, name);
        let mut cd = ServiceConfig::default();
        for (key, val) in body {
            match key.as_str() {
                "node" => cd.node = val,
                "state" => cd.state = ConfiguredState::parse(&val)?,
                "group" => cd.group = Some(val),
                "failback" => cd.failback = val != "0",
                "max_restart" => cd.max_restart = val.parse()?,
                "max_relocate" => cd.max_relocate = val.parse()?,
                "comment" => cd.comment = Some(val),
                other => {
                    tracing::warn!(service = %sid, key = other, "ignoring unknown resources.cfg key");
                }
            }
        }
        if cd.node.is_empty() {
            return Err(ClusterHaError::InvalidConfig(format!(
                "service '{sid}' has no node"
            )));
        }
        out.insert(sid, cd);
    }
    Ok(out)
}

pub fn parse_groups_cfg(text: &str) -> Result<BTreeMap<String, Group>> {
    let mut out = BTreeMap::new();
    for (head, id, body) in split_sections(text) {
        if head != "group" {
            continue;
        }
        let mut group = Group::default();
        for (key, val) in body {
            match key.as_str() {
                "nodes" => {
                    for entry in val.split(',') {
                        let entry = entry.trim();
                        if entry.is_empty() {
                            continue;
                        }
                        match entry.split_once(':') {
                            Some((node, pri)) => {
                                group.nodes.insert(node.to_string(), pri.parse()?);
                            }
                            None => {
                                group.nodes.insert(entry.to_string(), 0);
                            }
                        }
                    }
                }
                "restricted" => group.restricted = val != "0",
                "nofailback" => group.nofailback = val != "0",
                other => {
                    tracing::warn!(group = %id, key = other, "ignoring unknown groups.cfg key");
                }
            }
        }
        out.insert(id, group);
    }
    Ok(out)
}

pub fn parse_fence_cfg(text: &str) -> Result<FenceConfig> {
    let mut cfg = FenceConfig::default();
    for (head, id, body) in split_sections(text) {
        match head.as_str() {
            "device" => {
                let mut device = FenceDeviceConfig {
                    name: id.clone(),
                    agent: String::new(),
                    params: BTreeMap::new(),
                    timeout_secs: 20,
                };
                for (key, val) in body {
                    match key.as_str() {
                        "agent" => device.agent = val,
                        "timeout" => device.timeout_secs = val.parse()?,
                        other => {
                            device.params.insert(other.to_string(), val);
                        }
                    }
                }
                if device.agent.is_empty() {
                    return Err(ClusterHaError::InvalidConfig(format!(
                        "fence device '{id}' has no agent"
                    )));
                }
                cfg.devices.insert(id, device);
            }
            "node" => {
                let mut node_cfg = NodeFenceConfig::default();
                for (key, val) in body {
                    if key == "group" {
                        node_cfg.groups.push(
                            val.split(',')
                                .map(|s| s.trim().to_string())
                                .filter(|s| !s.is_empty())
                                .collect(),
                        );
                    }
                }
                cfg.nodes.insert(id, node_cfg);
            }
            other => {
                tracing::warn!(section = other, "ignoring unknown fence.cfg section");
            }
        }
    }
    Ok(cfg)
}

pub fn parse_datacenter_cfg(text: &str) -> Result<DatacenterConfig> {
    let mut dc = DatacenterConfig::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, val)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let val = val.trim();
        match key.trim() {
            "ha-rebalance-on-start" => dc.rebalance_on_start = val != "0",
            "crs" => {
                dc.scheduler = match val {
                    "static" => SchedulerKind::Static,
                    _ => SchedulerKind::Basic,
                }
            }
            "fencing" => {
                dc.fence_mode = match val {
                    "hardware" => FenceMode::Hardware,
                    _ => FenceMode::Watchdog,
                }
            }
            "node-cpus" => {
                for entry in val.split(',') {
                    let entry = entry.trim();
                    if entry.is_empty() {
                        continue;
                    }
                    if let Some((node, cpus)) = entry.split_once(':') {
                        dc.node_capacity.entry(node.to_string()).or_default().cpus = cpus.parse()?;
                    }
                }
            }
            "node-memory" => {
                for entry in val.split(',') {
                    let entry = entry.trim();
                    if entry.is_empty() {
                        continue;
                    }
                    if let Some((node, mem)) = entry.split_once(':') {
                        dc.node_capacity.entry(node.to_string()).or_default().memory_bytes = mem.parse()?;
                    }
                }
            }
            other => tracing::warn!(key = other, "ignoring unknown datacenter.cfg key"),
        }
    }
    Ok(dc)
}
