// src/config.rs

//! Process-level configuration: the `clusterha.toml` a CRM or LRM process is
//! started with, plus the cluster-KV-relative paths to the hand-rolled
//! `resources.cfg`/`groups.cfg`/`fence.cfg`/datacenter documents (spec §6).

use crate::core::crm::CrmSettings;
use crate::core::errors::{ClusterHaError, Result};
use crate::core::lrm::LrmSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_cluster_dir() -> String {
    "/etc/pve".to_string()
}
fn default_tick_secs() -> u64 {
    10
}
fn default_fence_delay_secs() -> u64 {
    60
}
fn default_lock_lifetime_secs() -> u64 {
    120
}
fn default_max_workers() -> usize {
    4
}
fn default_log_level() -> String {
    "info".to_string()
}

/// The on-disk shape of `clusterha.toml`. CRM and LRM processes on the same
/// host share one file; each reads only the settings it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the cluster filesystem mount (spec §6). Unused by
    /// `SimEnvironment`-driven tests; consumed only when constructing a
    /// `RealEnvironment` in `main.rs`.
    #[serde(default = "default_cluster_dir")]
    pub cluster_dir: String,

    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    #[serde(default = "default_fence_delay_secs")]
    pub fence_delay_secs: u64,

    #[serde(default = "default_lock_lifetime_secs")]
    pub lock_lifetime_secs: u64,

    #[serde(default = "default_max_workers")]
    pub lrm_max_workers: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub paths: ConfigPaths,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_dir: default_cluster_dir(),
            tick_secs: default_tick_secs(),
            fence_delay_secs: default_fence_delay_secs(),
            lock_lifetime_secs: default_lock_lifetime_secs(),
            lrm_max_workers: default_max_workers(),
            log_level: default_log_level(),
            paths: ConfigPaths::default(),
        }
    }
}

/// Cluster-KV-relative paths to the documents named in spec §6. Overridable
/// so tests and unusual deployments can point them elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    #[serde(default = "ConfigPaths::default_manager_status")]
    pub manager_status: String,
    #[serde(default = "ConfigPaths::default_lrm_status_dir")]
    pub lrm_status_dir: String,
    #[serde(default = "ConfigPaths::default_crm_commands")]
    pub crm_commands: String,
    #[serde(default = "ConfigPaths::default_resources_cfg")]
    pub resources_cfg: String,
    #[serde(default = "ConfigPaths::default_groups_cfg")]
    pub groups_cfg: String,
    #[serde(default = "ConfigPaths::default_fence_cfg")]
    pub fence_cfg: String,
    #[serde(default = "ConfigPaths::default_datacenter_cfg")]
    pub datacenter_cfg: String,
}

impl ConfigPaths {
    fn default_manager_status() -> String {
        "ha/manager_status".to_string()
    }
    fn default_lrm_status_dir() -> String {
        "ha/lrm_status".to_string()
    }
    fn default_crm_commands() -> String {
        "ha/crm_commands".to_string()
    }
    fn default_resources_cfg() -> String {
        "ha/resources.cfg".to_string()
    }
    fn default_groups_cfg() -> String {
        "ha/groups.cfg".to_string()
    }
    fn default_fence_cfg() -> String {
        "ha/fence.cfg".to_string()
    }
    fn default_datacenter_cfg() -> String {
        "datacenter.cfg".to_string()
    }

    fn lrm_mode_request(&self, node: &str) -> String {
        format!("ha/lrm_mode_request/{node}")
    }
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            manager_status: Self::default_manager_status(),
            lrm_status_dir: Self::default_lrm_status_dir(),
            crm_commands: Self::default_crm_commands(),
            resources_cfg: Self::default_resources_cfg(),
            groups_cfg: Self::default_groups_cfg(),
            fence_cfg: Self::default_fence_cfg(),
            datacenter_cfg: Self::default_datacenter_cfg(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| ClusterHaError::InvalidConfig(format!("reading {}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&raw)?;
        Ok(cfg)
    }

    pub fn crm_settings(&self, node: impl Into<String>) -> CrmSettings {
        CrmSettings {
            node: node.into(),
            tick_secs: self.tick_secs,
            manager_status_path: self.paths.manager_status.clone(),
            lrm_status_dir: self.paths.lrm_status_dir.clone(),
            crm_commands_path: self.paths.crm_commands.clone(),
            resources_cfg_path: self.paths.resources_cfg.clone(),
            groups_cfg_path: self.paths.groups_cfg.clone(),
            fence_cfg_path: self.paths.fence_cfg.clone(),
            datacenter_cfg_path: self.paths.datacenter_cfg.clone(),
            fence_delay_secs: self.fence_delay_secs,
            lock_lifetime_secs: self.lock_lifetime_secs,
        }
    }

    pub fn lrm_settings(&self, node: impl Into<String>) -> LrmSettings {
        let node = node.into();
        LrmSettings {
            manager_status_path: self.paths.manager_status.clone(),
            lrm_status_path: format!("{}/{node}", self.paths.lrm_status_dir),
            crm_commands_path: self.paths.crm_commands.clone(),
            mode_request_path: self.paths.lrm_mode_request(&node),
            max_workers: self.lrm_max_workers,
            lock_lifetime_secs: self.lock_lifetime_secs,
            tick_secs: self.tick_secs,
            node,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_on_empty_document() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.tick_secs, 10);
        assert_eq!(cfg.paths.manager_status, "ha/manager_status");
    }

    #[test]
    fn overrides_apply() {
        let cfg: Config = toml::from_str("tick_secs = 5\ncluster_dir = \"/mnt/pve\"\n").unwrap();
        assert_eq!(cfg.tick_secs, 5);
        assert_eq!(cfg.cluster_dir, "/mnt/pve");
    }

    #[test]
    fn builds_settings_with_node_substituted() {
        let cfg = Config::default();
        let crm = cfg.crm_settings("n1");
        assert_eq!(crm.node, "n1");
        let lrm = cfg.lrm_settings("n1");
        assert_eq!(lrm.lrm_status_path, "ha/lrm_status/n1");
        assert_eq!(lrm.mode_request_path, "ha/lrm_mode_request/n1");
    }
}
