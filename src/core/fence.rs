// src/core/fence.rs

//! Fence orchestrator (spec §4.3, C9): concludes a node as dead either by
//! stealing its agent lock (`watchdog` mode) or by running configured fence
//! devices (`hardware` mode).

use crate::core::config_model::{FenceConfig, FenceMode};
use crate::core::env::Environment;
use crate::core::lock::{agent_lock_name, LOCK_LIFETIME_SECS};
use crate::core::notify::{FenceStatus, FencingEvent};
use tracing::{info, warn};

/// Attempts to conclude fencing of `node` this tick. Returns `true` only
/// when fencing is proven complete; the caller advances the service(s) on
/// `node` from `fence` to `recovery`. A `false` result means retry next
/// tick (spec §4.3: "Failures trigger retry on the next CRM tick").
pub async fn attempt_fence(
    env: &dyn Environment,
    mode: FenceMode,
    fence_cfg: &FenceConfig,
    node: &str,
    owner: &str,
) -> bool {
    match mode {
        FenceMode::Watchdog => attempt_watchdog_fence(env, node, owner).await,
        FenceMode::Hardware => attempt_hardware_fence(env, fence_cfg, node).await,
    }
}

/// Stealing the node's agent lock proves it can no longer refresh it, which
/// (given a live LRM arms the hardware watchdog) means it has rebooted or is
/// otherwise unable to act (spec §4.3 "watchdog" mode).
async fn attempt_watchdog_fence(env: &dyn Environment, node: &str, owner: &str) -> bool {
    match env
        .lock_steal(&agent_lock_name(node), owner, LOCK_LIFETIME_SECS)
        .await
    {
        Ok(stolen) => stolen,
        Err(e) => {
            warn!(node, error = %e, "failed to steal agent lock while fencing");
            false
        }
    }
}

/// A group succeeds only when every device in it succeeds; the overall
/// fence succeeds when any group succeeds (spec §4.3 "hardware" mode).
async fn attempt_hardware_fence(env: &dyn Environment, fence_cfg: &FenceConfig, node: &str) -> bool {
    let Some(node_cfg) = fence_cfg.nodes.get(node) else {
        warn!(node, "no fence device groups configured for node");
        return false;
    };
    for group in &node_cfg.groups {
        let mut group_ok = true;
        for device_name in group {
            let Some(device) = fence_cfg.devices.get(device_name) else {
                warn!(node, device = device_name.as_str(), "unknown fence device in group");
                group_ok = false;
                break;
            };
            let exit = env.fence_device(device, node).await;
            if !exit.succeeded() {
                group_ok = false;
                break;
            }
        }
        if group_ok {
            info!(node, "hardware fence group succeeded");
            return true;
        }
    }
    false
}

pub fn entering_fence_event(
    node: &str,
    master_node: &str,
    now: u64,
    nodes: Vec<String>,
    resources: Vec<String>,
) -> FencingEvent {
    FencingEvent::new(FenceStatus::Fence, node, master_node, now, nodes, resources)
}

pub fn fence_succeeded_event(
    node: &str,
    master_node: &str,
    now: u64,
    nodes: Vec<String>,
    resources: Vec<String>,
) -> FencingEvent {
    FencingEvent::new(FenceStatus::Succeed, node, master_node, now, nodes, resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config_model::FenceDeviceConfig;
    use crate::core::env::{FenceExit, SimEnvironment};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn watchdog_fence_succeeds_once_lock_expires() {
        let env = SimEnvironment::new();
        env.lock_try_acquire(&agent_lock_name("n1"), "lrm-n1", LOCK_LIFETIME_SECS)
            .await
            .unwrap();

        assert!(!attempt_fence(&env, FenceMode::Watchdog, &FenceConfig::default(), "n1", "crm-master").await);

        env.advance(LOCK_LIFETIME_SECS + 1);
        assert!(attempt_fence(&env, FenceMode::Watchdog, &FenceConfig::default(), "n1", "crm-master").await);
    }

    #[tokio::test]
    async fn hardware_fence_succeeds_when_any_group_succeeds() {
        let env = SimEnvironment::new();
        let mut devices = BTreeMap::new();
        devices.insert(
            "bad".to_string(),
            FenceDeviceConfig {
                name: "bad".to_string(),
                agent: "fence_noop".to_string(),
                params: BTreeMap::new(),
                timeout_secs: 5,
            },
        );
        devices.insert(
            "good".to_string(),
            FenceDeviceConfig {
                name: "good".to_string(),
                agent: "fence_noop".to_string(),
                params: BTreeMap::new(),
                timeout_secs: 5,
            },
        );
        let mut cfg = FenceConfig {
            devices,
            nodes: BTreeMap::new(),
        };
        cfg.nodes.insert(
            "n1".to_string(),
            crate::core::config_model::NodeFenceConfig {
                groups: vec![vec!["bad".to_string()], vec!["good".to_string()]],
            },
        );

        env.script_fence("n1", FenceExit::Failure);
        env.script_fence("n1", FenceExit::Success);

        assert!(attempt_fence(&env, FenceMode::Hardware, &cfg, "n1", "crm-master").await);
    }

    #[tokio::test]
    async fn hardware_fence_fails_without_node_config() {
        let env = SimEnvironment::new();
        assert!(!attempt_fence(&env, FenceMode::Hardware, &FenceConfig::default(), "n1", "crm-master").await);
    }
}
