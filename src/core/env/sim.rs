// src/core/env/sim.rs

//! A deterministic, virtual-time `Environment` for the property/scenario
//! tests described in spec §8. Time only moves when a test calls
//! [`SimEnvironment::advance`]; membership, lock ownership and fence
//! outcomes are all driven explicitly by the test rather than by real I/O.

use crate::core::config_model::FenceDeviceConfig;
use crate::core::env::{Environment, FenceExit};
use crate::core::errors::{ClusterHaError, Result};
use crate::core::notify::FencingEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

struct SimState {
    now: u64,
    quorate: bool,
    online: HashSet<String>,
    kv: HashMap<String, String>,
    /// name -> (owner, expires_at)
    locks: HashMap<String, (String, u64)>,
    fence_scripts: HashMap<String, VecDeque<FenceExit>>,
    watchdog_armed: bool,
    notifications: Vec<FencingEvent>,
}

pub struct SimEnvironment {
    inner: Mutex<SimState>,
}

impl Default for SimEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnvironment {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimState {
                now: 0,
                quorate: true,
                online: HashSet::new(),
                kv: HashMap::new(),
                locks: HashMap::new(),
                fence_scripts: HashMap::new(),
                watchdog_armed: false,
                notifications: Vec::new(),
            }),
        }
    }

    pub fn advance(&self, secs: u64) {
        self.inner.lock().now += secs;
    }

    pub fn set_quorate(&self, quorate: bool) {
        self.inner.lock().quorate = quorate;
    }

    pub fn set_node_online(&self, node: &str, online: bool) {
        let mut state = self.inner.lock();
        if online {
            state.online.insert(node.to_string());
        } else {
            state.online.remove(node);
        }
    }

    pub fn online_set(&self, nodes: &[&str]) {
        self.inner.lock().online = nodes.iter().map(|n| n.to_string()).collect();
    }

    pub fn script_fence(&self, node: &str, exit: FenceExit) {
        self.inner
            .lock()
            .fence_scripts
            .entry(node.to_string())
            .or_default()
            .push_back(exit);
    }

    pub fn notifications(&self) -> Vec<FencingEvent> {
        self.inner.lock().notifications.clone()
    }

    pub fn watchdog_armed(&self) -> bool {
        self.inner.lock().watchdog_armed
    }

    /// True while `owner` still holds `name` without having had it expire or
    /// get stolen; used by tests to assert single-ownership invariants.
    pub fn lock_owner(&self, name: &str) -> Option<String> {
        let state = self.inner.lock();
        state.locks.get(name).map(|(owner, _)| owner.clone())
    }
}

#[async_trait]
impl Environment for SimEnvironment {
    fn now(&self) -> u64 {
        self.inner.lock().now
    }

    async fn quorate(&self) -> bool {
        self.inner.lock().quorate
    }

    async fn online_nodes(&self) -> HashSet<String> {
        self.inner.lock().online.clone()
    }

    async fn kv_read(&self, path: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().kv.get(path).cloned())
    }

    async fn kv_write(&self, path: &str, contents: String) -> Result<()> {
        let mut state = self.inner.lock();
        if !state.quorate {
            return Err(ClusterHaError::QuorumLost);
        }
        state.kv.insert(path.to_string(), contents);
        Ok(())
    }

    async fn kv_append_line(&self, path: &str, line: String) -> Result<()> {
        let mut state = self.inner.lock();
        if !state.quorate {
            return Err(ClusterHaError::QuorumLost);
        }
        let entry = state.kv.entry(path.to_string()).or_default();
        if !entry.is_empty() && !entry.ends_with('\n') {
            entry.push('\n');
        }
        entry.push_str(&line);
        entry.push('\n');
        Ok(())
    }

    async fn lock_try_acquire(&self, name: &str, owner: &str, lifetime_secs: u64) -> Result<bool> {
        let mut state = self.inner.lock();
        let now = state.now;
        let ok = match state.locks.get(name) {
            Some((held_by, expires_at)) => held_by == owner || now >= *expires_at,
            None => true,
        };
        if ok {
            state
                .locks
                .insert(name.to_string(), (owner.to_string(), now + lifetime_secs));
        }
        Ok(ok)
    }

    async fn lock_refresh(&self, name: &str, owner: &str, lifetime_secs: u64) -> Result<bool> {
        let mut state = self.inner.lock();
        let now = state.now;
        match state.locks.get_mut(name) {
            Some((held_by, expires_at)) if held_by == owner => {
                *expires_at = now + lifetime_secs;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lock_release(&self, name: &str, owner: &str) {
        let mut state = self.inner.lock();
        if state.locks.get(name).map(|(o, _)| o.as_str()) == Some(owner) {
            state.locks.remove(name);
        }
    }

    async fn lock_steal(&self, name: &str, new_owner: &str, lifetime_secs: u64) -> Result<bool> {
        let mut state = self.inner.lock();
        let now = state.now;
        let expired = match state.locks.get(name) {
            Some((_, expires_at)) => now >= *expires_at,
            None => true,
        };
        if expired {
            state
                .locks
                .insert(name.to_string(), (new_owner.to_string(), now + lifetime_secs));
        }
        Ok(expired)
    }

    async fn lock_is_held_by(&self, name: &str, owner: &str) -> bool {
        let state = self.inner.lock();
        state.locks.get(name).map(|(o, _)| o.as_str()) == Some(owner)
    }

    async fn watchdog_ping(&self) -> Result<()> {
        self.inner.lock().watchdog_armed = true;
        Ok(())
    }

    async fn watchdog_close(&self, graceful: bool) -> Result<()> {
        if graceful {
            self.inner.lock().watchdog_armed = false;
        }
        Ok(())
    }

    async fn fence_device(&self, _device: &FenceDeviceConfig, node: &str) -> FenceExit {
        let mut state = self.inner.lock();
        state
            .fence_scripts
            .get_mut(node)
            .and_then(VecDeque::pop_front)
            .unwrap_or(FenceExit::Success)
    }

    async fn notify_fencing(&self, event: FencingEvent) {
        self.inner.lock().notifications.push(event);
    }
}
