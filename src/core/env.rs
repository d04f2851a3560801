// src/core/env.rs

//! The environment abstraction (spec §9, C1): one trait bundling time,
//! cluster KV, distributed locks, watchdog, fence agents and notifications,
//! so the CRM/LRM loops are oblivious to whether they're driving the real
//! cluster filesystem or a deterministic, virtual-time simulator.

use crate::core::config_model::FenceDeviceConfig;
use crate::core::errors::Result;
use crate::core::notify::FencingEvent;
use async_trait::async_trait;
use std::collections::HashSet;

/// Outcome of invoking a single fence device (spec §4.3: exit 0 = success,
/// 5 = already off - treated as success; anything else = failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceExit {
    Success,
    AlreadyOff,
    Failure,
}

impl FenceExit {
    pub fn succeeded(self) -> bool {
        matches!(self, FenceExit::Success | FenceExit::AlreadyOff)
    }

    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => FenceExit::Success,
            5 => FenceExit::AlreadyOff,
            _ => FenceExit::Failure,
        }
    }
}

/// Uniform interface over everything the CRM and LRM loops need from the
/// outside world. Implementations must be cheaply cloneable / shareable
/// (`Arc<dyn Environment>`); all methods take `&self`.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Current time as epoch seconds. Never wall-clock `Instant` so that the
    /// simulator can drive it deterministically.
    fn now(&self) -> u64;

    /// Whether the local node is in the quorate partition. No write is ever
    /// accepted by this environment's `kv_write` without quorum.
    async fn quorate(&self) -> bool;

    /// Node names currently visible in cluster membership.
    async fn online_nodes(&self) -> HashSet<String>;

    async fn kv_read(&self, path: &str) -> Result<Option<String>>;
    async fn kv_write(&self, path: &str, contents: String) -> Result<()>;
    async fn kv_append_line(&self, path: &str, line: String) -> Result<()>;

    /// Attempts to acquire `name` for `owner`. Returns `false` (not an
    /// error) if another owner currently holds it.
    async fn lock_try_acquire(&self, name: &str, owner: &str, lifetime_secs: u64) -> Result<bool>;

    /// Refreshes an already-held lock. Returns `false` if the caller is no
    /// longer (or never was) the owner; callers must treat this as
    /// `LockLost` and de-escalate per spec §4.1.
    async fn lock_refresh(&self, name: &str, owner: &str, lifetime_secs: u64) -> Result<bool>;

    async fn lock_release(&self, name: &str, owner: &str);

    /// CRM-side theft of a node's agent lock, used to conclude watchdog
    /// fencing once the lock's lifetime has elapsed without a refresh
    /// (spec §3 invariant 5, §4.3).
    async fn lock_steal(&self, name: &str, new_owner: &str, lifetime_secs: u64) -> Result<bool>;

    /// Returns whether the given owner currently holds the named lock.
    async fn lock_is_held_by(&self, name: &str, owner: &str) -> bool;

    async fn watchdog_ping(&self) -> Result<()>;
    async fn watchdog_close(&self, graceful: bool) -> Result<()>;

    async fn fence_device(&self, device: &FenceDeviceConfig, node: &str) -> FenceExit;

    async fn notify_fencing(&self, event: FencingEvent);
}

pub mod real;
pub mod sim;

pub use real::RealEnvironment;
pub use sim::SimEnvironment;
