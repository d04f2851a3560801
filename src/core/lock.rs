// src/core/lock.rs

//! Distributed lock & quorum (spec §4.1, C2): the single cluster-wide
//! `ha_manager_lock` and the per-node `ha_agent_<node>_lock`. Grounded on the
//! "distributed cooperative lock" shape of `kubert::lease::Lease` (claim
//! params + renewal) seen in the retrieval pack, adapted onto the
//! `Environment::lock_*` primitives instead of a Kubernetes `Lease` object.

use crate::core::env::Environment;
use crate::core::errors::{ClusterHaError, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// Absolute lock lifetime `L` (spec §4.1): owners must refresh before this
/// elapses or lose authority.
pub const LOCK_LIFETIME_SECS: u64 = 120;

pub fn manager_lock_name() -> &'static str {
    "ha_manager_lock"
}

pub fn agent_lock_name(node: &str) -> String {
    format!("ha_agent_{node}_lock")
}

/// A handle to one named cluster lock, held (or not) by `owner`.
pub struct ClusterLock {
    name: String,
    owner: String,
    lifetime_secs: u64,
    held: AtomicBool,
}

impl ClusterLock {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            lifetime_secs: LOCK_LIFETIME_SECS,
            held: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    pub async fn acquire(&self, env: &dyn Environment) -> Result<bool> {
        let ok = env
            .lock_try_acquire(&self.name, &self.owner, self.lifetime_secs)
            .await?;
        self.held.store(ok, Ordering::Release);
        Ok(ok)
    }

    /// Refreshes the lock. On failure the caller has lost authority and must
    /// de-escalate per spec §4.1 (CRM stops writing status; LRM stops
    /// arming the watchdog).
    pub async fn refresh(&self, env: &dyn Environment) -> Result<()> {
        let ok = env
            .lock_refresh(&self.name, &self.owner, self.lifetime_secs)
            .await?;
        self.held.store(ok, Ordering::Release);
        if ok {
            Ok(())
        } else {
            Err(ClusterHaError::LockLost(self.name.clone()))
        }
    }

    pub async fn release(&self, env: &dyn Environment) {
        env.lock_release(&self.name, &self.owner).await;
        self.held.store(false, Ordering::Release);
    }
}

/// Whether the local node is in the quorate partition; no write is accepted
/// anywhere without this (spec §4.1).
pub async fn quorate(env: &dyn Environment) -> bool {
    env.quorate().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::env::SimEnvironment;

    #[tokio::test]
    async fn single_owner_across_two_claimants() {
        let env = SimEnvironment::new();
        let a = ClusterLock::new(manager_lock_name(), "crm-a");
        let b = ClusterLock::new(manager_lock_name(), "crm-b");

        assert!(a.acquire(&env).await.unwrap());
        assert!(!b.acquire(&env).await.unwrap());
        assert!(a.is_held());
        assert!(!b.is_held());
    }

    #[tokio::test]
    async fn refresh_failure_reports_lock_lost() {
        let env = SimEnvironment::new();
        let a = ClusterLock::new(agent_lock_name("n1"), "lrm-n1");
        assert!(a.acquire(&env).await.unwrap());

        env.advance(LOCK_LIFETIME_SECS + 1);
        // Simulate a new owner stealing the expired lock out from under `a`.
        let stolen = env
            .lock_steal(&agent_lock_name("n1"), "crm-master", LOCK_LIFETIME_SECS)
            .await
            .unwrap();
        assert!(stolen);

        let err = a.refresh(&env).await.unwrap_err();
        assert!(matches!(err, ClusterHaError::LockLost(_)));
        assert!(!a.is_held());
    }
}
