// src/core/lrm.rs

//! The LRM worker loop (spec §4.8, C8): agent-lock upkeep, watchdog
//! refresh, mode selection, dispatching owned services to their resource
//! driver, and reporting results keyed by UID.

use crate::core::env::Environment;
use crate::core::errors::{ClusterHaError, Result};
use crate::core::lock::{agent_lock_name, ClusterLock};
use crate::core::manager_status::{
    LrmMode, LrmResult, LrmStatus, ManagerStatus, ServiceId, ServiceState, ServiceStateKind,
};
use crate::core::registry::ResourceRegistry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_TICK_SECS: u64 = 10;
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Process-level settings for one LRM instance. Built by `src/config.rs`.
#[derive(Debug, Clone)]
pub struct LrmSettings {
    pub node: String,
    pub tick_secs: u64,
    pub manager_status_path: String,
    pub lrm_status_path: String,
    pub crm_commands_path: String,
    /// Cluster-KV path the local systemd unit writes `restart`/`shutdown` to
    /// when it is mid-job (spec §4.8 step 3). Concrete systemd-job
    /// introspection is packaging machinery, out of scope (spec §1);
    /// `maintenance` is instead derived from `ManagerStatus.node_request`,
    /// which is how the admin's `enable-node-maintenance` command actually
    /// reaches this node's LRM.
    pub mode_request_path: String,
    pub max_workers: usize,
    pub lock_lifetime_secs: u64,
}

impl LrmSettings {
    pub fn owner_id(&self) -> String {
        format!("lrm-{}", self.node)
    }
}

pub struct Lrm {
    settings: LrmSettings,
    lock: ClusterLock,
    mode: LrmMode,
}

impl Lrm {
    pub fn new(settings: LrmSettings) -> Self {
        let owner = settings.owner_id();
        Self {
            lock: ClusterLock::new(agent_lock_name(&settings.node), owner),
            mode: LrmMode::Active,
            settings,
        }
    }

    pub async fn run(
        &mut self,
        env: Arc<dyn Environment>,
        registry: Arc<ResourceRegistry>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<()> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                if self.lock.is_held() {
                    let _ = env.watchdog_close(true).await;
                    self.lock.release(env.as_ref()).await;
                }
                info!(node = %self.settings.node, "LRM loop exiting on shutdown");
                return Ok(());
            }
            if let Err(e) = self.tick(env.as_ref(), registry.as_ref()).await {
                warn!(error = %e, "LRM tick failed, retrying next iteration");
            }
            tokio::time::sleep(Duration::from_secs(self.settings.tick_secs)).await;
        }
    }

    /// One full loop iteration (spec §4.8 steps 1-6).
    pub async fn tick(&mut self, env: &dyn Environment, registry: &ResourceRegistry) -> Result<()> {
        let now = env.now();
        let manager_status = self.read_manager_status(env).await?;
        self.mode = self.determine_mode(env, &manager_status).await;

        let mine: Vec<(ServiceId, ServiceState)> = manager_status
            .service_status
            .iter()
            .filter(|(_, sd)| sd.node == self.settings.node)
            .map(|(sid, sd)| (sid.clone(), sd.clone()))
            .collect();

        let lock_ok = match self.acquire_or_refresh(env).await {
            Ok(ok) => ok,
            Err(e) => return Err(e),
        };

        if !lock_ok {
            if self.any_running(registry, &mine).await {
                warn!(
                    node = %self.settings.node,
                    "agent lock lost while services are running, withholding watchdog ping so the node self-fences"
                );
            } else {
                debug!(node = %self.settings.node, "agent lock not held, idling");
            }
            return Ok(());
        }

        if let Err(e) = env.watchdog_ping().await {
            warn!(error = %e, "watchdog ping failed");
        }

        let mut results: BTreeMap<String, LrmResult> = BTreeMap::new();
        for chunk in mine.chunks(self.settings.max_workers.max(1)) {
            for (sid, sd) in chunk {
                if let Some(exit_code) = dispatch(sid, sd, registry).await {
                    results.insert(sd.uid.clone(), LrmResult { exit_code });
                }
            }
        }

        let status = LrmStatus {
            mode: self.mode,
            timestamp: now,
            results,
        };
        self.write_lrm_status(env, &status).await?;

        if self.mode == LrmMode::Shutdown {
            self.handle_shutdown(env, registry, &mine).await?;
        }

        Ok(())
    }

    async fn acquire_or_refresh(&mut self, env: &dyn Environment) -> Result<bool> {
        if self.lock.is_held() {
            match self.lock.refresh(env).await {
                Ok(()) => Ok(true),
                Err(ClusterHaError::LockLost(_)) => Ok(false),
                Err(e) => Err(e),
            }
        } else {
            self.lock.acquire(env).await
        }
    }

    async fn any_running(&self, registry: &ResourceRegistry, mine: &[(ServiceId, ServiceState)]) -> bool {
        for (sid, _) in mine {
            if let Some(driver) = registry.get(&sid.ty) {
                if driver.check_running(&sid.name).await {
                    return true;
                }
            }
        }
        false
    }

    /// Requests a graceful stop of every owned, still-managed service
    /// (spec §4.8 step 6); once none are running, releases the agent lock
    /// and closes the watchdog cleanly.
    async fn handle_shutdown(
        &mut self,
        env: &dyn Environment,
        registry: &ResourceRegistry,
        mine: &[(ServiceId, ServiceState)],
    ) -> Result<()> {
        if self.any_running(registry, mine).await {
            for (sid, sd) in mine {
                if sd.state != ServiceStateKind::RequestStop {
                    env.kv_append_line(&self.settings.crm_commands_path, format!("stop {sid} 30"))
                        .await?;
                }
            }
            return Ok(());
        }
        info!(node = %self.settings.node, "all owned services stopped, releasing agent lock");
        self.lock.release(env).await;
        env.watchdog_close(true).await?;
        Ok(())
    }

    /// Local systemd-job state wins outright; otherwise maintenance follows
    /// the CRM's `node_request` (set by `enable-node-maintenance`/
    /// `disable-node-maintenance`, spec §4.7); default is active.
    async fn determine_mode(&self, env: &dyn Environment, manager_status: &ManagerStatus) -> LrmMode {
        if let Ok(Some(raw)) = env.kv_read(&self.settings.mode_request_path).await {
            match raw.trim() {
                "restart" => return LrmMode::Restart,
                "shutdown" => return LrmMode::Shutdown,
                _ => {}
            }
        }
        let wants_maintenance = manager_status
            .node_request
            .get(&self.settings.node)
            .and_then(|r| r.maintenance)
            .unwrap_or(false);
        if wants_maintenance {
            LrmMode::Maintenance
        } else {
            LrmMode::Active
        }
    }

    async fn read_manager_status(&self, env: &dyn Environment) -> Result<ManagerStatus> {
        match env.kv_read(&self.settings.manager_status_path).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(ManagerStatus::default()),
        }
    }

    async fn write_lrm_status(&self, env: &dyn Environment, status: &LrmStatus) -> Result<()> {
        let raw = serde_json::to_string(status)?;
        env.kv_write(&self.settings.lrm_status_path, raw).await
    }
}

/// Invokes the resource driver for one owned service, if its state calls
/// for local work this tick (spec §4.8 step 4). Returns `None` when there's
/// nothing to report yet (already running, or no target to act on).
async fn dispatch(sid: &ServiceId, sd: &ServiceState, registry: &ResourceRegistry) -> Option<crate::core::manager_status::ExitCode> {
    let Some(driver) = registry.get(&sid.ty) else {
        warn!(%sid, "no driver registered for service type");
        return Some(crate::core::manager_status::ExitCode::Error);
    };
    match sd.state {
        ServiceStateKind::Started => {
            if driver.check_running(&sid.name).await {
                None
            } else {
                Some(driver.start(&sid.name).await)
            }
        }
        ServiceStateKind::RequestStop => Some(driver.shutdown(&sid.name, sd.timeout).await),
        ServiceStateKind::Migrate | ServiceStateKind::Relocate | ServiceStateKind::RequestStartBalance => {
            match &sd.target {
                Some(target) => Some(driver.migrate(&sid.name, target, true).await),
                None => None,
            }
        }
        _ => None,
    }
}

/// Builds an LRM and runs it; matches `lib.rs`'s `run_lrm` re-export.
pub async fn run(
    env: Arc<dyn Environment>,
    registry: Arc<ResourceRegistry>,
    settings: LrmSettings,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut lrm = Lrm::new(settings);
    lrm.run(env, registry, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::env::SimEnvironment;
    use crate::core::manager_status::{new_uid, ExitCode};
    use crate::core::registry::testing::SimDriver;

    fn settings() -> LrmSettings {
        LrmSettings {
            node: "n1".to_string(),
            tick_secs: 10,
            manager_status_path: "manager_status".to_string(),
            lrm_status_path: "lrm_status/n1".to_string(),
            crm_commands_path: "crm_commands".to_string(),
            mode_request_path: "lrm_mode_request/n1".to_string(),
            max_workers: 4,
            lock_lifetime_secs: 120,
        }
    }

    async fn registry_with_vm() -> (Arc<ResourceRegistry>, Arc<SimDriver>) {
        let driver = Arc::new(SimDriver::new("vm"));
        let registry = ResourceRegistry::builder().register(driver.clone()).build();
        (registry, driver)
    }

    #[tokio::test]
    async fn starts_owned_service_and_reports_success() {
        let env = SimEnvironment::new();
        let (registry, driver) = registry_with_vm().await;
        driver.script_start("100", ExitCode::Success);

        let sid = ServiceId::new("vm", "100");
        let uid = new_uid();
        let mut status = ManagerStatus::default();
        status
            .service_status
            .insert(sid.clone(), ServiceState::new("n1", ServiceStateKind::Started, uid.clone()));
        env.kv_write("manager_status", serde_json::to_string(&status).unwrap())
            .await
            .unwrap();

        let mut lrm = Lrm::new(settings());
        lrm.tick(&env, registry.as_ref()).await.unwrap();

        assert!(driver.is_running("100"));
        let raw = env.kv_read("lrm_status/n1").await.unwrap().unwrap();
        let lrm_status: LrmStatus = serde_json::from_str(&raw).unwrap();
        assert_eq!(lrm_status.results.get(&uid).unwrap().exit_code, ExitCode::Success);
    }

    #[tokio::test]
    async fn withholds_watchdog_ping_when_lock_lost_and_service_running() {
        let env = SimEnvironment::new();
        let (registry, driver) = registry_with_vm().await;
        driver.script_start("100", ExitCode::Success);

        let sid = ServiceId::new("vm", "100");
        let mut status = ManagerStatus::default();
        status
            .service_status
            .insert(sid, ServiceState::new("n1", ServiceStateKind::Started, new_uid()));
        env.kv_write("manager_status", serde_json::to_string(&status).unwrap())
            .await
            .unwrap();

        let mut lrm = Lrm::new(settings());
        lrm.tick(&env, registry.as_ref()).await.unwrap();
        assert!(driver.is_running("100"));
        assert!(env.watchdog_armed());

        // Someone else steals the agent lock out from under this LRM.
        env.advance(LOCK_LIFETIME_FOR_TEST);
        env.lock_steal(&agent_lock_name("n1"), "someone-else", 120).await.unwrap();

        lrm.tick(&env, registry.as_ref()).await.unwrap();
        // Watchdog was armed from the first tick and is never re-pinged nor
        // closed while a service is still running under a lost lock.
        assert!(env.watchdog_armed());
    }

    const LOCK_LIFETIME_FOR_TEST: u64 = 121;

    #[tokio::test]
    async fn shutdown_mode_requests_stop_then_releases_lock() {
        let env = SimEnvironment::new();
        let (registry, driver) = registry_with_vm().await;
        driver.script_start("100", ExitCode::Success);

        let sid = ServiceId::new("vm", "100");
        let mut status = ManagerStatus::default();
        status
            .service_status
            .insert(sid.clone(), ServiceState::new("n1", ServiceStateKind::Started, new_uid()));
        env.kv_write("manager_status", serde_json::to_string(&status).unwrap())
            .await
            .unwrap();
        env.kv_write("lrm_mode_request/n1", "shutdown".to_string())
            .await
            .unwrap();

        let mut lrm = Lrm::new(settings());
        lrm.tick(&env, registry.as_ref()).await.unwrap();

        let queued = env.kv_read("crm_commands").await.unwrap().unwrap();
        assert!(queued.contains(&format!("stop {sid} 30")));
    }

    #[tokio::test]
    async fn node_request_maintenance_flips_reported_mode() {
        let env = SimEnvironment::new();
        let (registry, _driver) = registry_with_vm().await;

        let mut status = ManagerStatus::default();
        status
            .node_request
            .insert("n1".to_string(), crate::core::manager_status::NodeRequest { maintenance: Some(true) });
        env.kv_write("manager_status", serde_json::to_string(&status).unwrap())
            .await
            .unwrap();

        let mut lrm = Lrm::new(settings());
        lrm.tick(&env, registry.as_ref()).await.unwrap();

        let raw = env.kv_read("lrm_status/n1").await.unwrap().unwrap();
        let lrm_status: LrmStatus = serde_json::from_str(&raw).unwrap();
        assert_eq!(lrm_status.mode, LrmMode::Maintenance);
    }
}
