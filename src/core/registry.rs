// src/core/registry.rs

//! Resource plugin registry (spec §4/C3, §6 "Resource drivers"). Types
//! register a driver at process init; the registry is frozen before the
//! loop starts, matching spec §9's "registration happens at process init
//! and is frozen before the loop starts".

use crate::core::manager_status::ExitCode;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ServiceStaticStats {
    pub max_cpu: f64,
    pub max_mem_bytes: u64,
}

/// Per-type capability set a resource driver must provide (spec §6).
/// Concrete VM/CT start/stop/migrate mechanics are out of scope (spec §1);
/// this crate only needs the contract and enough of a reference
/// implementation for tests to drive through it.
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn verify_name(&self, name: &str) -> bool {
        !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    }
    async fn exists(&self, id: &str) -> bool;
    async fn start(&self, id: &str) -> ExitCode;
    async fn shutdown(&self, id: &str, timeout_secs: Option<u64>) -> ExitCode;
    async fn migrate(&self, id: &str, target: &str, online: bool) -> ExitCode;
    async fn check_running(&self, id: &str) -> bool;
    fn config_file(&self, id: &str, node: &str) -> String {
        format!("nodes/{node}/{}/{id}.conf", self.type_name())
    }
    async fn remove_locks(&self, id: &str, locks: &[String], node: &str);
    async fn get_static_stats(&self, id: &str, node: &str) -> Option<ServiceStaticStats>;
}

/// A frozen, type-name-keyed set of resource drivers.
pub struct ResourceRegistry {
    drivers: HashMap<String, Arc<dyn ResourceDriver>>,
}

impl ResourceRegistry {
    pub fn builder() -> ResourceRegistryBuilder {
        ResourceRegistryBuilder {
            drivers: HashMap::new(),
        }
    }

    pub fn get(&self, type_name: &str) -> Option<&Arc<dyn ResourceDriver>> {
        self.drivers.get(type_name)
    }
}

pub struct ResourceRegistryBuilder {
    drivers: HashMap<String, Arc<dyn ResourceDriver>>,
}

impl ResourceRegistryBuilder {
    pub fn register(mut self, driver: Arc<dyn ResourceDriver>) -> Self {
        self.drivers.insert(driver.type_name().to_string(), driver);
        self
    }

    pub fn build(self) -> Arc<ResourceRegistry> {
        Arc::new(ResourceRegistry {
            drivers: self.drivers,
        })
    }
}

/// An in-memory reference driver used by the CRM/LRM property and scenario
/// tests. Every operation is scripted rather than touching real hypervisor
/// state. Public (not `#[cfg(test)]`) so the `tests/` integration suite can
/// drive it too.
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap as Map;

    #[derive(Default)]
    struct State {
        running: Map<String, bool>,
        scripted_start: Map<String, VecDequeExitCode>,
        stats: Map<String, ServiceStaticStats>,
    }

    type VecDequeExitCode = std::collections::VecDeque<ExitCode>;

    pub struct SimDriver {
        type_name: &'static str,
        state: Mutex<State>,
    }

    impl SimDriver {
        pub fn new(type_name: &'static str) -> Self {
            Self {
                type_name,
                state: Mutex::new(State::default()),
            }
        }

        pub fn script_start(&self, id: &str, code: ExitCode) {
            self.state
                .lock()
                .scripted_start
                .entry(id.to_string())
                .or_default()
                .push_back(code);
        }

        pub fn set_static_stats(&self, id: &str, stats: ServiceStaticStats) {
            self.state.lock().stats.insert(id.to_string(), stats);
        }

        pub fn is_running(&self, id: &str) -> bool {
            self.state.lock().running.get(id).copied().unwrap_or(false)
        }
    }

    #[async_trait]
    impl ResourceDriver for SimDriver {
        fn type_name(&self) -> &'static str {
            self.type_name
        }

        async fn exists(&self, _id: &str) -> bool {
            true
        }

        async fn start(&self, id: &str) -> ExitCode {
            let mut state = self.state.lock();
            let code = state
                .scripted_start
                .get_mut(id)
                .and_then(|q| q.pop_front())
                .unwrap_or(ExitCode::Success);
            if code == ExitCode::Success {
                state.running.insert(id.to_string(), true);
            }
            code
        }

        async fn shutdown(&self, id: &str, _timeout_secs: Option<u64>) -> ExitCode {
            self.state.lock().running.insert(id.to_string(), false);
            ExitCode::Success
        }

        async fn migrate(&self, id: &str, _target: &str, _online: bool) -> ExitCode {
            let mut state = self.state.lock();
            let code = state
                .scripted_start
                .get_mut(id)
                .and_then(|q| q.pop_front())
                .unwrap_or(ExitCode::Success);
            if code == ExitCode::Success {
                state.running.insert(id.to_string(), true);
            }
            code
        }

        async fn check_running(&self, id: &str) -> bool {
            self.is_running(id)
        }

        async fn remove_locks(&self, _id: &str, _locks: &[String], _node: &str) {}

        async fn get_static_stats(&self, id: &str, _node: &str) -> Option<ServiceStaticStats> {
            self.state.lock().stats.get(id).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::SimDriver;
    use super::*;

    #[tokio::test]
    async fn registry_dispatches_by_type() {
        let registry = ResourceRegistry::builder()
            .register(Arc::new(SimDriver::new("vm")))
            .register(Arc::new(SimDriver::new("ct")))
            .build();

        assert!(registry.get("vm").is_some());
        assert!(registry.get("ct").is_some());
        assert!(registry.get("lxc").is_none());

        let vm = registry.get("vm").unwrap();
        assert_eq!(vm.start("100").await, ExitCode::Success);
        assert!(vm.check_running("100").await);
    }
}
