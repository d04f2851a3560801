// src/core/crm.rs

//! The CRM manager loop (spec §4.6, C7): master election over the manager
//! lock, per-service state machine, command ingestion and recovery. This is
//! the largest module in the crate.

use crate::core::commands::{parse_commands, CrmCommand};
use crate::core::config_model::{
    parse_datacenter_cfg, parse_fence_cfg, parse_groups_cfg, parse_resources_cfg, ConfiguredState,
    DatacenterConfig, FenceConfig, Group, SchedulerKind, ServiceConfig, ServiceId,
};
use crate::core::env::Environment;
use crate::core::errors::{ClusterHaError, Result};
use crate::core::fence::{attempt_fence, entering_fence_event, fence_succeeded_event};
use crate::core::lock::{manager_lock_name, ClusterLock};
use crate::core::manager_status::{
    new_uid, ExitCode, LrmMode, LrmStatus, ManagerStatus, ServiceState, ServiceStateKind,
};
use crate::core::node_status::NodeStatusTracker;
use crate::core::placement::{select_service_node, Preference};
use crate::core::registry::ResourceRegistry;
use crate::core::scheduler::{BasicScheduler, StaticScheduler, UsageScheduler};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_TICK_SECS: u64 = 10;
/// Guards against a pathological config chaining transitions forever within
/// one tick; spec §9's fixpoint iteration assumes a handful of chained
/// passes, never an unbounded loop.
const MAX_FIXPOINT_PASSES: usize = 32;

/// Process-level settings for one CRM candidate. Built by `src/config.rs`
/// from `clusterha.toml`.
#[derive(Debug, Clone)]
pub struct CrmSettings {
    pub node: String,
    pub tick_secs: u64,
    pub manager_status_path: String,
    pub lrm_status_dir: String,
    pub crm_commands_path: String,
    pub resources_cfg_path: String,
    pub groups_cfg_path: String,
    pub fence_cfg_path: String,
    pub datacenter_cfg_path: String,
    pub fence_delay_secs: u64,
    pub lock_lifetime_secs: u64,
}

impl CrmSettings {
    pub fn owner_id(&self) -> String {
        format!("crm-{}", self.node)
    }

    fn lrm_status_path(&self, node: &str) -> String {
        format!("{}/{node}", self.lrm_status_dir)
    }
}

pub struct Crm {
    settings: CrmSettings,
    lock: ClusterLock,
    node_tracker: NodeStatusTracker,
    /// Nodes for which an entering-fence notification has already been sent
    /// this fencing episode, so retries don't re-notify every tick.
    notified_fence: HashSet<String>,
}

impl Crm {
    pub fn new(settings: CrmSettings) -> Self {
        let owner = settings.owner_id();
        Self {
            lock: ClusterLock::new(manager_lock_name(), owner),
            node_tracker: NodeStatusTracker::new(),
            notified_fence: HashSet::new(),
            settings,
        }
    }

    /// Runs the loop until `shutdown` flips true. On shutdown the lock is
    /// released best-effort rather than left to expire (spec's graceful
    /// shutdown supplement, SPEC_FULL.md §B).
    pub async fn run(
        &mut self,
        env: Arc<dyn Environment>,
        registry: Arc<ResourceRegistry>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<()> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                self.lock.release(env.as_ref()).await;
                info!("CRM loop exiting on shutdown");
                return Ok(());
            }
            if let Err(e) = self.tick(env.as_ref(), registry.as_ref()).await {
                warn!(error = %e, "CRM tick failed, retrying next iteration");
            }
            tokio::time::sleep(Duration::from_secs(self.settings.tick_secs)).await;
        }
    }

    /// One full loop iteration (spec §4.6 steps 1-10). Public so tests can
    /// drive it deterministically against a `SimEnvironment`.
    pub async fn tick(&mut self, env: &dyn Environment, registry: &ResourceRegistry) -> Result<()> {
        if !self.acquire_or_refresh(env).await? {
            return Ok(());
        }
        if !env.quorate().await {
            warn!("not quorate, refusing to write manager status this tick");
            return Ok(());
        }

        let now = env.now();
        let online = env.online_nodes().await;
        if !online.contains(&self.settings.node) {
            warn!(node = %self.settings.node, "local node not in online set, aborting iteration");
            return Ok(());
        }

        let mut manager_status = self.read_manager_status(env).await?;
        let lrm_statuses = self.read_lrm_statuses(env, &online, &manager_status).await;

        let cd_map = self.load_resources(env).await?;
        let groups = self.load_groups(env).await?;
        let datacenter = self.load_datacenter(env).await?;
        let fence_cfg = self.load_fence_cfg(env).await?;

        self.update_node_status(now, &online, &cd_map, &groups, &manager_status, &lrm_statuses);

        let mut scheduler = self.build_scheduler(&datacenter, &online);
        self.recompute_usage(&mut *scheduler, registry, &online, &manager_status).await;

        self.reconcile_services(&cd_map, &mut manager_status);
        self.apply_queued_commands(env, &mut manager_status).await?;

        self.run_fixpoint(
            env,
            registry,
            &mut manager_status,
            &cd_map,
            &groups,
            &online,
            &lrm_statuses,
            scheduler.as_ref(),
            &datacenter,
            &fence_cfg,
            now,
        )
        .await;

        manager_status.master_node = self.settings.node.clone();
        manager_status.timestamp = now;
        manager_status.node_status = self.node_tracker.snapshot().into_iter().collect();
        self.write_manager_status(env, &manager_status).await?;
        Ok(())
    }

    /// Returns `true` if this process became (or remains) the master this
    /// tick. A `LockLost` refresh failure means the iteration aborts
    /// without writing anything (spec §4.1, §7 "Authority loss").
    async fn acquire_or_refresh(&mut self, env: &dyn Environment) -> Result<bool> {
        if self.lock.is_held() {
            match self.lock.refresh(env).await {
                Ok(()) => Ok(true),
                Err(ClusterHaError::LockLost(_)) => {
                    warn!("lost manager lock mid-loop, aborting iteration without writing status");
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        } else {
            let got = self.lock.acquire(env).await?;
            if !got {
                debug!("not manager lock holder, idling");
            }
            Ok(got)
        }
    }

    async fn read_manager_status(&self, env: &dyn Environment) -> Result<ManagerStatus> {
        match env.kv_read(&self.settings.manager_status_path).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(ManagerStatus::default()),
        }
    }

    async fn write_manager_status(&self, env: &dyn Environment, status: &ManagerStatus) -> Result<()> {
        let raw = serde_json::to_string(status)?;
        env.kv_write(&self.settings.manager_status_path, raw).await
    }

    async fn read_lrm_statuses(
        &self,
        env: &dyn Environment,
        online: &HashSet<String>,
        manager_status: &ManagerStatus,
    ) -> HashMap<String, LrmStatus> {
        let mut nodes: BTreeSet<String> = online.iter().cloned().collect();
        nodes.extend(manager_status.node_status.keys().cloned());
        let mut out = HashMap::new();
        for node in nodes {
            if let Ok(Some(raw)) = env.kv_read(&self.settings.lrm_status_path(&node)).await {
                if let Ok(status) = serde_json::from_str::<LrmStatus>(&raw) {
                    out.insert(node, status);
                }
            }
        }
        out
    }

    async fn load_resources(&self, env: &dyn Environment) -> Result<BTreeMap<ServiceId, ServiceConfig>> {
        match env.kv_read(&self.settings.resources_cfg_path).await? {
            Some(raw) => parse_resources_cfg(&raw),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn load_groups(&self, env: &dyn Environment) -> Result<BTreeMap<String, Group>> {
        match env.kv_read(&self.settings.groups_cfg_path).await? {
            Some(raw) => parse_groups_cfg(&raw),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn load_datacenter(&self, env: &dyn Environment) -> Result<DatacenterConfig> {
        match env.kv_read(&self.settings.datacenter_cfg_path).await? {
            Some(raw) => parse_datacenter_cfg(&raw),
            None => Ok(DatacenterConfig::default()),
        }
    }

    async fn load_fence_cfg(&self, env: &dyn Environment) -> Result<FenceConfig> {
        match env.kv_read(&self.settings.fence_cfg_path).await? {
            Some(raw) => parse_fence_cfg(&raw),
            None => Ok(FenceConfig::default()),
        }
    }

    /// Drives the node status tracker (spec §4.2/C5) from membership, known
    /// config/group references, and reported LRM modes. A node is
    /// considered "present" in cluster membership while it's online or
    /// still named by some resource/group config; once neither holds it's
    /// treated as deleted from membership.
    fn update_node_status(
        &mut self,
        now: u64,
        online: &HashSet<String>,
        cd_map: &BTreeMap<ServiceId, ServiceConfig>,
        groups: &BTreeMap<String, Group>,
        manager_status: &ManagerStatus,
        lrm_statuses: &HashMap<String, LrmStatus>,
    ) {
        let mut known_nodes: BTreeSet<String> = online.iter().cloned().collect();
        known_nodes.extend(manager_status.node_status.keys().cloned());
        known_nodes.extend(cd_map.values().map(|cd| cd.node.clone()));
        known_nodes.extend(groups.values().flat_map(|g| g.nodes.keys().cloned()));

        let config_visible: BTreeSet<String> = cd_map
            .values()
            .map(|cd| cd.node.clone())
            .chain(groups.values().flat_map(|g| g.nodes.keys().cloned()))
            .chain(online.iter().cloned())
            .collect();

        for node in &known_nodes {
            let is_online = online.contains(node);
            let present = config_visible.contains(node);
            let mode = lrm_statuses.get(node).map(|s| s.mode);
            self.node_tracker.observe(node, now, is_online, present, mode);
        }
        self.node_tracker.expire_gone(now);
    }

    fn build_scheduler(&self, dc: &DatacenterConfig, online: &HashSet<String>) -> Box<dyn UsageScheduler> {
        let mut scheduler: Box<dyn UsageScheduler> = match dc.scheduler {
            SchedulerKind::Basic => Box::new(BasicScheduler::default()),
            SchedulerKind::Static => {
                let mut static_scheduler = StaticScheduler::default();
                for (node, cap) in &dc.node_capacity {
                    static_scheduler.set_node_capacity(node, cap.cpus, cap.memory_bytes);
                }
                Box::new(static_scheduler)
            }
        };
        for node in online {
            scheduler.add_node(node);
        }
        scheduler
    }

    /// `recompute_online_node_usage()` (spec §4.4): rebuilt from scratch
    /// every tick from each service's current placement, once, rather than
    /// incrementally after every intra-tick placement change the fixpoint
    /// loop below may still make.
    async fn recompute_usage(
        &self,
        scheduler: &mut dyn UsageScheduler,
        registry: &ResourceRegistry,
        online: &HashSet<String>,
        manager_status: &ManagerStatus,
    ) {
        scheduler.reset();
        for node in online {
            scheduler.add_node(node);
        }
        for (sid, sd) in &manager_status.service_status {
            if online.contains(&sd.node) {
                let stats = match registry.get(&sid.ty) {
                    Some(driver) => driver.get_static_stats(&sid.name, &sd.node).await,
                    None => None,
                };
                scheduler.add_service_usage_to_node(&sd.node, sid, stats.as_ref());
            }
        }
    }

    /// Adds newly-configured services and drops ones whose config vanished
    /// or became `ignored` (spec §4.6 step 7, §3 "Lifecycles").
    fn reconcile_services(
        &self,
        cd_map: &BTreeMap<ServiceId, ServiceConfig>,
        manager_status: &mut ManagerStatus,
    ) {
        for (sid, cd) in cd_map {
            if cd.state == ConfiguredState::Ignored {
                continue;
            }
            if !manager_status.service_status.contains_key(sid) {
                let initial = match cd.state {
                    ConfiguredState::Started => ServiceStateKind::RequestStart,
                    _ => ServiceStateKind::RequestStop,
                };
                manager_status
                    .service_status
                    .insert(sid.clone(), ServiceState::new(cd.node.clone(), initial, new_uid()));
                info!(%sid, "new service added to manager status");
            }
        }
        manager_status.service_status.retain(|sid, _| {
            let keep = cd_map
                .get(sid)
                .map(|cd| cd.state != ConfiguredState::Ignored)
                .unwrap_or(false);
            if !keep {
                info!(%sid, "service removed from manager status");
            }
            keep
        });
    }

    /// Reads and clears the append-only command queue (spec §4.7).
    async fn apply_queued_commands(
        &self,
        env: &dyn Environment,
        manager_status: &mut ManagerStatus,
    ) -> Result<()> {
        let Some(raw) = env.kv_read(&self.settings.crm_commands_path).await? else {
            return Ok(());
        };
        if raw.trim().is_empty() {
            return Ok(());
        }
        for cmd in parse_commands(&raw) {
            apply_command(cmd, manager_status);
        }
        env.kv_write(&self.settings.crm_commands_path, String::new()).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_fixpoint(
        &mut self,
        env: &dyn Environment,
        registry: &ResourceRegistry,
        manager_status: &mut ManagerStatus,
        cd_map: &BTreeMap<ServiceId, ServiceConfig>,
        groups: &BTreeMap<String, Group>,
        online: &HashSet<String>,
        lrm_statuses: &HashMap<String, LrmStatus>,
        scheduler: &dyn UsageScheduler,
        dc: &DatacenterConfig,
        fence_cfg: &FenceConfig,
        now: u64,
    ) {
        for pass in 0..MAX_FIXPOINT_PASSES {
            let mut changed = false;
            let sids: Vec<ServiceId> = manager_status.service_status.keys().cloned().collect();

            for sid in &sids {
                let Some(cd) = cd_map.get(sid) else { continue };
                let (lrm_res, lrm_mode) = {
                    let sd = &manager_status.service_status[sid];
                    let lrm_res = lrm_statuses
                        .get(&sd.node)
                        .and_then(|s| s.results.get(&sd.uid))
                        .map(|r| r.exit_code);
                    let lrm_mode = lrm_statuses.get(&sd.node).map(|s| s.mode);
                    (lrm_res, lrm_mode)
                };
                let prior = manager_status.service_status[sid].clone();
                {
                    let sd = manager_status.service_status.get_mut(sid).unwrap();
                    advance_service(
                        sid,
                        cd,
                        sd,
                        &self.node_tracker,
                        lrm_res,
                        lrm_mode,
                        groups,
                        online,
                        scheduler,
                        registry,
                        self.settings.fence_delay_secs,
                        now,
                        dc.rebalance_on_start,
                    )
                    .await;
                }
                if manager_status.service_status[sid] != prior {
                    changed = true;
                }
            }

            changed |= self
                .run_fencing_block(env, manager_status, dc, fence_cfg, online, now)
                .await;

            if !changed {
                debug!(passes = pass + 1, "fixpoint reached");
                break;
            }
        }
    }

    async fn run_fencing_block(
        &mut self,
        env: &dyn Environment,
        manager_status: &mut ManagerStatus,
        dc: &DatacenterConfig,
        fence_cfg: &FenceConfig,
        online: &HashSet<String>,
        now: u64,
    ) -> bool {
        let fencing_nodes: BTreeSet<String> = manager_status
            .service_status
            .values()
            .filter(|sd| sd.state == ServiceStateKind::Fence)
            .map(|sd| sd.node.clone())
            .collect();

        let mut changed = false;
        for node in &fencing_nodes {
            self.node_tracker.enter_fence(node);
            if self.notified_fence.insert(node.clone()) {
                env.notify_fencing(entering_fence_event(
                    node,
                    &self.settings.node,
                    now,
                    online.iter().cloned().collect(),
                    Vec::new(),
                ))
                .await;
            }

            let succeeded = attempt_fence(env, dc.fence_mode, fence_cfg, node, &self.settings.owner_id()).await;
            if !succeeded {
                continue;
            }

            self.node_tracker.confirm_fenced(node);
            self.notified_fence.remove(node);
            env.notify_fencing(fence_succeeded_event(
                node,
                &self.settings.node,
                now,
                online.iter().cloned().collect(),
                Vec::new(),
            ))
            .await;

            for sd in manager_status.service_status.values_mut() {
                if &sd.node == node && sd.state == ServiceStateKind::Fence {
                    sd.state = ServiceStateKind::Recovery;
                    sd.uid = new_uid();
                    changed = true;
                }
            }
        }
        changed
    }
}

fn apply_command(cmd: CrmCommand, status: &mut ManagerStatus) {
    match &cmd {
        CrmCommand::EnableNodeMaintenance { node } => {
            status.node_request.entry(node.clone()).or_default().maintenance = Some(true);
            return;
        }
        CrmCommand::DisableNodeMaintenance { node } => {
            status.node_request.entry(node.clone()).or_default().maintenance = Some(false);
            return;
        }
        _ => {}
    }
    let sid = cmd.service_id().cloned();
    if let Some(sid) = sid {
        if let Some(sd) = status.service_status.get_mut(&sid) {
            sd.cmd = cmd.into_pending();
        } else {
            warn!(%sid, "command references unknown service, dropping");
        }
    }
}

fn recovery_state_for(sid: &ServiceId) -> ServiceStateKind {
    if sid.ty == "vm" {
        ServiceStateKind::Migrate
    } else {
        ServiceStateKind::Relocate
    }
}

/// Applies one `next_state_<X>` transition (spec §4.6) to `sd` in place.
#[allow(clippy::too_many_arguments)]
async fn advance_service(
    sid: &ServiceId,
    cd: &ServiceConfig,
    sd: &mut ServiceState,
    node_tracker: &NodeStatusTracker,
    lrm_res: Option<ExitCode>,
    lrm_mode: Option<LrmMode>,
    groups: &BTreeMap<String, Group>,
    online: &HashSet<String>,
    scheduler: &dyn UsageScheduler,
    registry: &ResourceRegistry,
    fence_delay: u64,
    now: u64,
    rebalance_on_start: bool,
) {
    // Freeze / unfreeze driven by the LRM's reported mode (spec §4.6
    // "freeze"), independent of the usual per-state transitions.
    if let Some(mode) = lrm_mode {
        if mode == LrmMode::Restart
            && matches!(
                sd.state,
                ServiceStateKind::Started | ServiceStateKind::Stopped | ServiceStateKind::RequestStop
            )
        {
            sd.state = ServiceStateKind::Freeze;
            return;
        }
        if mode != LrmMode::Restart && sd.state == ServiceStateKind::Freeze {
            sd.state = match cd.state {
                ConfiguredState::Started => ServiceStateKind::Started,
                _ => ServiceStateKind::RequestStop,
            };
            sd.uid = new_uid();
            return;
        }
    }

    let offline_delayed = node_tracker.is_offline_delayed(&sd.node, now, fence_delay);
    let node_is_maintenance = node_tracker.state_of(&sd.node) == crate::core::manager_status::NodeState::Maintenance;
    // A node in maintenance is still cluster-online but must not receive new
    // placements (spec §4.2/§4.6); every `select_service_node` call below
    // picks among this set rather than raw `online`.
    let placement_online: HashSet<String> = online
        .iter()
        .filter(|n| node_tracker.state_of(n) != crate::core::manager_status::NodeState::Maintenance)
        .cloned()
        .collect();

    match sd.state {
        ServiceStateKind::Stopped => {
            if let Some(cmd) = sd.cmd.take() {
                match cmd {
                    crate::core::manager_status::PendingCommand::Migrate { target }
                    | crate::core::manager_status::PendingCommand::Relocate { target }
                        if target != sd.node && online.contains(&target) =>
                    {
                        sd.target = Some(target);
                        sd.state = recovery_state_for(sid);
                        sd.uid = new_uid();
                    }
                    other => {
                        debug!(%sid, ?other, "dropping command, no effect in stopped state");
                    }
                }
                return;
            }
            if offline_delayed && !node_is_maintenance {
                sd.state = ServiceStateKind::Fence;
                sd.uid = new_uid();
                return;
            }
            if cd.state == ConfiguredState::Started {
                sd.state = ServiceStateKind::RequestStart;
                sd.uid = new_uid();
            }
        }

        ServiceStateKind::RequestStart => {
            if rebalance_on_start {
                let scores = scheduler.score_nodes(sid);
                if let Some(target) =
                    select_service_node(groups, &placement_online, &scores, cd, sd, Preference::BestScore)
                {
                    if target != sd.node {
                        sd.target = Some(target);
                        sd.state = ServiceStateKind::RequestStartBalance;
                        sd.uid = new_uid();
                        return;
                    }
                }
            }
            sd.state = ServiceStateKind::Started;
            sd.uid = new_uid();
        }

        ServiceStateKind::Started => {
            if !online.contains(&sd.node) {
                if offline_delayed {
                    sd.state = ServiceStateKind::Fence;
                    sd.uid = new_uid();
                }
                return;
            }
            if matches!(cd.state, ConfiguredState::Disabled | ConfiguredState::Stopped) {
                sd.state = ServiceStateKind::RequestStop;
                sd.uid = new_uid();
                return;
            }
            if let Some(cmd) = sd.cmd.take() {
                match cmd {
                    crate::core::manager_status::PendingCommand::Migrate { target }
                    | crate::core::manager_status::PendingCommand::Relocate { target }
                        if target != sd.node && online.contains(&target) =>
                    {
                        sd.target = Some(target);
                        sd.state = recovery_state_for(sid);
                        sd.uid = new_uid();
                    }
                    crate::core::manager_status::PendingCommand::Stop { .. } => {
                        sd.state = ServiceStateKind::RequestStop;
                        sd.uid = new_uid();
                    }
                    other => {
                        debug!(%sid, ?other, "command has no effect from current node");
                    }
                }
                return;
            }
            // A node in maintenance keeps running what's already on it only
            // until a replacement can be found; unlike an LRM-reported
            // error, this isn't gated on a result arriving this tick.
            if node_is_maintenance {
                sd.maintenance_node = Some(sd.node.clone());
                let scores = scheduler.score_nodes(sid);
                if let Some(target) =
                    select_service_node(groups, &placement_online, &scores, cd, sd, Preference::BestScore)
                {
                    if target != sd.node {
                        sd.target = Some(target);
                        sd.state = recovery_state_for(sid);
                        sd.uid = new_uid();
                    }
                }
                return;
            }
            match lrm_res {
                Some(ExitCode::Success) => {
                    sd.failed_nodes.clear();
                    sd.running = true;
                    let scores = scheduler.score_nodes(sid);
                    // `maintenance_node` gets one shot at winning placement
                    // back via select_service_node's step 5 before it's
                    // cleared, whether or not it was still eligible.
                    if let Some(target) =
                        select_service_node(groups, &placement_online, &scores, cd, sd, Preference::None)
                    {
                        if target != sd.node {
                            sd.target = Some(target);
                            sd.state = recovery_state_for(sid);
                            sd.uid = new_uid();
                        }
                    }
                    sd.maintenance_node = None;
                }
                Some(ExitCode::Error) | Some(ExitCode::EWrongNode) => {
                    sd.failed_nodes.push(sd.node.clone());
                    if (sd.failed_nodes.len() as u32) <= cd.max_relocate {
                        let scores = scheduler.score_nodes(sid);
                        if let Some(target) =
                            select_service_node(groups, &placement_online, &scores, cd, sd, Preference::TryNext)
                        {
                            sd.target = Some(target);
                            sd.state = recovery_state_for(sid);
                        }
                        sd.uid = new_uid();
                    } else {
                        sd.state = ServiceStateKind::Error;
                        sd.uid = new_uid();
                    }
                }
                Some(ExitCode::Ignored) => {
                    sd.uid = new_uid();
                }
                None => {}
            }
        }

        ServiceStateKind::Migrate | ServiceStateKind::Relocate | ServiceStateKind::RequestStartBalance => {
            match lrm_res {
                Some(ExitCode::Success) => {
                    let target = sd.target.take().unwrap_or_else(|| sd.node.clone());
                    sd.node = target;
                    sd.running = true;
                    sd.state = if cd.state == ConfiguredState::Started {
                        ServiceStateKind::Started
                    } else {
                        ServiceStateKind::RequestStop
                    };
                    sd.uid = new_uid();
                }
                Some(ExitCode::EWrongNode) => {
                    sd.state = ServiceStateKind::Error;
                    sd.uid = new_uid();
                }
                Some(ExitCode::Ignored) => {
                    sd.target = None;
                    sd.running = true;
                    sd.state = ServiceStateKind::Started;
                    sd.uid = new_uid();
                }
                Some(ExitCode::Error) => {
                    if offline_delayed {
                        sd.state = ServiceStateKind::Fence;
                        sd.uid = new_uid();
                    } else if sd.state == ServiceStateKind::Relocate {
                        // Recovery chain (non-VM): a failed relocate counts
                        // against the same budget as the started-state error
                        // that started it (spec's S2 walkthrough). The node
                        // that failed is the relocate's target, since the
                        // source-node LRM is merely the one reporting it.
                        let failed_node = sd.target.clone().unwrap_or_else(|| sd.node.clone());
                        sd.failed_nodes.push(failed_node);
                        if (sd.failed_nodes.len() as u32) <= cd.max_relocate {
                            let scores = scheduler.score_nodes(sid);
                            if let Some(target) =
                                select_service_node(groups, &placement_online, &scores, cd, sd, Preference::TryNext)
                            {
                                sd.target = Some(target);
                            }
                            sd.uid = new_uid();
                        } else {
                            sd.state = ServiceStateKind::Error;
                            sd.uid = new_uid();
                        }
                    } else {
                        // migrate / request_start_balance: stay put and
                        // retry (spec §4.6 "on other failure -> stay on
                        // original node and retry").
                        sd.uid = new_uid();
                    }
                }
                None => {
                    if offline_delayed {
                        sd.state = ServiceStateKind::Fence;
                        sd.uid = new_uid();
                    }
                }
            }
        }

        ServiceStateKind::RequestStop => match lrm_res {
            Some(ExitCode::Success) => {
                sd.state = ServiceStateKind::Stopped;
                sd.running = false;
                sd.uid = new_uid();
            }
            Some(_) => {
                if offline_delayed {
                    sd.state = ServiceStateKind::Fence;
                } else {
                    sd.state = ServiceStateKind::Error;
                }
                sd.uid = new_uid();
            }
            None => {
                if offline_delayed {
                    sd.state = ServiceStateKind::Fence;
                    sd.uid = new_uid();
                }
            }
        },

        ServiceStateKind::Freeze => {
            // Only leaves this state via the lrm_mode check above.
        }

        ServiceStateKind::Error => {
            if cd.state == ConfiguredState::Disabled {
                sd.failed_nodes.clear();
                sd.state = ServiceStateKind::Stopped;
                sd.uid = new_uid();
            }
        }

        ServiceStateKind::Fence => {
            // Advanced only by the per-iteration fencing block.
        }

        ServiceStateKind::Recovery => {
            let scores = scheduler.score_nodes(sid);
            match select_service_node(groups, &placement_online, &scores, cd, sd, Preference::BestScore) {
                Some(target) => {
                    if let Some(driver) = registry.get(&sid.ty) {
                        driver.remove_locks(&sid.name, &[], &sd.node).await;
                    }
                    let fresh = new_uid();
                    sd.recover_to(target, fresh);
                    sd.running = false;
                    sd.state = match cd.state {
                        ConfiguredState::Started => ServiceStateKind::Started,
                        _ => ServiceStateKind::RequestStop,
                    };
                }
                None if cd.state == ConfiguredState::Disabled => {
                    sd.state = ServiceStateKind::Stopped;
                    sd.uid = new_uid();
                }
                None => {}
            }
        }
    }
}

/// Builds a CRM and runs it; matches `lib.rs`'s `run_crm` re-export.
pub async fn run(
    env: Arc<dyn Environment>,
    registry: Arc<ResourceRegistry>,
    settings: CrmSettings,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut crm = Crm::new(settings);
    crm.run(env, registry, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::env::SimEnvironment;
    use crate::core::manager_status::LrmResult;
    use crate::core::registry::testing::SimDriver;

    fn settings() -> CrmSettings {
        CrmSettings {
            node: "n1".to_string(),
            tick_secs: 10,
            manager_status_path: "manager_status".to_string(),
            lrm_status_dir: "lrm_status".to_string(),
            crm_commands_path: "crm_commands".to_string(),
            resources_cfg_path: "resources.cfg".to_string(),
            groups_cfg_path: "groups.cfg".to_string(),
            fence_cfg_path: "fence.cfg".to_string(),
            datacenter_cfg_path: "datacenter.cfg".to_string(),
            fence_delay_secs: 60,
            lock_lifetime_secs: 120,
        }
    }

    async fn registry() -> Arc<ResourceRegistry> {
        ResourceRegistry::builder()
            .register(Arc::new(SimDriver::new("vm")))
            .register(Arc::new(SimDriver::new("ct")))
            .build()
    }

    #[tokio::test]
    async fn reconciles_new_service_to_request_start() {
        let env = SimEnvironment::new();
        env.online_set(&["n1"]);
        env.kv_write("resources.cfg", "vm: 100\n  node n1\n  state started\n".to_string())
            .await
            .unwrap();

        let mut crm = Crm::new(settings());
        crm.tick(&env, registry().await.as_ref()).await.unwrap();

        let raw = env.kv_read("manager_status").await.unwrap().unwrap();
        let status: ManagerStatus = serde_json::from_str(&raw).unwrap();
        let sd = status.service_status.get(&ServiceId::new("vm", "100")).unwrap();
        assert_eq!(sd.state, ServiceStateKind::Started);
    }

    #[tokio::test]
    async fn ignored_service_is_removed() {
        let env = SimEnvironment::new();
        env.online_set(&["n1"]);
        env.kv_write("resources.cfg", "vm: 100\n  node n1\n  state ignored\n".to_string())
            .await
            .unwrap();

        let mut status = ManagerStatus::default();
        status.service_status.insert(
            ServiceId::new("vm", "100"),
            ServiceState::new("n1", ServiceStateKind::Started, new_uid()),
        );
        env.kv_write("manager_status", serde_json::to_string(&status).unwrap())
            .await
            .unwrap();

        let mut crm = Crm::new(settings());
        crm.tick(&env, registry().await.as_ref()).await.unwrap();

        let raw = env.kv_read("manager_status").await.unwrap().unwrap();
        let status: ManagerStatus = serde_json::from_str(&raw).unwrap();
        assert!(!status.service_status.contains_key(&ServiceId::new("vm", "100")));
    }

    #[tokio::test]
    async fn start_error_relocates_then_errors_after_max_relocate() {
        let env = SimEnvironment::new();
        env.online_set(&["n1", "n2"]);
        env.kv_write(
            "resources.cfg",
            "ct: 200\n  node n1\n  state started\n  max_relocate 1\n".to_string(),
        )
        .await
        .unwrap();

        let sid = ServiceId::new("ct", "200");
        let mut status = ManagerStatus::default();
        let uid = new_uid();
        status
            .service_status
            .insert(sid.clone(), ServiceState::new("n1", ServiceStateKind::Started, uid.clone()));
        env.kv_write("manager_status", serde_json::to_string(&status).unwrap())
            .await
            .unwrap();
        let mut lrm_status = LrmStatus::default();
        lrm_status
            .results
            .insert(uid.clone(), LrmResult { exit_code: ExitCode::Error });
        env.kv_write("lrm_status/n1", serde_json::to_string(&lrm_status).unwrap())
            .await
            .unwrap();

        let registry = registry().await;
        let mut crm = Crm::new(settings());
        crm.tick(&env, registry.as_ref()).await.unwrap();

        let raw = env.kv_read("manager_status").await.unwrap().unwrap();
        let status: ManagerStatus = serde_json::from_str(&raw).unwrap();
        let sd = status.service_status.get(&sid).unwrap();
        assert_eq!(sd.failed_nodes, vec!["n1".to_string()]);
        assert_eq!(sd.state, ServiceStateKind::Relocate);
        assert_eq!(sd.target.as_deref(), Some("n2"));

        let mut lrm_status = LrmStatus::default();
        lrm_status
            .results
            .insert(sd.uid.clone(), LrmResult { exit_code: ExitCode::Error });
        env.kv_write("lrm_status/n1", serde_json::to_string(&lrm_status).unwrap())
            .await
            .unwrap();

        crm.tick(&env, registry.as_ref()).await.unwrap();
        let raw = env.kv_read("manager_status").await.unwrap().unwrap();
        let status: ManagerStatus = serde_json::from_str(&raw).unwrap();
        let sd = status.service_status.get(&sid).unwrap();
        assert_eq!(sd.failed_nodes, vec!["n1".to_string(), "n2".to_string()]);
        assert_eq!(sd.state, ServiceStateKind::Error);
    }

    #[tokio::test]
    async fn idle_when_manager_lock_held_elsewhere() {
        let env = SimEnvironment::new();
        env.online_set(&["n1"]);
        env.lock_try_acquire(manager_lock_name(), "someone-else", 120)
            .await
            .unwrap();

        let mut crm = Crm::new(settings());
        crm.tick(&env, registry().await.as_ref()).await.unwrap();
        assert!(env.kv_read("manager_status").await.unwrap().is_none());
    }
}
