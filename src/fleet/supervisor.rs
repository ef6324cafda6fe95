// src/fleet/supervisor.rs
//! Fleet supervisor
//!
//! Owns every worker of this shard and decides where each tenant runs.
//!
//! # Architecture
//!
//! ```text
//!                        FleetSupervisor
//!   ┌─────────────────────────────────────────────────────────────┐
//!   │  processes: 0/S0 0/S1 ... 0/Sn-1  (shared pool)             │
//!   │             17 42 ...             (dedicated, by tenant id) │
//!   │                                                             │
//!   │  sessions:  tenant → TenantSession ──weak──▶ WorkerProcess  │
//!   │  locks:     tenant → async mutex (lifecycle ops)            │
//!   │  stopped:   cancellation token                              │
//!   └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Restart policy
//!
//! - A pool member that exits is respawned after the pool restart delay.
//! - A session torn down by a worker exit (not by an explicit kill) has its
//!   tenant restarted after the tenant restart delay.
//! - Neither happens once `killAllUsers` (or `stop()`) has begun, and no
//!   tenant is started from then on.

use crate::fleet::pool::{self, PoolStats, SharedPool};
use crate::fleet::session::TenantSession;
use crate::fleet::tenant::{CatalogClient, TenantDescriptor, TenantId, TenantStore};
use crate::ipc::message::ChannelMessage;
use crate::observability::metrics;
use crate::runtime::process_manager::Launcher;
use crate::runtime::worker_process::{
    ListenerId, WorkerContext, WorkerEvent, WorkerId, WorkerProcess,
};
use crate::utils::config::{FleetConfig, ShardConfig, SupervisorConfig};
use crate::utils::errors::{FleetError, Result};
use crate::utils::fs;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name of the per-tenant cache directory
const CACHE_DIR: &str = "cache";

struct FleetState {
    /// Pool members and dedicated workers
    processes: HashMap<WorkerId, Arc<WorkerProcess>>,

    pool: SharedPool,

    sessions: HashMap<TenantId, TenantSession>,
}

/// Supervisor of one shard's workers
pub struct FleetSupervisor {
    this: Weak<FleetSupervisor>,

    shard: ShardConfig,

    settings: SupervisorConfig,

    ctx: Arc<WorkerContext>,

    store: Arc<dyn TenantStore>,

    state: Mutex<FleetState>,

    /// Serializes lifecycle operations per tenant
    locks: DashMap<TenantId, Arc<tokio::sync::Mutex<()>>>,

    /// Cancelled when `killAllUsers` begins
    stopped: CancellationToken,

    next_session: AtomicU64,
}

impl FleetSupervisor {
    pub fn new(
        config: &FleetConfig,
        launcher: Arc<dyn Launcher>,
        store: Arc<dyn TenantStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            shard: config.shard.clone(),
            settings: config.supervisor.clone(),
            ctx: Arc::new(WorkerContext::new(config, launcher)),
            store,
            state: Mutex::new(FleetState {
                processes: HashMap::new(),
                pool: SharedPool::empty(),
                sessions: HashMap::new(),
            }),
            locks: DashMap::new(),
            stopped: CancellationToken::new(),
            next_session: AtomicU64::new(1),
        })
    }

    pub fn shard_id(&self) -> u32 {
        self.shard.id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Spawn the shared pool, then run every tenant of this shard
    ///
    /// Individual tenant failures are logged and do not fail startup.
    pub async fn start(&self) -> Result<()> {
        let size = self.settings.effective_pool_size();
        let pool = SharedPool::new(self.shard.id, size, &self.ctx);
        let members = pool.members().to_vec();

        for member in &members {
            let supervisor = self.this.clone();
            member.on_event(move |process, event| {
                if let WorkerEvent::Exit { .. } = event {
                    if let Some(supervisor) = supervisor.upgrade() {
                        supervisor.on_pool_member_exit(process);
                    }
                }
            });
        }
        {
            let mut state = self.state.lock();
            for member in &members {
                state.processes.insert(member.id().clone(), member.clone());
            }
            state.pool = pool;
        }
        metrics::pool_size(size);

        pool::start_all(&members).await?;
        info!("Shard {}: {} shared processes ready", self.shard.id, size);

        let tenants = self
            .store
            .list_for_shard(self.shard.id, self.shard.count)
            .await?;
        info!("Shard {}: starting {} tenants", self.shard.id, tenants.len());

        let results = join_all(tenants.iter().map(|t| self.run_tenant(t))).await;
        for (tenant, result) in tenants.iter().zip(results) {
            if let Err(e) = result {
                error!("User {} failed to start: {}", tenant.id, e);
            }
        }
        Ok(())
    }

    fn on_pool_member_exit(&self, process: &Arc<WorkerProcess>) {
        if self.stopped.is_cancelled() {
            return;
        }
        process.restart(self.settings.pool_restart_delay(), self.stopped.clone());
    }

    /// Worker for `tenant`: the next pool member, or a new dedicated worker
    async fn select_process_for(&self, tenant: &TenantDescriptor) -> Result<Arc<WorkerProcess>> {
        let member = if tenant.needs_dedicated_process() {
            None
        } else {
            self.state.lock().pool.next()
        };
        if let Some(member) = member {
            member.wait_ready().await?;
            return Ok(member);
        }

        let child = WorkerProcess::dedicated(tenant, self.ctx.clone());
        {
            // checked under the lock so `kill_all_users` sees every worker it must kill
            let mut state = self.state.lock();
            if self.stopped.is_cancelled() {
                return Err(FleetError::Stopped);
            }
            state.processes.insert(child.id().clone(), child.clone());
        }

        let supervisor = self.this.clone();
        child.on_event(move |process, event| {
            if let WorkerEvent::Exit { .. } = event {
                if let Some(supervisor) = supervisor.upgrade() {
                    supervisor.deregister(process);
                }
            }
        });

        if let Err(e) = child.start().await {
            self.deregister(&child);
            return Err(e);
        }
        // a kill issued before the spawn finds nothing to kill
        if self.stopped.is_cancelled() {
            child.kill();
            let _ = child.wait_dead().await;
            return Err(FleetError::Stopped);
        }
        Ok(child)
    }

    fn deregister(&self, process: &Arc<WorkerProcess>) {
        let mut state = self.state.lock();
        let registered = state
            .processes
            .get(process.id())
            .map_or(false, |p| Arc::ptr_eq(p, process));
        if registered {
            state.processes.remove(process.id());
        }
    }

    /// Create a session for `tenant` and run its engine
    async fn run_tenant(&self, tenant: &TenantDescriptor) -> Result<()> {
        let serial = self.next_session.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            if self.stopped.is_cancelled() {
                return Err(FleetError::Stopped);
            }
            state
                .sessions
                .insert(tenant.id, TenantSession::new(serial, tenant));
            metrics::sessions(state.sessions.len());
        }

        let process = self.select_process_for(tenant).await?;
        info!(
            "Running engine for user {} in shard {}",
            tenant.id, self.shard.id
        );

        let catalog = self
            .settings
            .embedded_catalog
            .then(|| Arc::new(CatalogClient::new(tenant)));

        let tenant_id = tenant.id;
        let supervisor = self.this.clone();
        let registration: Arc<OnceLock<ListenerId>> = Arc::new(OnceLock::new());
        let own_registration = registration.clone();
        let listener = process.on_event(move |process, event| {
            let manual = match event {
                WorkerEvent::Exit { manual } => *manual,
                WorkerEvent::EngineRemoved(id) if *id == tenant_id => true,
                WorkerEvent::EngineRemoved(_) => return,
            };
            if let Some(id) = own_registration.get() {
                process.remove_listener(*id);
            }
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.on_session_died(tenant_id, serial, manual);
            }
        });
        let _ = registration.set(listener);

        if let Some(session) = self
            .state
            .lock()
            .sessions
            .get_mut(&tenant.id)
            .filter(|s| s.serial == serial)
        {
            session.bind(&process, catalog.clone());
        }

        process.run_engine(tenant, catalog).await
    }

    fn on_session_died(&self, tenant: TenantId, serial: u64, manual: bool) {
        {
            let mut state = self.state.lock();
            match state.sessions.get(&tenant) {
                Some(session) if session.serial == serial => {
                    state.sessions.remove(&tenant);
                    metrics::sessions(state.sessions.len());
                }
                _ => return,
            }
        }
        debug!("Session of user {} ended (manual: {})", tenant, manual);

        // a stopping supervisor takes every engine down with it
        if manual || self.stopped.is_cancelled() {
            return;
        }
        self.schedule_tenant_restart(tenant);
    }

    fn schedule_tenant_restart(&self, tenant: TenantId) {
        let supervisor = match self.this.upgrade() {
            Some(supervisor) => supervisor,
            None => return,
        };
        let cancel = self.stopped.clone();
        let delay = self.settings.tenant_restart_delay();

        info!("User {} lost its engine, restarting in {:?}", tenant, delay);
        metrics::tenant_restart_scheduled();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            if cancel.is_cancelled() {
                debug!("Restart of user {} cancelled", tenant);
                return;
            }
            match supervisor.restart_user(tenant).await {
                Ok(()) => {}
                Err(FleetError::Stopped) => debug!("Restart of user {} cancelled", tenant),
                Err(e) => error!("Failed to restart user {}: {}", tenant, e),
            }
        });
    }

    fn tenant_lock(&self, tenant: TenantId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(tenant).or_default().clone()
    }

    fn bound_process(&self, tenant: TenantId) -> Option<Arc<WorkerProcess>> {
        self.state
            .lock()
            .sessions
            .get(&tenant)
            .and_then(TenantSession::process)
    }

    pub fn is_running(&self, tenant: TenantId) -> bool {
        self.bound_process(tenant).is_some()
    }

    /// Id of the worker hosting `tenant`, or -1
    pub fn get_process_id(&self, tenant: TenantId) -> Value {
        match self.bound_process(tenant) {
            Some(process) => process.id().to_value(),
            None => json!(-1),
        }
    }

    pub async fn start_user(&self, tenant: TenantId) -> Result<()> {
        info!("Requested start of user {}", tenant);
        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;
        self.start_user_locked(tenant).await
    }

    async fn start_user_locked(&self, tenant: TenantId) -> Result<()> {
        let descriptor = self.store.get(tenant).await?;
        self.run_tenant(&descriptor).await
    }

    pub async fn kill_user(&self, tenant: TenantId) -> Result<()> {
        info!("Requested killing user {}", tenant);
        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;
        self.kill_user_locked(tenant).await;
        Ok(())
    }

    async fn kill_user_locked(&self, tenant: TenantId) {
        if let Some(process) = self.bound_process(tenant) {
            process.kill_engine(tenant).await;
        }
    }

    pub async fn restart_user(&self, tenant: TenantId) -> Result<()> {
        info!("Requested restart of user {}", tenant);
        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;
        self.kill_user_locked(tenant).await;
        self.start_user_locked(tenant).await
    }

    /// Mark the supervisor stopped, kill every worker and wait until all of
    /// them are dead
    ///
    /// Nothing is restarted or started afterwards. Workers that outlive the
    /// kill grace window are force-killed; that is logged, not reported as a
    /// failure.
    pub async fn kill_all_users(&self) -> Result<bool> {
        self.stopped.cancel();

        let processes: Vec<Arc<WorkerProcess>> =
            self.state.lock().processes.values().cloned().collect();
        info!("Killing {} worker processes", processes.len());

        for process in &processes {
            process.kill();
        }
        let results = join_all(processes.iter().map(|p| p.wait_dead())).await;
        for (process, result) in processes.iter().zip(results) {
            if let Err(e) = result {
                warn!("Worker {} had to be force-killed: {}", process.id(), e);
            }
        }
        Ok(true)
    }

    /// Directory holding `cloud_id`'s data
    fn tenant_dir(&self, cloud_id: &str) -> Result<PathBuf> {
        if cloud_id.is_empty() || cloud_id == "." || cloud_id == ".." || cloud_id.contains('/') {
            return Err(FleetError::StorageFailed(format!(
                "refusing to use {:?} as a tenant directory",
                cloud_id
            )));
        }
        Ok(self.settings.data_dir.join(cloud_id))
    }

    /// Cloud id for the tenant's directory, stopping its engine first
    async fn cloud_id_for_path(&self, tenant: TenantId) -> Result<String> {
        let session = {
            let state = self.state.lock();
            state
                .sessions
                .get(&tenant)
                .map(|s| (s.cloud_id.clone(), s.process()))
        };

        match session {
            Some((cloud_id, process)) => {
                if let Some(process) = process {
                    process.kill_engine(tenant).await;
                }
                Ok(cloud_id)
            }
            None => Ok(self.store.get(tenant).await?.cloud_id),
        }
    }

    pub async fn delete_user(&self, tenant: TenantId) -> Result<()> {
        info!("Deleting all data for {}", tenant);
        let lock = self.tenant_lock(tenant);
        let result = {
            let _guard = lock.lock().await;
            self.delete_user_locked(tenant).await
        };
        self.locks.remove(&tenant);
        result
    }

    async fn delete_user_locked(&self, tenant: TenantId) -> Result<()> {
        let known = self
            .state
            .lock()
            .sessions
            .get(&tenant)
            .map(|s| s.cloud_id.clone());
        self.kill_user_locked(tenant).await;

        let cloud_id = match known {
            Some(cloud_id) => cloud_id,
            None => self.cloud_id_for_path(tenant).await?,
        };
        fs::remove_tree(&self.tenant_dir(&cloud_id)?).await
    }

    async fn clear_cache_locked(&self, tenant: TenantId) -> Result<()> {
        let cloud_id = self.cloud_id_for_path(tenant).await?;
        fs::remove_tree(&self.tenant_dir(&cloud_id)?.join(CACHE_DIR)).await
    }

    pub async fn clear_cache(&self, tenant: TenantId) -> Result<()> {
        info!("Clearing cache for {}", tenant);
        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;
        self.clear_cache_locked(tenant).await
    }

    /// Kill, clear the cache, start again
    ///
    /// A start that is not serialized by the tenant lock (a crash-triggered
    /// restart firing in between) can still race with the cache removal.
    pub async fn restart_user_without_cache(&self, tenant: TenantId) -> Result<()> {
        info!("Requested cache clear & restart of user {}", tenant);
        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;
        self.kill_user_locked(tenant).await;
        self.clear_cache_locked(tenant).await?;
        self.start_user_locked(tenant).await
    }

    /// Hand a client connection to the worker hosting `tenant`
    ///
    /// The caller keeps its copy of `fd` and closes it afterwards.
    pub async fn send_socket(&self, tenant: TenantId, reply_id: Value, fd: RawFd) -> Result<()> {
        let process = {
            let state = self.state.lock();
            let session = state
                .sessions
                .get(&tenant)
                .ok_or(FleetError::InvalidTenant(tenant))?;
            session.process().ok_or(FleetError::EngineDead(tenant))?
        };

        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;
        process
            .send(
                &ChannelMessage::Direct {
                    target: tenant,
                    reply_id,
                },
                Some(fd),
            )
            .await
    }

    /// Stop auto-restarts and kill everything
    pub async fn stop(&self) {
        if let Err(e) = self.kill_all_users().await {
            error!("Failed to kill workers during shutdown: {}", e);
        }
        info!("Fleet supervisor stopped");
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.state.lock().pool.stats()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Ids of every registered worker
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.state.lock().processes.keys().cloned().collect()
    }

    pub fn worker(&self, id: &WorkerId) -> Option<Arc<WorkerProcess>> {
        self.state.lock().processes.get(id).cloned()
    }
}
