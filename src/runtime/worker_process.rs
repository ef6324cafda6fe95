// src/runtime/worker_process.rs
//! Worker process handle
//!
//! One [`WorkerProcess`] owns one worker slot: a shared pool member or the
//! dedicated process of a single tenant. Each spawn creates a fresh
//! incarnation with its own channel, RPC peer and exit bookkeeping, so late
//! events from a previous process can never touch the current one.
//!
//! # Lifecycle
//!
//! ```text
//!   Idle ──start()──▶ Starting ──{type:'ready'}──▶ Ready
//!                        │                          │
//!                        └── exit / spawn error ──▶ Dead ◀── exit / kill
//!                                                   │
//!                              restart(delay) ──────┘──▶ Starting
//! ```
//!
//! # Exit notification
//!
//! Listeners registered with [`WorkerProcess::on_event`] see at most one
//! [`WorkerEvent::Exit`] per incarnation, whichever comes first of:
//! `kill()` (manual), process exit, or channel disconnect.

use crate::fleet::tenant::{CatalogClient, EngineOptions, TenantDescriptor, TenantId};
use crate::ipc::channel::{ChannelReader, ProcessChannel};
use crate::ipc::message::ChannelMessage;
use crate::ipc::rpc::RpcPeer;
use crate::ipc::transport::ChannelTransport;
use crate::observability::metrics;
use crate::runtime::process_manager::{ChildProcess, LaunchMode, LaunchSpec, Launched, Launcher};
use crate::runtime::sandbox;
use crate::utils::config::{FleetConfig, WorkerConfig};
use crate::utils::errors::{FleetError, Result};
use crate::utils::fs;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Identity of a worker slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkerId {
    /// Shared pool member, `"<shard>/S<i>"`
    Slot(String),

    /// Dedicated worker of one tenant
    Tenant(TenantId),
}

impl WorkerId {
    pub fn slot(shard: u32, index: usize) -> Self {
        WorkerId::Slot(format!("{}/S{}", shard, index))
    }

    /// Id as reported over RPC
    pub fn to_value(&self) -> Value {
        match self {
            WorkerId::Slot(name) => json!(name),
            WorkerId::Tenant(id) => json!(id),
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerId::Slot(name) => f.write_str(name),
            WorkerId::Tenant(id) => write!(f, "{}", id),
        }
    }
}

/// Settings shared by every worker of a supervisor
pub struct WorkerContext {
    pub config: WorkerConfig,

    /// Root of the working directories
    pub data_dir: PathBuf,

    /// Grace window between the shutdown request and SIGKILL
    pub kill_timeout: Duration,

    /// Engines get a catalog client and no fallback developer key
    pub embedded_catalog: bool,

    pub launcher: Arc<dyn Launcher>,
}

impl WorkerContext {
    pub fn new(config: &FleetConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            config: config.worker.clone(),
            data_dir: config.supervisor.data_dir.clone(),
            kill_timeout: config.supervisor.kill_timeout(),
            embedded_catalog: config.supervisor.embedded_catalog,
            launcher,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Never started
    Idle,

    /// Spawned (or restart scheduled), waiting for the ready handshake
    Starting,

    Ready,

    /// Exited, killed, or failed to start
    Dead,
}

/// Notification delivered to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The current incarnation is gone; `manual` if caused by `kill()`
    Exit { manual: bool },

    /// A shared worker dropped one tenant's engine
    EngineRemoved(TenantId),
}

/// How a killed incarnation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadOutcome {
    Exited(Option<i32>),

    /// The kill watchdog fired first
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&Arc<WorkerProcess>, &WorkerEvent) + Send + Sync>;

/// Requests for the task that owns the child handle
enum ChildSignal {
    Terminate,
    Kill,
    KillPid(u32),
}

/// One spawned process
struct Incarnation {
    pid: u32,

    channel: Arc<ProcessChannel>,

    transport: Arc<ChannelTransport>,

    rpc: Arc<RpcPeer>,

    /// RPC id of the engine factory, from the ready handshake
    engine: Mutex<Option<Value>>,

    /// Worker pid outside the sandbox's PID namespace
    sandboxed_pid: Mutex<Option<u32>>,

    start_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,

    signals: mpsc::UnboundedSender<ChildSignal>,

    dead: watch::Sender<Option<DeadOutcome>>,

    killing: AtomicBool,

    exit_notified: AtomicBool,

    exited: AtomicBool,

    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl Incarnation {
    fn settle(&self, outcome: DeadOutcome) {
        self.dead.send_if_modified(|dead| {
            if dead.is_none() {
                *dead = Some(outcome);
                true
            } else {
                false
            }
        });
    }

    fn finish_start(&self, result: Result<()>) {
        if let Some(tx) = self.start_tx.lock().take() {
            let _ = tx.send(result);
        }
    }
}

#[derive(Default)]
struct Inner {
    current: Option<Arc<Incarnation>>,

    /// Incarnation the last `kill()` was aimed at
    dying: Option<Arc<Incarnation>>,
}

/// Handle to one worker slot
pub struct WorkerProcess {
    id: WorkerId,

    shared: bool,

    mode: LaunchMode,

    work_dir: PathBuf,

    ctx: Arc<WorkerContext>,

    inner: Mutex<Inner>,

    state: watch::Sender<WorkerState>,

    /// Engines hosted (only meaningful for shared workers)
    use_count: AtomicUsize,

    listeners: Mutex<Vec<(ListenerId, Listener)>>,

    next_listener: AtomicU64,
}

impl WorkerProcess {
    /// Shared pool member
    pub fn shared(id: WorkerId, ctx: Arc<WorkerContext>) -> Arc<Self> {
        let work_dir = ctx.data_dir.clone();
        Self::new(id, true, work_dir, ctx)
    }

    /// Dedicated worker for `tenant`, working in its data directory
    pub fn dedicated(tenant: &TenantDescriptor, ctx: Arc<WorkerContext>) -> Arc<Self> {
        let work_dir = ctx.data_dir.join(&tenant.cloud_id);
        Self::new(WorkerId::Tenant(tenant.id), false, work_dir, ctx)
    }

    fn new(id: WorkerId, shared: bool, work_dir: PathBuf, ctx: Arc<WorkerContext>) -> Arc<Self> {
        let (state, _) = watch::channel(WorkerState::Idle);
        Arc::new(Self {
            id,
            shared,
            mode: LaunchMode::select(shared, &ctx.config),
            work_dir,
            ctx,
            inner: Mutex::new(Inner::default()),
            state,
            use_count: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn is_sandboxed(&self) -> bool {
        self.mode == LaunchMode::Sandboxed
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn use_count(&self) -> usize {
        self.use_count.load(Ordering::SeqCst)
    }

    /// OS pid of the current incarnation
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().current.as_ref().map(|inc| inc.pid)
    }

    /// Pid reported by the sandbox for the current incarnation
    pub fn sandboxed_pid(&self) -> Option<u32> {
        self.inner
            .lock()
            .current
            .as_ref()
            .and_then(|inc| *inc.sandboxed_pid.lock())
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().current.is_some()
    }

    fn current(&self) -> Result<Arc<Incarnation>> {
        self.inner
            .lock()
            .current
            .clone()
            .ok_or_else(|| FleetError::NotRunning(self.id.to_string()))
    }

    fn is_current(&self, inc: &Arc<Incarnation>) -> bool {
        self.inner
            .lock()
            .current
            .as_ref()
            .map_or(false, |cur| Arc::ptr_eq(cur, inc))
    }

    /// Register an event listener
    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Arc<WorkerProcess>, &WorkerEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    fn emit(self: &Arc<Self>, event: WorkerEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(self, &event);
        }
    }

    /// Spawn the process and wait for its ready handshake
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let ready = match self.spawn() {
            Ok(ready) => ready,
            Err(e) => {
                error!("Failed to spawn process with ID {}: {}", self.id, e);
                self.state.send_replace(WorkerState::Dead);
                return Err(e);
            }
        };

        match ready.await {
            Ok(result) => result,
            Err(_) => Err(FleetError::WorkerError(format!(
                "start of {} was abandoned",
                self.id
            ))),
        }
    }

    fn spawn(self: &Arc<Self>) -> Result<oneshot::Receiver<Result<()>>> {
        fs::ensure_dir(&self.work_dir)?;

        info!("Spawning process with ID {}", self.id);
        self.state.send_replace(WorkerState::Starting);

        let spec = LaunchSpec::for_worker(
            &self.ctx.config,
            self.mode,
            self.id.to_string(),
            self.work_dir.clone(),
        );
        let Launched {
            pid,
            channel,
            info_pipe,
            mut child,
        } = self.ctx.launcher.launch(spec)?;

        let (channel, reader) = match ProcessChannel::from_std(self.id.to_string(), channel) {
            Ok(pair) => pair,
            Err(e) => {
                let _ = child.signal(Signal::SIGKILL);
                return Err(e.into());
            }
        };
        let (transport, inbound) = ChannelTransport::new(channel.clone());
        let rpc = RpcPeer::spawn(self.id.to_string(), transport.clone(), inbound);

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (start_tx, start_rx) = oneshot::channel();
        let (dead, _) = watch::channel(None);

        let inc = Arc::new(Incarnation {
            pid,
            channel,
            transport,
            rpc,
            engine: Mutex::new(None),
            sandboxed_pid: Mutex::new(None),
            start_tx: Mutex::new(Some(start_tx)),
            signals: signals_tx,
            dead,
            killing: AtomicBool::new(false),
            exit_notified: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            watchdog: Mutex::new(None),
        });
        self.inner.lock().current = Some(inc.clone());
        metrics::worker_spawned(self.shared);

        if let Some(pipe) = info_pipe {
            let id = self.id.clone();
            let inc = inc.clone();
            tokio::spawn(async move {
                match sandbox::read_child_pid(pipe).await {
                    Ok(Some(child_pid)) => {
                        if !inc.exited.load(Ordering::Acquire) {
                            *inc.sandboxed_pid.lock() = Some(child_pid);
                        }
                    }
                    Ok(None) => debug!("Sandbox of {} closed the info pipe silently", id),
                    Err(e) => error!("Failed to read from info-fd in process {}: {}", id, e),
                }
            });
        }

        tokio::spawn(self.clone().read_channel(inc.clone(), reader));
        tokio::spawn(self.clone().watch_child(inc, child, signals_rx));

        Ok(start_rx)
    }

    async fn read_channel(self: Arc<Self>, inc: Arc<Incarnation>, mut reader: ChannelReader) {
        while let Some(msg) = reader.next_message().await {
            match msg {
                Ok(ChannelMessage::Ready { id }) => {
                    debug!("Worker {} is ready (engine factory {})", self.id, id);
                    *inc.engine.lock() = Some(id);
                    if self.is_current(&inc) {
                        self.state.send_replace(WorkerState::Ready);
                    }
                    inc.finish_start(Ok(()));
                }
                Ok(ChannelMessage::Rpc { data }) => {
                    inc.transport.push(data);
                }
                Ok(other) => warn!("Unexpected message from worker {}: {:?}", self.id, other),
                Err(e) => warn!("Failed to communicate with ID {}: {}", self.id, e),
            }
        }

        debug!("Channel to worker {} disconnected", self.id);
        inc.channel.mark_disconnected();
        inc.transport.close();
        if !inc.exit_notified.swap(true, Ordering::SeqCst) {
            self.emit(WorkerEvent::Exit { manual: false });
        }
    }

    async fn watch_child(
        self: Arc<Self>,
        inc: Arc<Incarnation>,
        mut child: Box<dyn ChildProcess>,
        mut signals: mpsc::UnboundedReceiver<ChildSignal>,
    ) {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(signal) = signals.recv() => {
                    let result = match signal {
                        ChildSignal::Terminate => child.signal(Signal::SIGTERM),
                        ChildSignal::Kill => child.signal(Signal::SIGKILL),
                        ChildSignal::KillPid(pid) => child.signal_pid(pid, Signal::SIGKILL),
                    };
                    if let Err(e) = result {
                        warn!("Failed to signal worker {}: {}", self.id, e);
                    }
                }
            }
        };

        let code = status.unwrap_or_else(|e| {
            error!("Failed to wait for worker {}: {}", self.id, e);
            None
        });
        self.handle_exit(&inc, code);
    }

    fn handle_exit(self: &Arc<Self>, inc: &Arc<Incarnation>, code: Option<i32>) {
        inc.exited.store(true, Ordering::Release);
        inc.sandboxed_pid.lock().take();
        if let Some(watchdog) = inc.watchdog.lock().take() {
            watchdog.abort();
        }

        let was_current = {
            let mut inner = self.inner.lock();
            let was_current = inner
                .current
                .as_ref()
                .map_or(false, |cur| Arc::ptr_eq(cur, inc));
            if was_current {
                inner.current = None;
            }
            was_current
        };

        if self.shared || code != Some(0) {
            error!("Child with ID {} exited with code {:?}", self.id, code);
        } else {
            info!("Child with ID {} exited", self.id);
        }
        metrics::worker_exited(self.shared);

        inc.channel.mark_disconnected();
        inc.transport.close();
        inc.rpc.close();
        inc.finish_start(Err(FleetError::WorkerError(format!(
            "Exited with code {:?}",
            code
        ))));
        inc.settle(DeadOutcome::Exited(code));

        if was_current {
            self.state.send_replace(WorkerState::Dead);
        }
        if !inc.exit_notified.swap(true, Ordering::SeqCst) {
            self.emit(WorkerEvent::Exit { manual: false });
        }
    }

    /// Ask the current process to exit; SIGKILL it after the grace window
    ///
    /// No-op without a process, and for a process already being killed.
    /// Listeners see `Exit { manual: true }` before this returns.
    pub fn kill(self: &Arc<Self>) {
        let inc = match self.inner.lock().current.clone() {
            Some(inc) => inc,
            None => return,
        };
        if inc.killing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.lock().dying = Some(inc.clone());

        info!("Killing process with ID {}", self.id);
        metrics::worker_killed();

        let id = self.id.clone();
        let dying = inc.clone();
        let timeout = self.ctx.kill_timeout;
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if dying.exited.load(Ordering::Acquire) {
                return;
            }
            warn!("Timeout waiting for child {} to die, sending SIGKILL", id);
            metrics::kill_timeout();
            dying.settle(DeadOutcome::TimedOut);
            let signal = match dying.sandboxed_pid.lock().take() {
                Some(pid) => ChildSignal::KillPid(pid),
                None => ChildSignal::Kill,
            };
            let _ = dying.signals.send(signal);
        });
        *inc.watchdog.lock() = Some(watchdog);

        // PID 1 of the sandbox namespace ignores SIGTERM; ask over the channel
        if self.is_sandboxed() && inc.channel.is_connected() {
            let id = self.id.clone();
            let channel = inc.channel.clone();
            tokio::spawn(async move {
                if let Err(e) = channel.send(&ChannelMessage::Exit).await {
                    warn!("Failed to ask worker {} to exit: {}", id, e);
                }
            });
        } else {
            let _ = inc.signals.send(ChildSignal::Terminate);
        }

        if !inc.exit_notified.swap(true, Ordering::SeqCst) {
            self.emit(WorkerEvent::Exit { manual: true });
        }
    }

    /// Forget the current process and start a new one after `delay`
    ///
    /// Cancelled (and left dead) if `cancel` fires first.
    pub fn restart(self: &Arc<Self>, delay: Duration, cancel: CancellationToken) {
        self.inner.lock().current = None;
        self.state.send_replace(WorkerState::Starting);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            if cancel.is_cancelled() {
                debug!("Restart of worker {} cancelled", this.id);
                this.state.send_replace(WorkerState::Dead);
                return;
            }

            info!("Restarting worker {}", this.id);
            if let Err(e) = this.start().await {
                error!("Failed to restart worker {}: {}", this.id, e);
            }
        });
    }

    /// Resolves once the worker is ready; fails if it is dead or never started
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|s| *s != WorkerState::Starting).await {
            Ok(state) => *state,
            Err(_) => WorkerState::Dead,
        };

        match state {
            WorkerState::Ready => Ok(()),
            WorkerState::Idle => Err(FleetError::NotRunning(self.id.to_string())),
            _ => Err(FleetError::WorkerError(format!("worker {} is dead", self.id))),
        }
    }

    /// Resolves once the last killed process is dead
    ///
    /// Returns its exit code, or `KillTimeout` if the watchdog had to fire.
    /// Resolves immediately if `kill()` was never called.
    pub async fn wait_dead(&self) -> Result<Option<i32>> {
        let dying = self.inner.lock().dying.clone();
        let inc = match dying {
            Some(inc) => inc,
            None => return Ok(None),
        };

        let mut rx = inc.dead.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => *outcome,
            Err(_) => None,
        };

        match outcome {
            Some(DeadOutcome::TimedOut) => Err(FleetError::KillTimeout(self.id.to_string())),
            Some(DeadOutcome::Exited(code)) => Ok(code),
            None => Ok(None),
        }
    }

    /// Run `tenant`'s engine in this worker
    pub async fn run_engine(
        &self,
        tenant: &TenantDescriptor,
        catalog: Option<Arc<CatalogClient>>,
    ) -> Result<()> {
        self.use_count.fetch_add(1, Ordering::SeqCst);
        if self.shared {
            fs::ensure_dir(&self.work_dir.join(&tenant.cloud_id))?;
        }

        let inc = self.current()?;
        let engine = inc
            .engine
            .lock()
            .clone()
            .ok_or_else(|| FleetError::NotRunning(self.id.to_string()))?;

        let catalog = match catalog {
            Some(client) => inc.rpc.add_stub(client),
            None => Value::Null,
        };
        let options = EngineOptions::from_descriptor(
            tenant,
            self.ctx.config.default_developer_key.as_deref(),
            self.ctx.embedded_catalog,
        );

        inc.rpc
            .call(&engine, "runEngine", vec![catalog, serde_json::to_value(&options)?])
            .await?;
        Ok(())
    }

    /// Stop `tenant`'s engine
    ///
    /// Dedicated workers are killed outright. Shared workers drop the engine
    /// and always report `EngineRemoved`, even if the remote call fails.
    pub async fn kill_engine(self: &Arc<Self>, tenant: TenantId) {
        if !self.shared {
            self.kill();
            return;
        }

        let _ = self
            .use_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });

        let result = match self.current() {
            Ok(inc) => {
                let engine = inc.engine.lock().clone();
                match engine {
                    Some(engine) => inc.rpc.call(&engine, "killEngine", vec![json!(tenant)]).await,
                    None => Err(FleetError::NotRunning(self.id.to_string())),
                }
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(
                "killEngine for tenant {} on {} failed, assuming it is already gone: {}",
                tenant, self.id, e
            );
        }

        self.emit(WorkerEvent::EngineRemoved(tenant));
    }

    /// Send a message to the process, optionally passing a socket along
    pub async fn send(&self, msg: &ChannelMessage, fd: Option<RawFd>) -> Result<()> {
        let inc = self.current()?;
        inc.channel.send_with_fd(msg, fd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::tenant::tenant;
    use crate::runtime::testing::{wait_until, FakeBehavior, FakeLauncher};

    struct Fixture {
        _dir: tempfile::TempDir,
        launcher: Arc<FakeLauncher>,
        ctx: Arc<WorkerContext>,
    }

    fn fixture(kill_timeout: Duration, disable_sandbox: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let mut config = WorkerConfig::default();
        config.disable_sandbox = disable_sandbox;
        config.default_developer_key = Some("fallback".into());
        let ctx = Arc::new(WorkerContext {
            config,
            data_dir: dir.path().to_path_buf(),
            kill_timeout,
            embedded_catalog: false,
            launcher: launcher.clone(),
        });
        Fixture {
            _dir: dir,
            launcher,
            ctx,
        }
    }

    fn count_exits(worker: &Arc<WorkerProcess>) -> (Arc<AtomicUsize>, Arc<Mutex<Vec<bool>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let manual = Arc::new(Mutex::new(Vec::new()));
        let (c, m) = (count.clone(), manual.clone());
        worker.on_event(move |_, event| {
            if let WorkerEvent::Exit { manual } = event {
                c.fetch_add(1, Ordering::SeqCst);
                m.lock().push(*manual);
            }
        });
        (count, manual)
    }

    #[test]
    fn test_worker_id() {
        let slot = WorkerId::slot(2, 5);
        assert_eq!(slot.to_string(), "2/S5");
        assert_eq!(slot.to_value(), json!("2/S5"));
        assert_eq!(WorkerId::Tenant(9).to_value(), json!(9));
    }

    #[tokio::test]
    async fn test_start_and_run_engine() {
        let fx = fixture(Duration::from_secs(5), true);
        let worker = WorkerProcess::shared(WorkerId::slot(0, 0), fx.ctx.clone());
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(worker.wait_ready().await.is_err());

        worker.start().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Ready);
        assert!(worker.pid().is_some());
        worker.wait_ready().await.unwrap();

        worker.run_engine(&tenant(1), None).await.unwrap();
        worker.run_engine(&tenant(2), None).await.unwrap();
        assert_eq!(worker.use_count(), 2);

        let fake = fx.launcher.worker("0/S0").unwrap();
        assert_eq!(fake.engines(), vec![1, 2]);
        assert_eq!(
            fake.engine_options(1).unwrap()["developerKey"],
            json!("fallback")
        );
        assert!(fx.ctx.data_dir.join("cloud-1").is_dir());
    }

    #[tokio::test]
    async fn test_use_count_survives_crash() {
        let fx = fixture(Duration::from_secs(5), true);
        let worker = WorkerProcess::shared(WorkerId::slot(0, 0), fx.ctx.clone());
        worker.start().await.unwrap();

        for id in 1..=3 {
            worker.run_engine(&tenant(id), None).await.unwrap();
        }
        worker.kill_engine(2).await;
        assert_eq!(worker.use_count(), 2);
        assert_eq!(fx.launcher.worker("0/S0").unwrap().engines(), vec![1, 3]);

        fx.launcher.crash("0/S0");
        wait_until(|| worker.state() == WorkerState::Dead).await;
        assert_eq!(worker.use_count(), 2);
    }

    #[tokio::test]
    async fn test_kill_engine_reports_removal_even_on_failure() {
        let fx = fixture(Duration::from_secs(5), true);
        let worker = WorkerProcess::shared(WorkerId::slot(0, 0), fx.ctx.clone());
        worker.start().await.unwrap();

        let removed = Arc::new(Mutex::new(Vec::new()));
        let r = removed.clone();
        worker.on_event(move |_, event| {
            if let WorkerEvent::EngineRemoved(id) = event {
                r.lock().push(*id);
            }
        });

        // never started on this worker: the remote call fails
        worker.kill_engine(8).await;
        assert_eq!(*removed.lock(), vec![8]);
        assert_eq!(worker.use_count(), 0);
    }

    #[tokio::test]
    async fn test_kill_twice_emits_one_exit() {
        let fx = fixture(Duration::from_secs(5), true);
        let worker = WorkerProcess::dedicated(&tenant(4), fx.ctx.clone());
        worker.start().await.unwrap();
        let (exits, manual) = count_exits(&worker);

        worker.kill();
        worker.kill();
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(*manual.lock(), vec![true]);

        assert_eq!(worker.wait_dead().await.unwrap(), None);
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(worker.state(), WorkerState::Dead);
        assert!(!worker.is_running());

        // nothing attached any more
        worker.kill();
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_kill_watchdog() {
        let fx = fixture(Duration::from_millis(200), true);
        fx.launcher.set_behavior(
            "4",
            FakeBehavior {
                ignore_terminate: true,
                ..Default::default()
            },
        );
        let worker = WorkerProcess::dedicated(&tenant(4), fx.ctx.clone());
        worker.start().await.unwrap();

        let started = tokio::time::Instant::now();
        worker.kill();
        let err = worker.wait_dead().await.unwrap_err();
        assert!(matches!(err, FleetError::KillTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));

        let fake = fx.launcher.worker("4").unwrap();
        wait_until(|| fake.exit_code().is_some()).await;
        assert_eq!(fake.signals(), vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[tokio::test]
    async fn test_sandboxed_kill_uses_channel_and_child_pid() {
        let fx = fixture(Duration::from_millis(200), false);
        fx.launcher.set_behavior(
            "5",
            FakeBehavior {
                ignore_terminate: true,
                ..Default::default()
            },
        );
        let worker = WorkerProcess::dedicated(&tenant(5), fx.ctx.clone());
        assert!(worker.is_sandboxed());
        worker.start().await.unwrap();

        let fake = fx.launcher.worker("5").unwrap();
        wait_until(|| worker.sandboxed_pid().is_some()).await;
        assert_eq!(worker.sandboxed_pid(), fake.sandboxed_pid());

        worker.kill();
        assert!(worker.wait_dead().await.is_err());
        wait_until(|| fake.exit_code().is_some()).await;

        // graceful request went over the channel, SIGKILL to the inner pid
        assert!(fake.received().contains(&ChannelMessage::Exit));
        assert!(!fake.signals().contains(&Signal::SIGTERM));
        assert_eq!(fake.pid_kills(), vec![fake.sandboxed_pid().unwrap()]);
    }

    #[tokio::test]
    async fn test_sandboxed_graceful_exit() {
        let fx = fixture(Duration::from_secs(5), false);
        let worker = WorkerProcess::dedicated(&tenant(6), fx.ctx.clone());
        worker.start().await.unwrap();

        worker.kill();
        assert_eq!(worker.wait_dead().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_crash_emits_one_exit() {
        let fx = fixture(Duration::from_secs(5), true);
        let worker = WorkerProcess::shared(WorkerId::slot(0, 1), fx.ctx.clone());
        worker.start().await.unwrap();
        let (exits, manual) = count_exits(&worker);

        fx.launcher.crash("0/S1");
        wait_until(|| worker.state() == WorkerState::Dead).await;
        // exit and channel disconnect both happen; listeners hear one
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(*manual.lock(), vec![false]);

        // never killed
        assert_eq!(worker.wait_dead().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_exit_before_ready_fails_start() {
        let fx = fixture(Duration::from_secs(5), true);
        fx.launcher.set_behavior(
            "0/S0",
            FakeBehavior {
                exit_before_ready: true,
                ..Default::default()
            },
        );
        let worker = WorkerProcess::shared(WorkerId::slot(0, 0), fx.ctx.clone());
        let err = worker.start().await.unwrap_err();
        assert!(matches!(err, FleetError::WorkerError(_)));
        assert_eq!(worker.state(), WorkerState::Dead);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let fx = fixture(Duration::from_secs(5), true);
        fx.launcher.set_behavior(
            "0/S0",
            FakeBehavior {
                fail_spawn: true,
                ..Default::default()
            },
        );
        let worker = WorkerProcess::shared(WorkerId::slot(0, 0), fx.ctx.clone());
        let (exits, _) = count_exits(&worker);

        assert!(matches!(
            worker.start().await,
            Err(FleetError::ProcessSpawnFailed(_))
        ));
        assert_eq!(worker.state(), WorkerState::Dead);
        assert_eq!(exits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restart_and_cancel() {
        let fx = fixture(Duration::from_secs(5), true);
        let worker = WorkerProcess::shared(WorkerId::slot(0, 0), fx.ctx.clone());
        worker.start().await.unwrap();
        fx.launcher.crash("0/S0");
        wait_until(|| worker.state() == WorkerState::Dead).await;

        worker.restart(Duration::from_millis(50), CancellationToken::new());
        assert_eq!(worker.state(), WorkerState::Starting);
        worker.wait_ready().await.unwrap();
        assert_eq!(fx.launcher.launch_count("0/S0"), 2);

        // each incarnation reports its own exit
        let (exits, _) = count_exits(&worker);
        fx.launcher.crash("0/S0");
        wait_until(|| exits.load(Ordering::SeqCst) == 1).await;

        let cancel = CancellationToken::new();
        worker.restart(Duration::from_millis(50), cancel.clone());
        cancel.cancel();
        assert!(worker.wait_ready().await.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.launcher.launch_count("0/S0"), 2);
    }

    #[tokio::test]
    async fn test_send_requires_process() {
        let fx = fixture(Duration::from_secs(5), true);
        let worker = WorkerProcess::dedicated(&tenant(3), fx.ctx.clone());
        let msg = ChannelMessage::Direct {
            target: 3,
            reply_id: json!(1),
        };
        assert!(matches!(
            worker.send(&msg, None).await,
            Err(FleetError::NotRunning(_))
        ));

        worker.start().await.unwrap();
        worker.send(&msg, None).await.unwrap();
        let fake = fx.launcher.worker("3").unwrap();
        wait_until(|| fake.received().contains(&msg)).await;
    }

    #[tokio::test]
    async fn test_listener_removal() {
        let fx = fixture(Duration::from_secs(5), true);
        let worker = WorkerProcess::dedicated(&tenant(3), fx.ctx.clone());
        worker.start().await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = worker.on_event(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        worker.remove_listener(id);

        worker.kill();
        worker.wait_dead().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
