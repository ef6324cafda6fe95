// src/runtime/testing.rs
//! In-process worker double
//!
//! [`FakeLauncher`] stands in for [`ProcessManager`](super::ProcessManager).
//! Each "process" is a task speaking the real channel protocol over a
//! socketpair: it publishes an engine factory, announces `{type:'ready'}`,
//! serves `runEngine` / `killEngine`, and obeys `{type:'exit'}` and signals.

use crate::fleet::tenant::TenantId;
use crate::ipc::channel::ProcessChannel;
use crate::ipc::message::ChannelMessage;
use crate::ipc::rpc::{RpcPeer, RpcStub};
use crate::ipc::transport::ChannelTransport;
use crate::runtime::process_manager::{ChildProcess, LaunchMode, LaunchSpec, Launched, Launcher};
use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Poll `cond` until it holds; panics after five seconds
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// How a fake worker misbehaves
#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    /// `launch()` fails
    pub fail_spawn: bool,

    /// SIGTERM and `{type:'exit'}` are ignored; only SIGKILL works
    pub ignore_terminate: bool,

    /// Exits with code 1 instead of announcing ready
    pub exit_before_ready: bool,
}

#[derive(Default)]
pub struct FakeLauncher {
    behaviors: Mutex<HashMap<String, FakeBehavior>>,

    /// Latest incarnation per worker id
    workers: Mutex<HashMap<String, Arc<FakeWorker>>>,

    launches: Mutex<HashMap<String, usize>>,

    next_pid: AtomicU32,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        }
    }

    pub fn set_behavior(&self, id: &str, behavior: FakeBehavior) {
        self.behaviors.lock().insert(id.to_string(), behavior);
    }

    pub fn worker(&self, id: &str) -> Option<Arc<FakeWorker>> {
        self.workers.lock().get(id).cloned()
    }

    pub fn launch_count(&self, id: &str) -> usize {
        self.launches.lock().get(id).copied().unwrap_or(0)
    }

    /// Make the latest incarnation of `id` exit with code 1
    pub fn crash(&self, id: &str) {
        if let Some(worker) = self.worker(id) {
            worker.exit(Some(1));
        }
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: LaunchSpec) -> Result<Launched> {
        *self.launches.lock().entry(spec.id.clone()).or_default() += 1;
        let behavior = self
            .behaviors
            .lock()
            .get(&spec.id)
            .cloned()
            .unwrap_or_default();
        if behavior.fail_spawn {
            return Err(FleetError::ProcessSpawnFailed(format!(
                "fake spawn failure for {}",
                spec.id
            )));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let sandboxed_pid = (spec.mode == LaunchMode::Sandboxed).then(|| pid + 100_000);

        let (channel, worker_end) = StdUnixStream::pair()?;
        let info_pipe = match sandboxed_pid {
            Some(inner) => {
                let (ours, mut theirs) = StdUnixStream::pair()?;
                theirs.write_all(format!("{{\"child-pid\": {}}}", inner).as_bytes())?;
                Some(ours)
            }
            None => None,
        };

        let (exit_tx, _) = watch::channel(None);
        let worker = Arc::new(FakeWorker {
            id: spec.id.clone(),
            pid,
            sandboxed_pid,
            behavior,
            engines: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            pid_kills: Mutex::new(Vec::new()),
            rpc: Mutex::new(None),
            exit_tx,
            stopped: CancellationToken::new(),
        });
        self.workers.lock().insert(spec.id, worker.clone());
        tokio::spawn(worker.clone().run(worker_end));

        Ok(Launched {
            pid,
            channel,
            info_pipe,
            child: Box::new(FakeChild { worker }),
        })
    }
}

/// One fake worker incarnation
pub struct FakeWorker {
    id: String,
    pid: u32,
    sandboxed_pid: Option<u32>,
    behavior: FakeBehavior,

    /// `runEngine` params by tenant, in arrival order
    engines: Mutex<Vec<(TenantId, Vec<Value>)>>,

    /// Channel messages other than `rpc`
    received: Mutex<Vec<ChannelMessage>>,

    signals: Mutex<Vec<Signal>>,
    pid_kills: Mutex<Vec<u32>>,
    rpc: Mutex<Option<Arc<RpcPeer>>>,
    exit_tx: watch::Sender<Option<Option<i32>>>,
    stopped: CancellationToken,
}

impl FakeWorker {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn sandboxed_pid(&self) -> Option<u32> {
        self.sandboxed_pid
    }

    /// Tenants with a running engine
    pub fn engines(&self) -> Vec<TenantId> {
        self.engines.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Descriptor passed to `runEngine` for `tenant`
    pub fn engine_options(&self, tenant: TenantId) -> Option<Value> {
        self.engine_param(tenant, 1)
    }

    /// Catalog handle passed to `runEngine` for `tenant`
    pub fn engine_catalog(&self, tenant: TenantId) -> Option<Value> {
        self.engine_param(tenant, 0)
    }

    fn engine_param(&self, tenant: TenantId, index: usize) -> Option<Value> {
        self.engines
            .lock()
            .iter()
            .find(|(id, _)| *id == tenant)
            .and_then(|(_, params)| params.get(index).cloned())
    }

    /// Call back into the supervisor, as an engine would its catalog client
    pub async fn call_catalog(&self, tenant: TenantId, method: &str) -> Result<Value> {
        let catalog = self
            .engine_catalog(tenant)
            .ok_or_else(|| FleetError::RpcError(format!("no engine for {}", tenant)))?;
        let rpc = self
            .rpc
            .lock()
            .clone()
            .ok_or_else(|| FleetError::RpcError("not connected".into()))?;
        rpc.call(&catalog, method, vec![]).await
    }

    pub fn received(&self) -> Vec<ChannelMessage> {
        self.received.lock().clone()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().clone()
    }

    pub fn pid_kills(&self) -> Vec<u32> {
        self.pid_kills.lock().clone()
    }

    /// `Some(code)` once exited
    pub fn exit_code(&self) -> Option<Option<i32>> {
        *self.exit_tx.borrow()
    }

    pub fn exit(&self, code: Option<i32>) {
        self.exit_tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(code);
                true
            } else {
                false
            }
        });
        self.stopped.cancel();
    }

    async fn run(self: Arc<Self>, socket: StdUnixStream) {
        if self.behavior.exit_before_ready {
            self.exit(Some(1));
            return;
        }

        let name = format!("fake {}", self.id);
        let (channel, mut reader) = match ProcessChannel::from_std(name.clone(), socket) {
            Ok(pair) => pair,
            Err(_) => {
                self.exit(Some(1));
                return;
            }
        };
        let (transport, inbound) = ChannelTransport::new(channel.clone());
        let rpc = RpcPeer::spawn(name, transport.clone(), inbound);
        *self.rpc.lock() = Some(rpc.clone());

        let factory = rpc.add_stub(Arc::new(FakeEngineFactory {
            worker: Arc::downgrade(&self),
        }));
        if channel
            .send(&ChannelMessage::Ready { id: factory })
            .await
            .is_err()
        {
            self.exit(Some(1));
        }

        loop {
            let msg = tokio::select! {
                _ = self.stopped.cancelled() => break,
                msg = reader.next_message() => msg,
            };
            match msg {
                Some(Ok(ChannelMessage::Rpc { data })) => {
                    transport.push(data);
                }
                Some(Ok(msg)) => {
                    let exit = msg == ChannelMessage::Exit;
                    self.received.lock().push(msg);
                    if exit && !self.behavior.ignore_terminate {
                        self.exit(Some(0));
                    }
                }
                Some(Err(_)) => {}
                None => break,
            }
        }

        self.rpc.lock().take();
        transport.close();
        rpc.close();
    }
}

struct FakeChild {
    worker: Arc<FakeWorker>,
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn id(&self) -> u32 {
        self.worker.pid
    }

    fn signal(&mut self, signal: Signal) -> Result<()> {
        self.worker.signals.lock().push(signal);
        if signal == Signal::SIGKILL || !self.worker.behavior.ignore_terminate {
            self.worker.exit(None);
        }
        Ok(())
    }

    fn signal_pid(&mut self, pid: u32, signal: Signal) -> Result<()> {
        if Some(pid) != self.worker.sandboxed_pid {
            return Err(nix::Error::ESRCH.into());
        }
        self.worker.pid_kills.lock().push(pid);
        if signal == Signal::SIGKILL {
            self.worker.exit(None);
        }
        Ok(())
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        let mut rx = self.worker.exit_tx.subscribe();
        let code = match rx.wait_for(Option::is_some).await {
            Ok(code) => (*code).flatten(),
            Err(_) => None,
        };
        Ok(code)
    }
}

struct FakeEngineFactory {
    worker: Weak<FakeWorker>,
}

#[async_trait]
impl RpcStub for FakeEngineFactory {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let worker = self
            .worker
            .upgrade()
            .ok_or_else(|| FleetError::RpcError("worker gone".into()))?;

        match method {
            "runEngine" => {
                let tenant = params
                    .get(1)
                    .and_then(|opts| opts["userId"].as_i64())
                    .ok_or_else(|| FleetError::ProtocolError("runEngine without userId".into()))?;
                worker.engines.lock().push((tenant, params));
                Ok(Value::Null)
            }
            "killEngine" => {
                let tenant = params
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| FleetError::ProtocolError("killEngine without id".into()))?;
                let mut engines = worker.engines.lock();
                let before = engines.len();
                engines.retain(|(id, _)| *id != tenant);
                if engines.len() == before {
                    return Err(FleetError::RpcError(format!("no engine for {}", tenant)));
                }
                Ok(Value::Null)
            }
            other => Err(FleetError::RpcError(format!("unknown method {}", other))),
        }
    }
}
