// src/ipc/rpc.rs
//! Minimal request/response RPC peer
//!
//! ```text
//!   local caller ──call()──▶ {kind:'call', id, obj, method, params} ──▶ remote stub
//!   local caller ◀─oneshot── {kind:'reply', id, result | error}     ◀── remote stub
//! ```
//!
//! A peer runs over any [`MessageSink`] + [`MessageStream`] pair: a worker's
//! process channel (through the transport adapter) or a control-plane
//! connection. Either side may publish stubs and call the other side's.

use crate::ipc::transport::{MessageSink, MessageStream};
use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// RPC wire message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcMessage {
    Call {
        id: u64,
        obj: Value,
        method: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    Reply {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcFault>,
    },
}

/// Error carried by a reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcFault {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&FleetError> for RpcFault {
    fn from(e: &FleetError) -> Self {
        Self {
            message: e.to_string(),
            code: Some(e.code().to_string()),
        }
    }
}

/// Object published to the remote side
#[async_trait]
pub trait RpcStub: Send + Sync + 'static {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value>;
}

/// One end of an RPC connection
pub struct RpcPeer {
    /// Label for logs
    name: String,

    sink: Arc<dyn MessageSink>,

    next_call: AtomicU64,

    next_stub: AtomicU64,

    /// Outstanding calls by id
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,

    /// Published stubs by id
    stubs: Mutex<HashMap<String, Arc<dyn RpcStub>>>,

    /// Cancelled once the stream ends or [`RpcPeer::close`] is called
    closed: CancellationToken,
}

impl RpcPeer {
    /// Create a peer and start dispatching `stream`
    pub fn spawn(
        name: impl Into<String>,
        sink: Arc<dyn MessageSink>,
        stream: MessageStream,
    ) -> Arc<Self> {
        let peer = Arc::new(Self {
            name: name.into(),
            sink,
            next_call: AtomicU64::new(1),
            next_stub: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            stubs: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        });

        tokio::spawn(Self::dispatch(peer.clone(), stream));
        peer
    }

    async fn dispatch(self: Arc<Self>, mut stream: MessageStream) {
        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => break,
                next = stream.next() => next,
            };

            let value = match next {
                Some(Ok(value)) => value,
                Some(Err(e)) => {
                    warn!("RPC peer {}: dropping bad message: {}", self.name, e);
                    continue;
                }
                None => break,
            };

            match serde_json::from_value::<RpcMessage>(value) {
                Ok(RpcMessage::Call {
                    id,
                    obj,
                    method,
                    params,
                }) => self.handle_call(id, obj, method, params),
                Ok(RpcMessage::Reply { id, result, error }) => {
                    let outcome = match error {
                        Some(fault) => Err(FleetError::RpcError(fault.message)),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    match self.pending.lock().remove(&id) {
                        Some(tx) => {
                            let _ = tx.send(outcome);
                        }
                        None => debug!("RPC peer {}: reply for unknown call {}", self.name, id),
                    }
                }
                Err(e) => warn!("RPC peer {}: malformed message: {}", self.name, e),
            }
        }

        self.shutdown();
    }

    fn handle_call(self: &Arc<Self>, id: u64, obj: Value, method: String, params: Vec<Value>) {
        let stub = self.stubs.lock().get(&stub_key(&obj)).cloned();
        let peer = self.clone();

        tokio::spawn(async move {
            let outcome = match stub {
                Some(stub) => stub.call(&method, params).await,
                None => Err(FleetError::RpcError(format!("no such object {}", obj))),
            };
            let reply = match outcome {
                Ok(result) => RpcMessage::Reply {
                    id,
                    result: Some(result),
                    error: None,
                },
                Err(e) => RpcMessage::Reply {
                    id,
                    result: None,
                    error: Some(RpcFault::from(&e)),
                },
            };

            let reply = match serde_json::to_value(&reply) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("RPC peer {}: failed to encode reply: {}", peer.name, e);
                    return;
                }
            };
            if let Err(e) = peer.sink.send_message(reply).await {
                debug!("RPC peer {}: failed to send reply to {}: {}", peer.name, method, e);
            }
        });
    }

    /// Publish `stub` and return the id the remote side addresses it by
    pub fn add_stub(&self, stub: Arc<dyn RpcStub>) -> Value {
        let id = self.next_stub.fetch_add(1, Ordering::Relaxed).to_string();
        self.stubs.lock().insert(id.clone(), stub);
        Value::String(id)
    }

    /// Call `method` on the remote object `obj`
    pub async fn call(&self, obj: &Value, method: &str, params: Vec<Value>) -> Result<Value> {
        if self.closed.is_cancelled() {
            return Err(FleetError::RpcError(format!("{}: connection closed", self.name)));
        }

        let id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if self.closed.is_cancelled() {
            self.pending.lock().remove(&id);
            return Err(FleetError::RpcError(format!("{}: connection closed", self.name)));
        }

        let msg = serde_json::to_value(RpcMessage::Call {
            id,
            obj: obj.clone(),
            method: method.to_string(),
            params,
        })?;
        if let Err(e) = self.sink.send_message(msg).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(FleetError::RpcError(format!(
                "{}: connection closed before {} returned",
                self.name, method
            ))),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the peer is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Stop dispatching and fail every outstanding call
    pub fn close(&self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        self.closed.cancel();
        let pending: Vec<_> = self.pending.lock().drain().collect();
        if !pending.is_empty() {
            debug!(
                "RPC peer {} closed with {} calls outstanding",
                self.name,
                pending.len()
            );
        }
        // dropping the senders fails the waiting callers
        drop(pending);
        self.stubs.lock().clear();
    }
}

fn stub_key(obj: &Value) -> String {
    match obj {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
