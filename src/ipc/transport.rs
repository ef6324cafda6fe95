// src/ipc/transport.rs
//! Transport adapter between a worker's process channel and the RPC layer
//!
//! The RPC layer speaks in whole JSON values. Outbound values are wrapped as
//! `{type: 'rpc', data}` and written to the channel; inbound envelopes of
//! the same shape are unwrapped by the channel reader and pushed onto the
//! read side with [`ChannelTransport::push`].

use crate::ipc::channel::ProcessChannel;
use crate::ipc::message::ChannelMessage;
use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Write half of a duplex message transport
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn send_message(&self, msg: Value) -> Result<()>;
}

/// Read half of a duplex message transport
pub type MessageStream = BoxStream<'static, Result<Value>>;

/// RPC transport over a worker's process channel
pub struct ChannelTransport {
    channel: Arc<ProcessChannel>,

    /// Read side feed; `None` once closed
    inbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl ChannelTransport {
    /// Create the adapter and its read side
    pub fn new(channel: Arc<ProcessChannel>) -> (Arc<Self>, MessageStream) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

        let transport = Arc::new(Self {
            channel,
            inbound: Mutex::new(Some(tx)),
        });
        let read_side = stream::poll_fn(move |cx| {
            rx.poll_recv(cx).map(|v| v.map(Ok::<Value, FleetError>))
        })
        .boxed();

        (transport, read_side)
    }

    /// Deliver an unwrapped inbound payload; `false` if the read side is gone
    pub fn push(&self, data: Value) -> bool {
        match self.inbound.lock().as_ref() {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    /// End the read side (the worker closed its channel or exited)
    pub fn close(&self) {
        self.inbound.lock().take();
    }
}

#[async_trait]
impl MessageSink for ChannelTransport {
    async fn send_message(&self, msg: Value) -> Result<()> {
        self.channel
            .send(&ChannelMessage::Rpc { data: msg })
            .await
            .map_err(|e| FleetError::ChannelError(format!("rpc write failed: {}", e)))
    }
}
