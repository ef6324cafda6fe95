// src/ipc/framed.rs
//! Framed JSON transport over listener connections
//!
//! One JSON value per line, in both directions. The same framing is used
//! for the control-plane handshake and for the RPC traffic that follows it.

use crate::ipc::transport::{MessageSink, MessageStream};
use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::os::fd::{AsRawFd, RawFd};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec};

use crate::ipc::channel::MAX_FRAME_LEN;

/// Any accepted stream socket (TCP or Unix)
pub trait Connection: AsyncRead + AsyncWrite + AsRawFd + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + AsRawFd + Send + Unpin + 'static {}

pub type BoxConnection = Box<dyn Connection>;

type LineFramed = Framed<BoxConnection, LinesCodec>;

/// Newline-delimited JSON over a connection
pub struct JsonFramed {
    framed: LineFramed,
}

impl JsonFramed {
    pub fn new(conn: BoxConnection) -> Self {
        Self {
            framed: Framed::new(conn, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
        }
    }

    /// Next value decoded as `T`; `None` at end of stream
    pub async fn read<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
        let value = match self.read_value().await? {
            Ok(value) => value,
            Err(e) => return Some(Err(e)),
        };
        Some(serde_json::from_value(value).map_err(|e| FleetError::ProtocolError(e.to_string())))
    }

    /// Next raw value; blank lines are skipped
    pub async fn read_value(&mut self) -> Option<Result<Value>> {
        loop {
            let line = match self.framed.next().await? {
                Ok(line) => line,
                Err(e) => return Some(Err(FleetError::ProtocolError(e.to_string()))),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(FleetError::from));
        }
    }

    pub async fn write<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let line = serde_json::to_string(msg)?;
        self.framed
            .send(line)
            .await
            .map_err(|e| FleetError::ChannelError(e.to_string()))
    }

    /// Flush and shut down the write side
    pub async fn close(mut self) -> Result<()> {
        SinkExt::<String>::close(&mut self.framed)
            .await
            .map_err(|e| FleetError::ChannelError(e.to_string()))
    }

    /// Whether bytes past the last decoded line are already buffered
    pub fn has_buffered_input(&self) -> bool {
        !self.framed.read_buffer().is_empty()
    }

    /// Descriptor of the underlying socket
    pub fn raw_fd(&self) -> RawFd {
        self.framed.get_ref().as_raw_fd()
    }

    /// Split into a message sink and a decoded message stream
    pub fn into_transport(self) -> (FramedSink, MessageStream) {
        let (sink, stream) = self.framed.split();
        let stream = stream
            .map(|line| match line {
                Ok(line) => serde_json::from_str::<Value>(&line).map_err(FleetError::from),
                Err(e) => Err(FleetError::ProtocolError(e.to_string())),
            })
            .boxed();

        (
            FramedSink {
                sink: Mutex::new(sink),
            },
            stream,
        )
    }
}

/// Write half produced by [`JsonFramed::into_transport`]
pub struct FramedSink {
    sink: Mutex<SplitSink<LineFramed, String>>,
}

impl FramedSink {
    pub async fn close(&self) -> Result<()> {
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| FleetError::ChannelError(e.to_string()))
    }
}

#[async_trait]
impl MessageSink for FramedSink {
    async fn send_message(&self, msg: Value) -> Result<()> {
        let line = serde_json::to_string(&msg)?;
        self.sink
            .lock()
            .await
            .send(line)
            .await
            .map_err(|e| FleetError::ChannelError(e.to_string()))
    }
}
