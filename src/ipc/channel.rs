// src/ipc/channel.rs
//! Native message channel to one worker process
//!
//! The supervisor keeps one end of a Unix socketpair; the worker inherits the
//! other end as fd 4. Frames are newline-delimited JSON [`ChannelMessage`]s.
//! A frame may carry one file descriptor as `SCM_RIGHTS` ancillary data,
//! which is how direct client connections are handed to the worker.

use crate::ipc::message::ChannelMessage;
use crate::utils::errors::{FleetError, Result};
use futures::StreamExt;
use nix::sys::socket::{sendmsg, ControlMessage as Cmsg, MsgFlags, UnixAddr};
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, trace};

/// Frames larger than this are dropped by the reader
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write side of a worker channel
pub struct ProcessChannel {
    /// Worker id, for logs
    id: String,

    /// Serializes frames so concurrent senders never interleave bytes
    writer: Mutex<OwnedWriteHalf>,

    /// Cleared once the reader sees end-of-stream
    connected: AtomicBool,
}

/// Read side of a worker channel
pub struct ChannelReader {
    id: String,
    frames: FramedRead<OwnedReadHalf, LinesCodec>,
}

impl ProcessChannel {
    /// Wrap a connected tokio socket
    pub fn new(id: impl Into<String>, stream: UnixStream) -> (Arc<Self>, ChannelReader) {
        let id = id.into();
        let (read_half, write_half) = stream.into_split();

        let channel = Arc::new(Self {
            id: id.clone(),
            writer: Mutex::new(write_half),
            connected: AtomicBool::new(true),
        });
        let reader = ChannelReader {
            id,
            frames: FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
        };

        (channel, reader)
    }

    /// Wrap the parent end of a socketpair created before spawning
    pub fn from_std(
        id: impl Into<String>,
        stream: std::os::unix::net::UnixStream,
    ) -> io::Result<(Arc<Self>, ChannelReader)> {
        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;
        Ok(Self::new(id, stream))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Send one message
    pub async fn send(&self, msg: &ChannelMessage) -> Result<()> {
        self.send_with_fd(msg, None).await
    }

    /// Send one message, attaching `fd` to its first byte
    ///
    /// The descriptor is duplicated into the worker by the kernel; the caller
    /// keeps ownership of its own copy.
    pub async fn send_with_fd(&self, msg: &ChannelMessage, fd: Option<RawFd>) -> Result<()> {
        if !self.is_connected() {
            return Err(FleetError::ChannelError(format!(
                "channel to {} is disconnected",
                self.id
            )));
        }

        let mut frame = serde_json::to_vec(msg)?;
        frame.push(b'\n');

        let writer = self.writer.lock().await;
        let stream: &UnixStream = writer.as_ref();
        let raw = stream.as_raw_fd();

        let fds: Vec<RawFd> = fd.into_iter().collect();
        let mut pending_fds = !fds.is_empty();
        let mut offset = 0;

        while offset < frame.len() {
            stream.writable().await.map_err(|e| {
                FleetError::ChannelError(format!("channel to {} failed: {}", self.id, e))
            })?;

            let result = stream.try_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&frame[offset..])];
                let rights = [Cmsg::ScmRights(&fds)];
                let cmsgs: &[Cmsg<'_>] = if pending_fds { &rights } else { &[] };
                sendmsg::<UnixAddr>(raw, &iov, cmsgs, MsgFlags::empty(), None)
                    .map_err(io::Error::from)
            });

            match result {
                Ok(written) => {
                    offset += written;
                    pending_fds = false;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    return Err(FleetError::ChannelError(format!(
                        "failed to write to {}: {}",
                        self.id, e
                    )));
                }
            }
        }

        trace!("Sent {} byte frame to {}", frame.len(), self.id);
        Ok(())
    }
}

impl ChannelReader {
    /// Next decoded message; `None` once the worker closed its end
    ///
    /// Frames that are not valid messages are reported as errors and the
    /// reader stays usable.
    pub async fn next_message(&mut self) -> Option<Result<ChannelMessage>> {
        loop {
            match self.frames.next().await? {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(&line).map_err(|e| {
                        FleetError::ProtocolError(format!("bad frame from {}: {}", self.id, e))
                    }));
                }
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Some(Err(FleetError::ProtocolError(format!(
                        "oversized frame from {}",
                        self.id
                    ))));
                }
                Err(LinesCodecError::Io(e)) => {
                    debug!("Channel to {} closed with error: {}", self.id, e);
                    return None;
                }
            }
        }
    }
}
