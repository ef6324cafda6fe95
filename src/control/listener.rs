// src/control/listener.rs
//! Socket listeners shared by the control and direct endpoints
//!
//! An address containing a `/` is a Unix socket path; anything else is a
//! TCP `host:port`.

use crate::ipc::framed::BoxConnection;
use crate::utils::errors::{FleetError, Result};
use std::future::Future;
use std::path::PathBuf;
use tokio::net::{TcpListener, UnixListener};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Where a listener binds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp(String),
    Unix(PathBuf),
}

impl ListenAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(FleetError::ConfigError("empty listen address".into()));
        }
        if address.contains('/') {
            return Ok(ListenAddress::Unix(PathBuf::from(address)));
        }
        if !address.contains(':') {
            return Err(FleetError::ConfigError(format!(
                "listen address {} is neither host:port nor a socket path",
                address
            )));
        }
        Ok(ListenAddress::Tcp(address.to_string()))
    }
}

/// A bound TCP or Unix listener
pub enum BoundListener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl BoundListener {
    pub async fn bind(address: &ListenAddress) -> Result<Self> {
        match address {
            ListenAddress::Tcp(addr) => Ok(BoundListener::Tcp(TcpListener::bind(addr).await?)),
            ListenAddress::Unix(path) => {
                // stale socket from a previous run
                match std::fs::remove_file(path) {
                    Ok(()) => debug!("Removed stale socket {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(BoundListener::Unix(UnixListener::bind(path)?, path.clone()))
            }
        }
    }

    /// Human-readable bound address
    pub fn local_addr(&self) -> String {
        match self {
            BoundListener::Tcp(listener) => listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            BoundListener::Unix(_, path) => path.display().to_string(),
        }
    }

    pub async fn accept(&self) -> Result<BoxConnection> {
        match self {
            BoundListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!("Accepted connection from {}", peer);
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            BoundListener::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl Drop for BoundListener {
    fn drop(&mut self) {
        if let BoundListener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// A running accept loop
pub struct ListenerHandle {
    name: &'static str,
    local_addr: String,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Stop accepting and close every open connection
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!("{} listener task failed: {}", self.name, e);
        }
        info!("{} listener stopped", self.name);
    }
}

/// Run `handler` on every accepted connection until stopped
///
/// Each connection gets a token that is cancelled when the listener stops;
/// `stop()` returns once every handler has returned.
pub fn serve<H, F>(name: &'static str, listener: BoundListener, handler: H) -> ListenerHandle
where
    H: Fn(BoxConnection, CancellationToken) -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let shutdown = CancellationToken::new();
    let local_addr = listener.local_addr();
    info!("{} listener on {}", name, local_addr);

    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        connections.spawn(handler(conn, token.child_token()));
                    }
                    Err(e) => error!("{} listener failed to accept: {}", name, e),
                },
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}
    });

    ListenerHandle {
        name,
        local_addr,
        shutdown,
        task,
    }
}
