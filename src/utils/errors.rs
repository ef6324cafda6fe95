// src/utils/errors.rs
//! Error types for the fleet supervisor
//!
//! Every failure reaching an RPC caller is a [`FleetError`]. Listeners send
//! the message together with [`FleetError::code`] so callers can branch on a
//! stable identifier instead of the text.

use crate::fleet::tenant::TenantId;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, FleetError>;

/// Supervisor errors
#[derive(Debug, Error)]
pub enum FleetError {
    /// The OS refused to spawn a worker (missing executable, fd setup, ...)
    #[error("Failed to spawn worker: {0}")]
    ProcessSpawnFailed(String),

    /// A worker reported an error or exited before it became ready
    #[error("Worker error: {0}")]
    WorkerError(String),

    /// Operation needs an attached worker process
    #[error("Worker {0} is not running")]
    NotRunning(String),

    /// Kill watchdog fired before the worker exited on its own
    #[error("Timeout waiting for child {0} to die")]
    KillTimeout(String),

    #[error("Invalid user ID {0}")]
    InvalidTenant(TenantId),

    #[error("Engine dead")]
    EngineDead(TenantId),

    /// The tenant store has no record of this tenant
    #[error("Tenant {0} not found")]
    TenantNotFound(TenantId),

    /// Process channel failure (write error, closed socket, bad frame)
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// A remote call failed or the peer went away
    #[error("RPC error: {0}")]
    RpcError(String),

    /// Malformed control or direct-connection message
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Tenant store or tenant directory failure
    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Supervisor is stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FleetError {
    /// Stable error code sent to remote callers next to the message
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::ProcessSpawnFailed(_) | FleetError::WorkerError(_) => "E_WORKER_ERROR",
            FleetError::NotRunning(_) | FleetError::EngineDead(_) => "E_ENGINE_DEAD",
            FleetError::KillTimeout(_) => "ETIMEDOUT",
            FleetError::InvalidTenant(_) | FleetError::TenantNotFound(_) => "E_INVALID_USER",
            FleetError::ChannelError(_) | FleetError::RpcError(_) => "E_RPC",
            FleetError::ProtocolError(_) => "E_PROTOCOL",
            FleetError::AuthenticationFailed(_) => "E_AUTH",
            FleetError::StorageFailed(_) | FleetError::Io(_) => "E_IO",
            FleetError::ConfigError(_) => "E_INVALID_CONFIG",
            FleetError::Stopped => "E_STOPPED",
            FleetError::Serialization(_) => "E_PROTOCOL",
        }
    }
}

impl From<config::ConfigError> for FleetError {
    fn from(e: config::ConfigError) -> Self {
        FleetError::ConfigError(e.to_string())
    }
}

impl From<nix::Error> for FleetError {
    fn from(e: nix::Error) -> Self {
        FleetError::Io(std::io::Error::from(e))
    }
}
