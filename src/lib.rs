// src/lib.rs
//! Fleet Supervisor Library
//!
//! Runs tenant engines in worker processes: a fixed pool of shared workers
//! for ordinary tenants and one sandboxed worker per privileged tenant.
//!
//! # Architecture
//!
//! The supervisor is structured into several modules:
//!
//! - **control**: control (RPC) and direct (socket hand-off) listeners
//! - **fleet**: tenant placement, sessions, restart policy, shard routing
//! - **runtime**: worker process lifecycle, spawning, sandbox contract
//! - **ipc**: process channel, message types, RPC peer, framed transports
//! - **observability**: tracing and metrics
//! - **utils**: configuration, errors, filesystem helpers

pub mod control;
pub mod fleet;
pub mod ipc;
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use fleet::supervisor::FleetSupervisor;
pub use fleet::tenant::{TenantDescriptor, TenantId, TenantStore};
pub use runtime::process_manager::ProcessManager;
pub use utils::config::FleetConfig;
pub use utils::errors::{FleetError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Supervisor build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
