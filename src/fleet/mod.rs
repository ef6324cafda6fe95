// src/fleet/mod.rs
//! Tenant placement and fleet supervision
//!
//! - **Tenant**: descriptors, engine options, tenant stores
//! - **Shard**: which tenants belong to this supervisor
//! - **Pool**: the fixed set of shared workers
//! - **Session**: tenant → worker binding
//! - **Supervisor**: lifecycle operations and restart policy

pub mod pool;
pub mod session;
pub mod shard;
pub mod supervisor;
pub mod tenant;

pub use pool::{PoolStats, SharedPool};
pub use session::TenantSession;
pub use supervisor::FleetSupervisor;
pub use tenant::{
    CatalogClient, EngineOptions, FileTenantStore, MemoryTenantStore, TenantDescriptor, TenantId,
    TenantStore,
};
