// src/fleet/session.rs
//! Tenant sessions
//!
//! A session records which worker currently hosts a tenant's engine. It
//! holds the worker weakly: the supervisor's process map owns workers, and a
//! session must never keep a dead one alive.

use crate::fleet::tenant::{CatalogClient, TenantDescriptor, TenantId};
use crate::runtime::worker_process::WorkerProcess;
use std::sync::{Arc, Weak};

pub struct TenantSession {
    /// Distinguishes this session from a later one for the same tenant
    pub serial: u64,

    pub tenant: TenantId,

    /// Name of the tenant's data directory
    pub cloud_id: String,

    /// Bound worker; `None` until selection succeeds
    process: Option<Weak<WorkerProcess>>,

    /// Catalog client published to the engine, freed with the session
    catalog: Option<Arc<CatalogClient>>,
}

impl TenantSession {
    pub fn new(serial: u64, tenant: &TenantDescriptor) -> Self {
        Self {
            serial,
            tenant: tenant.id,
            cloud_id: tenant.cloud_id.clone(),
            process: None,
            catalog: None,
        }
    }

    pub fn bind(&mut self, process: &Arc<WorkerProcess>, catalog: Option<Arc<CatalogClient>>) {
        self.process = Some(Arc::downgrade(process));
        self.catalog = catalog;
    }

    /// Bound worker, if any and still alive
    pub fn process(&self) -> Option<Arc<WorkerProcess>> {
        self.process.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_bound(&self) -> bool {
        self.process().is_some()
    }

    pub fn catalog(&self) -> Option<&Arc<CatalogClient>> {
        self.catalog.as_ref()
    }
}
