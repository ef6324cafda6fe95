// src/fleet/pool.rs
//! Shared worker pool
//!
//! A fixed set of shared workers, created once at supervisor startup and
//! never resized. Tenants without a developer key are spread across them
//! round-robin.
//!
//! # Architecture
//!
//! ```text
//! SharedPool
//! ├─ members: [0/S0, 0/S1, 0/S2, 0/S3]   (fixed at startup)
//! └─ cursor:  n-th assignment → members[n mod len]
//! ```
//!
//! A crashed member keeps its slot; it is respawned in place and rejoins
//! the rotation once ready.

use crate::runtime::worker_process::{WorkerContext, WorkerId, WorkerProcess, WorkerState};
use crate::utils::errors::Result;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

pub struct SharedPool {
    members: Vec<Arc<WorkerProcess>>,

    /// Index of the member receiving the next assignment
    cursor: usize,
}

impl SharedPool {
    /// Create (but do not start) `size` shared workers for `shard`
    pub fn new(shard: u32, size: usize, ctx: &Arc<WorkerContext>) -> Self {
        let members = (0..size)
            .map(|i| WorkerProcess::shared(WorkerId::slot(shard, i), ctx.clone()))
            .collect();
        Self::from_members(members)
    }

    pub fn from_members(members: Vec<Arc<WorkerProcess>>) -> Self {
        Self { members, cursor: 0 }
    }

    pub fn empty() -> Self {
        Self::from_members(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[Arc<WorkerProcess>] {
        &self.members
    }

    /// Member for the next assignment; advances the cursor
    pub fn next(&mut self) -> Option<Arc<WorkerProcess>> {
        if self.members.is_empty() {
            return None;
        }
        let member = self.members[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.members.len();
        Some(member)
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.members.len(),
            ready: self
                .members
                .iter()
                .filter(|m| m.state() == WorkerState::Ready)
                .count(),
            engines: self.members.iter().map(|m| m.use_count()).sum(),
        }
    }
}

/// Start every member concurrently; the first failure is returned after
/// all starts have settled
pub async fn start_all(members: &[Arc<WorkerProcess>]) -> Result<()> {
    info!("Starting {} shared processes", members.len());

    let results = join_all(members.iter().map(|m| m.start())).await;
    let mut first_error = None;
    for (member, result) in members.iter().zip(results) {
        if let Err(e) = result {
            warn!("Shared process {} failed to start: {}", member.id(), e);
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub ready: usize,

    /// Engines hosted across all members
    pub engines: usize,
}
