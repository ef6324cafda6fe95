// src/fleet/shard.rs
//! Tenant → shard routing
//!
//! Pure functions shared by the supervisor (which tenants to run at startup)
//! and by clients (which supervisor instance to talk to).

use crate::fleet::tenant::TenantId;
use crate::utils::errors::{FleetError, Result};

/// Shard serving `tenant` (always in `[0, shard_count)`)
///
/// `shard_count` must be at least 1.
pub fn shard_of(tenant: TenantId, shard_count: u32) -> u32 {
    tenant.rem_euclid(i64::from(shard_count.max(1))) as u32
}

/// Check a configured shard index against the shard count
pub fn validate(shard_id: u32, shard_count: u32) -> Result<()> {
    if shard_count == 0 || shard_id >= shard_count {
        return Err(FleetError::ConfigError(format!(
            "Invalid shard number {}, must be between 0 and {}",
            shard_id,
            shard_count.saturating_sub(1)
        )));
    }
    Ok(())
}

/// Shard index from an orchestrator hostname such as `engines-3`
pub fn from_hostname(hostname: &str) -> Result<u32> {
    hostname
        .rsplit_once('-')
        .and_then(|(_, suffix)| suffix.parse::<u32>().ok())
        .ok_or_else(|| {
            FleetError::ConfigError(format!(
                "cannot infer shard number from hostname {:?}",
                hostname
            ))
        })
}
