// src/fleet/tenant.rs
//! Tenant descriptors and the stores they come from
//!
//! Descriptors are owned by the surrounding application; the supervisor only
//! reads them, once per start. Two stores are provided:
//!
//! - [`FileTenantStore`]: YAML (or JSON) list of descriptors, re-read per call
//! - [`MemoryTenantStore`]: in-process map, for embedding and tests

use crate::fleet::shard;
use crate::ipc::rpc::RpcStub;
use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

/// Tenant (user account) id
pub type TenantId = i64;

/// One tenant as known to the application database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantDescriptor {
    pub id: TenantId,

    /// Stable directory name for the tenant's data
    pub cloud_id: String,

    /// Tenants with their own developer key always get a dedicated worker
    #[serde(default)]
    pub developer_key: Option<String>,

    #[serde(default)]
    pub force_separate_process: bool,

    #[serde(default = "default_locale")]
    pub locale: String,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub auth_token: String,

    #[serde(default)]
    pub storage_key: String,

    #[serde(default = "default_model_tag")]
    pub model_tag: String,
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_timezone() -> String {
    "America/Los_Angeles".to_string()
}

fn default_model_tag() -> String {
    "default".to_string()
}

impl TenantDescriptor {
    /// Whether this tenant must run in its own worker process
    pub fn needs_dedicated_process(&self) -> bool {
        self.developer_key.is_some() || self.force_separate_process
    }
}

/// Descriptor as handed to the engine factory's `runEngine`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineOptions {
    pub user_id: TenantId,
    pub cloud_id: String,
    pub auth_token: String,
    pub developer_key: Option<String>,
    pub locale: String,
    pub timezone: String,
    pub storage_key: String,
    pub model_tag: String,
}

impl EngineOptions {
    /// Sanitized view of `tenant`
    ///
    /// Tenants without a developer key get `default_key`, unless the catalog
    /// is embedded (the embedded catalog resolves keys itself).
    pub fn from_descriptor(
        tenant: &TenantDescriptor,
        default_key: Option<&str>,
        embedded_catalog: bool,
    ) -> Self {
        let developer_key = match (&tenant.developer_key, embedded_catalog) {
            (Some(key), _) => Some(key.clone()),
            (None, true) => None,
            (None, false) => default_key.map(str::to_string),
        };

        Self {
            user_id: tenant.id,
            cloud_id: tenant.cloud_id.clone(),
            auth_token: tenant.auth_token.clone(),
            developer_key,
            locale: tenant.locale.clone(),
            timezone: tenant.timezone.clone(),
            storage_key: tenant.storage_key.clone(),
            model_tag: tenant.model_tag.clone(),
        }
    }
}

/// Per-tenant catalog handle published to the tenant's engine
#[derive(Debug, Clone)]
pub struct CatalogClient {
    developer_key: Option<String>,
    locale: String,
}

impl CatalogClient {
    pub fn new(tenant: &TenantDescriptor) -> Self {
        Self {
            developer_key: tenant.developer_key.clone(),
            locale: tenant.locale.clone(),
        }
    }
}

#[async_trait]
impl RpcStub for CatalogClient {
    async fn call(&self, method: &str, _params: Vec<Value>) -> Result<Value> {
        match method {
            "getDeveloperKey" => Ok(json!(self.developer_key)),
            "getLocale" => Ok(json!(self.locale)),
            other => Err(FleetError::RpcError(format!(
                "catalog client has no method {}",
                other
            ))),
        }
    }
}

/// Source of tenant descriptors
#[async_trait]
pub trait TenantStore: Send + Sync + 'static {
    /// Look up one tenant
    async fn get(&self, id: TenantId) -> Result<TenantDescriptor>;

    /// Every tenant routed to `shard_id` out of `shard_count`
    async fn list_for_shard(&self, shard_id: u32, shard_count: u32)
        -> Result<Vec<TenantDescriptor>>;
}

/// Tenant list stored in a YAML or JSON file
pub struct FileTenantStore {
    path: PathBuf,
}

impl FileTenantStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<TenantDescriptor>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Tenant file {:?} not found, no tenants", self.path);
                return Ok(vec![]);
            }
            Err(e) => {
                return Err(FleetError::StorageFailed(format!(
                    "failed to read {:?}: {}",
                    self.path, e
                )))
            }
        };

        if text.trim().is_empty() {
            return Ok(vec![]);
        }
        // YAML is a superset of JSON, one parser covers both
        serde_yaml::from_str::<Vec<TenantDescriptor>>(&text)
            .map_err(|e| FleetError::StorageFailed(format!("failed to parse {:?}: {}", self.path, e)))
    }
}

#[async_trait]
impl TenantStore for FileTenantStore {
    async fn get(&self, id: TenantId) -> Result<TenantDescriptor> {
        self.load()
            .await?
            .into_iter()
            .find(|t| t.id == id)
            .ok_or(FleetError::TenantNotFound(id))
    }

    async fn list_for_shard(
        &self,
        shard_id: u32,
        shard_count: u32,
    ) -> Result<Vec<TenantDescriptor>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|t| shard::shard_of(t.id, shard_count) == shard_id)
            .collect())
    }
}

/// In-memory tenant store
#[derive(Default)]
pub struct MemoryTenantStore {
    tenants: RwLock<BTreeMap<TenantId, TenantDescriptor>>,
}

impl MemoryTenantStore {
    pub fn new(tenants: impl IntoIterator<Item = TenantDescriptor>) -> Self {
        Self {
            tenants: RwLock::new(tenants.into_iter().map(|t| (t.id, t)).collect()),
        }
    }

    /// Insert or replace a descriptor
    pub fn upsert(&self, tenant: TenantDescriptor) {
        self.tenants.write().insert(tenant.id, tenant);
    }

    pub fn remove(&self, id: TenantId) -> Option<TenantDescriptor> {
        self.tenants.write().remove(&id)
    }
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
    async fn get(&self, id: TenantId) -> Result<TenantDescriptor> {
        self.tenants
            .read()
            .get(&id)
            .cloned()
            .ok_or(FleetError::TenantNotFound(id))
    }

    async fn list_for_shard(
        &self,
        shard_id: u32,
        shard_count: u32,
    ) -> Result<Vec<TenantDescriptor>> {
        Ok(self
            .tenants
            .read()
            .values()
            .filter(|t| shard::shard_of(t.id, shard_count) == shard_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(crate) fn tenant(id: TenantId) -> TenantDescriptor {
    TenantDescriptor {
        id,
        cloud_id: format!("cloud-{}", id),
        developer_key: None,
        force_separate_process: false,
        locale: default_locale(),
        timezone: default_timezone(),
        auth_token: format!("token-{}", id),
        storage_key: format!("storage-{}", id),
        model_tag: default_model_tag(),
    }
}
