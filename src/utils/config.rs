// src/utils/config.rs
//! Supervisor configuration
//!
//! Layers, lowest priority first:
//! 1. Built-in defaults (every field has one)
//! 2. Config file: `$FLEET_CONFIG`, or `fleet.yaml` in the working directory
//! 3. Environment: `FLEET__SECTION__FIELD`, e.g. `FLEET__SUPERVISOR__POOL_SIZE=8`

use crate::utils::errors::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables always forwarded to workers (plus every `LC_*`)
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "LANG", "LOGNAME", "USER", "PATH", "HOME", "SHELL", "CI",
];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub supervisor: SupervisorConfig,
    pub worker: WorkerConfig,
    pub control: ControlConfig,
    pub shard: ShardConfig,
    pub tenants: TenantStoreConfig,
    pub observability: ObservabilityConfig,
}

/// Pool sizing, restart scheduling and on-disk layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Multiplex non-privileged tenants onto the shared pool
    pub enable_shared_process: bool,

    /// Shared pool size (default: 2 × CPU count)
    pub pool_size: Option<usize>,

    /// Delay before a crashed pool member is respawned
    pub pool_restart_delay_ms: u64,

    /// Delay before a tenant torn down by a crash is started again
    pub tenant_restart_delay_ms: u64,

    /// Grace window between the graceful shutdown request and SIGKILL
    pub kill_timeout_ms: u64,

    /// Root of the per-tenant working directories
    pub data_dir: PathBuf,

    /// Attach a per-tenant catalog client to every engine
    pub embedded_catalog: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enable_shared_process: true,
            pool_size: None,
            pool_restart_delay_ms: 5_000,
            tenant_restart_delay_ms: 10_000,
            kill_timeout_ms: 30_000,
            data_dir: PathBuf::from("."),
            embedded_catalog: false,
        }
    }
}

impl SupervisorConfig {
    /// Number of shared processes to spawn at startup
    pub fn effective_pool_size(&self) -> usize {
        if !self.enable_shared_process {
            return 0;
        }
        self.pool_size.unwrap_or_else(|| {
            let ncpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            2 * ncpus
        })
    }

    pub fn pool_restart_delay(&self) -> Duration {
        Duration::from_millis(self.pool_restart_delay_ms)
    }

    pub fn tenant_restart_delay(&self) -> Duration {
        Duration::from_millis(self.tenant_restart_delay_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

/// How worker processes are launched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Runtime executing the worker image (e.g. `node`)
    pub runtime: PathBuf,

    /// Arguments placed before the entrypoint
    pub runtime_args: Vec<String>,

    /// Worker image entrypoint
    pub entrypoint: PathBuf,

    /// Arguments appended after the entrypoint (service URLs, locales, ...)
    pub worker_args: Vec<String>,

    /// Sandbox executable used for dedicated workers
    pub sandbox: PathBuf,

    /// Run dedicated workers without the sandbox
    pub disable_sandbox: bool,

    /// Host environment variables forwarded to workers
    pub env_allowlist: Vec<String>,

    /// Developer key handed to engines of tenants without their own
    pub default_developer_key: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            runtime: PathBuf::from("node"),
            runtime_args: vec![],
            entrypoint: PathBuf::from("worker.js"),
            worker_args: vec![],
            sandbox: PathBuf::from("sandbox/sandbox"),
            disable_sandbox: false,
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            default_developer_key: None,
        }
    }
}

/// Control-plane endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Control listener: `host:port` or a Unix socket path
    pub address: String,

    /// Direct listener: `host:port` or a Unix socket path
    pub direct_address: String,

    /// Token control clients must present before the stub is published
    pub auth_token: Option<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:3100".to_string(),
            direct_address: "127.0.0.1:3101".to_string(),
            auth_token: None,
        }
    }
}

/// Horizontal partitioning of the tenant population
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Index of the shard served by this instance
    pub id: u32,

    /// Number of shard instances
    pub count: u32,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self { id: 0, count: 1 }
    }
}

/// Source of tenant descriptors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantStoreConfig {
    /// YAML or JSON file listing tenant descriptors
    pub file: PathBuf,
}

impl Default for TenantStoreConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("tenants.yaml"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Prometheus exporter listen address (disabled when unset)
    pub metrics_address: Option<SocketAddr>,
}

impl FleetConfig {
    /// Load configuration from `$FLEET_CONFIG` (or `fleet.yaml`) and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("FLEET_CONFIG").unwrap_or_else(|_| "fleet.yaml".to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load configuration from a specific file (missing file is not an error)
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("FLEET")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: FleetConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.shard.count == 0 {
            return Err(FleetError::ConfigError("shard count must be at least 1".into()));
        }
        if self.shard.id >= self.shard.count {
            return Err(FleetError::ConfigError(format!(
                "Invalid shard number {}, must be between 0 and {}",
                self.shard.id,
                self.shard.count - 1
            )));
        }
        if self.supervisor.kill_timeout_ms == 0 {
            return Err(FleetError::ConfigError("kill timeout cannot be 0".into()));
        }
        Ok(())
    }
}
