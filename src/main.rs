// src/main.rs
//! Fleet Supervisor
//!
//! Runs one shard of tenant engines: a pool of shared worker processes plus
//! sandboxed dedicated workers, controlled over the control and direct
//! listeners.

use anyhow::{Context, Result};
use clap::Parser;
use fleet_supervisor::control::{BoundListener, ControlListener, DirectListener, ListenAddress};
use fleet_supervisor::fleet::shard;
use fleet_supervisor::fleet::tenant::FileTenantStore;
use fleet_supervisor::observability::{init_metrics, init_tracing};
use fleet_supervisor::{BuildInfo, FleetConfig, FleetSupervisor, ProcessManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "fleet-supervisor", version, about = "Multi-tenant engine process supervisor")]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Shard number for this process
    #[arg(short, long)]
    shard: Option<u32>,

    /// Infer the shard number from the hostname (`name-<N>`)
    #[arg(long)]
    k8s: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing()?;

    let build = BuildInfo::current();
    info!(
        "Starting Fleet Supervisor v{} ({}, built {} with {})",
        build.version, build.git_hash, build.build_timestamp, build.rustc_version
    );

    let mut config = match &args.config {
        Some(path) => FleetConfig::load_from(path),
        None => FleetConfig::load(),
    }
    .context("Failed to load configuration")?;

    if args.k8s {
        info!("Running in Kubernetes.");
        let hostname = nix::unistd::gethostname().context("Failed to read hostname")?;
        let hostname = hostname.to_string_lossy();
        config.shard.id = shard::from_hostname(&hostname)?;
        info!("Inferred hostname: {}, shard: {}", hostname, config.shard.id);
    } else if let Some(id) = args.shard {
        config.shard.id = id;
    }
    shard::validate(config.shard.id, config.shard.count)?;

    init_metrics(&config.observability)?;

    let store = Arc::new(FileTenantStore::new(config.tenants.file.clone()));
    let supervisor = FleetSupervisor::new(&config, Arc::new(ProcessManager::new()), store);

    let control_listener = BoundListener::bind(&ListenAddress::parse(&config.control.address)?)
        .await
        .context("Failed to bind the control listener")?;
    let direct_listener =
        BoundListener::bind(&ListenAddress::parse(&config.control.direct_address)?)
            .await
            .context("Failed to bind the direct listener")?;

    let control = ControlListener::new(supervisor.clone(), config.control.auth_token.clone())
        .start(control_listener);
    let direct = DirectListener::new(supervisor.clone()).start(direct_listener);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        result = supervisor.start() => {
            if let Err(e) = result {
                error!("Failed to start: {}", e);
                control.stop().await;
                direct.stop().await;
                supervisor.stop().await;
                return Err(e.into());
            }
            info!("Shard {} is up", supervisor.shard_id());
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }
        _ = sigterm.recv() => info!("Received SIGTERM during startup"),
        _ = sigint.recv() => info!("Received SIGINT during startup"),
    }

    info!("Shutting down...");
    tokio::join!(supervisor.stop(), control.stop(), direct.stop());
    info!("Fleet Supervisor stopped");
    Ok(())
}
