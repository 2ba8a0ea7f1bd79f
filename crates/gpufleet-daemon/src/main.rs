//! gpufleet daemon
//!
//! Loads a fleet file, places the declared models on the worker inventory
//! and drives every placed instance through its lifecycle.

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use gpufleet_core::FleetConfig;
use gpufleet_runtime::{HealthChecker, LifecycleManager, ProcessRuntime};
use gpufleet_scheduler::{CapacityLedger, Scheduler};
use gpufleet_store::{Entity, ModelFileCache, Store, WatchFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// gpufleetd - serve model instances across a fleet of GPU workers
#[derive(Parser, Debug)]
#[command(name = "gpufleetd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Fleet file with daemon settings, workers and models
    #[arg(long, default_value = "/etc/gpufleet/fleet.toml")]
    config: PathBuf,

    /// Log level, overrides `logging.level` from the fleet file
    #[arg(long)]
    log_level: Option<String>,

    /// Model storage directory, overrides `storage.models_path`
    #[arg(long)]
    models_path: Option<PathBuf>,
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// `RUST_LOG` wins over the configured level when it is set.
fn init_tracing(level: Level, format: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    if format.eq_ignore_ascii_case("json") {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

async fn log_events(store: Arc<Store>) {
    let mut events = store.watch(WatchFilter::default());
    while let Some(event) = events.next().await {
        match &event.entity {
            Entity::ModelInstance(instance) => info!(
                event = ?event.event_type,
                instance = %instance.name,
                worker = instance.worker_name.as_deref().unwrap_or("-"),
                state = %instance.state,
                message = instance.state_message.as_deref().unwrap_or(""),
                "Instance changed"
            ),
            Entity::Model(spec) => info!(
                event = ?event.event_type,
                model = %spec.name,
                replicas = spec.replicas,
                ready = spec.ready_replicas,
                "Model changed"
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut fleet = FleetConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(path) = args.models_path {
        fleet.daemon.storage.models_path = path;
    }

    let level = parse_level(args.log_level.as_deref().unwrap_or(&fleet.daemon.logging.level));
    init_tracing(level, &fleet.daemon.logging.format)?;

    info!("Starting gpufleet daemon v{}", env!("CARGO_PKG_VERSION"));

    let daemon = fleet.daemon;
    let store = Arc::new(Store::new());
    let ledger = Arc::new(CapacityLedger::from_workers(fleet.workers).await);

    let cache = Arc::new(ModelFileCache::new(
        daemon.storage.models_path.clone(),
        daemon.storage.max_cache_size,
        daemon.storage.lru_eviction,
    ));
    cache
        .init()
        .await
        .with_context(|| format!("initializing {}", daemon.storage.models_path.display()))?;

    let health = HealthChecker::new(
        daemon.runtime.health_path.clone(),
        daemon.lifecycle.health_check_timeout_secs,
    );
    let runtime = Arc::new(ProcessRuntime::new(daemon.runtime.clone(), cache, health));
    let lifecycle = Arc::new(LifecycleManager::new(
        store.clone(),
        runtime,
        daemon.lifecycle.clone(),
    ));
    let scheduler = Arc::new(
        Scheduler::new(store.clone(), ledger, daemon.scheduler.clone())
            .with_supervisor(lifecycle.clone()),
    );

    let events = tokio::spawn(log_events(store.clone()));

    for spec in fleet.models {
        let name = spec.name.clone();
        if let Err(e) = scheduler.create(spec).await {
            error!(model = %name, error = %e, "Rejected model");
        }
    }

    scheduler.start().await;
    info!(
        workers = scheduler.ledger().snapshot().await.len(),
        models_path = %daemon.storage.models_path.display(),
        "Daemon ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    scheduler.shutdown().await;
    lifecycle.shutdown().await;
    events.abort();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("loud"), Level::INFO);
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::parse_from([
            "gpufleetd",
            "--config",
            "fleet.toml",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.config, PathBuf::from("fleet.toml"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.models_path.is_none());
    }
}
