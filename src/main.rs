//! # constraint-sync - Controller entry point
//!
//! ## Initialization Sequence
//!
//! 1. **Config** - Load the controller config and apply environment overrides
//! 2. **Tracing** - Install the subscriber with the configured filter and format
//! 3. **Store** - Load constraint manifests into the resource store
//! 4. **Reconciler** - Wire store, policy engine, stats reporter and switch
//! 5. **Reconciliation Loop** - Run until Ctrl-C
//!
//! ## Shutdown
//!
//! On Ctrl-C the switch is turned off first, which waits for every in-flight
//! pass to finish. The loop is stopped after that and final totals are logged.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod manifests;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use constraint_reconciler::{
    ControllerConfig, ControllerSwitch, GaugeReporter, InMemoryPolicyEngine,
    InMemoryResourceStore, ReconcilerBuilder, ReconciliationLoop,
};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, manifests } => {
            let config = load_config(config.as_deref())?;
            init_tracing(&config);
            run(config, &manifests).await
        }
        Commands::CheckConfig { config } => {
            let config = load_config(config.as_deref())?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render effective config")?;
            println!("{rendered}");
            Ok(())
        }
    }
}

/// Read the config file if given, then apply `CONSTRAINT_SYNC_*` overrides.
fn load_config(path: Option<&Path>) -> Result<ControllerConfig> {
    let base = match path {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    base.with_env_overrides()
        .context("Invalid environment override")
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing(config: &ControllerConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(config: ControllerConfig, manifests: &Path) -> Result<()> {
    let start_time = Instant::now();
    info!("constraint-sync starting...");

    let store = InMemoryResourceStore::new_arc();
    let notifications = store.subscribe();
    manifests::load_into(manifests, &store)
        .await
        .context("Loading constraint manifests failed")?;

    let engine = Arc::new(InMemoryPolicyEngine::new());
    let reporter = Arc::new(GaugeReporter::new());
    let switch = Arc::new(ControllerSwitch::new());

    let reconciler = ReconcilerBuilder::new()
        .with_store(store.clone())
        .with_engine(engine.clone())
        .with_reporter(reporter.clone())
        .with_gate(switch.clone())
        .with_config(config.reconciler_config())
        .build()
        .context("Reconciler initialization failed")?;
    let reconciler = Arc::new(reconciler);
    info!("Reconciler initialized");

    let control_loop = Arc::new(
        ReconciliationLoop::new(reconciler.clone(), config.loop_config())
            .context("Reconciliation loop initialization failed")?,
    );
    let stopper = control_loop.stopper();
    let loop_handle = {
        let control_loop = control_loop.clone();
        tokio::spawn(async move { control_loop.run(notifications).await })
    };
    info!(
        startup_ms = u64::try_from(start_time.elapsed().as_millis()).unwrap_or(u64::MAX),
        "Reconciliation loop started"
    );

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    switch.stop().await;
    if let Err(e) = stopper.stop() {
        warn!(error = %e, "Loop already stopping");
    }

    match loop_handle.await {
        Ok(Ok(stats)) => info!(
            passes = stats.passes,
            errors = stats.errors,
            requeues = stats.requeues,
            "Loop finished"
        ),
        Ok(Err(e)) => warn!(error = %e, "Loop exited with error"),
        Err(e) => warn!(error = %e, "Loop task failed"),
    }

    for (tag, count) in reporter.snapshot().await {
        info!(
            enforcement_action = %tag.enforcement_action,
            status = %tag.status,
            count,
            "Final constraint total"
        );
    }
    info!(
        rules_loaded = engine.len().await,
        constraints = store.len().await,
        "constraint-sync stopped gracefully"
    );
    Ok(())
}
