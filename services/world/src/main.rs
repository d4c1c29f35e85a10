//! magick-world
//!
//! Runs the agent world: a reconciliation loop that keeps local agent
//! workers in sync with the desired state in the store.
//!
//! ## Architecture
//!
//! - **Reconciler**: ticks the orchestrator on a fixed interval
//! - **Orchestrator**: diffs desired state, creates/destroys workers, reloads graphs
//! - **Store**: in-memory store, optionally seeded from a JSON file
//! - **Runtime**: worker lifecycle and graph loading (mock in dev)

use std::sync::Arc;

use anyhow::Result;
use magick_world::config::Config;
use magick_world::{AgentStore, MemoryStore, MockRuntime, Orchestrator, Reconciler, WorkerRuntime};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        port_range = %config.port_range,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        operation_timeout_secs = config.operation_timeout.as_secs(),
        seed_file = ?config.seed_file,
        "Starting magick-world"
    );

    let store: Arc<dyn AgentStore> = match &config.seed_file {
        Some(path) => Arc::new(MemoryStore::from_seed_file(path)?),
        None => Arc::new(MemoryStore::new()),
    };

    // Create the runtime (mock for now)
    let runtime: Arc<dyn WorkerRuntime> = Arc::new(MockRuntime::new());

    let orchestrator = Arc::new(Orchestrator::new(store, runtime, config.orchestrator()));

    if config.reset_spells_on_start {
        if let Err(e) = orchestrator.reset_agent_spells().await {
            warn!(error = %e, "Failed to reset agent spells");
        }
    }

    let mut handle = Reconciler::start(Arc::clone(&orchestrator), config.reconciler());

    // Wait for shutdown signal or a fatal loop error
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            None
        }
        result = handle.wait() => Some(result),
    };
    let result = match result {
        Some(result) => result,
        None => handle.stop().await,
    };

    let removed = orchestrator.shutdown().await;
    info!(removed, "magick-world shutdown complete");

    if let Err(e) = result {
        error!(error = %e, "Reconciliation loop failed");
        return Err(e.into());
    }

    Ok(())
}
