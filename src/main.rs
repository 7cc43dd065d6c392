//! The pgEdge node bootstrap controller.

mod app;
mod bootstrap;
mod config;
mod database;
mod error;
#[cfg(test)]
mod fixtures;
mod grants;
mod retry;
mod spec;
mod sql;
mod version;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;
use crate::database::PgConnector;
use crate::error::ERR_SPEC_NOT_FOUND;
use crate::spec::{Cluster, ClusterSpec};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(Config::new()?);

    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::new(&cfg.rust_log))
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let res = run(cfg).await;
    if let Err(err) = &res {
        tracing::error!(error = ?err, "node bootstrap failed");
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    if res.is_err() {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cfg: Arc<Config>) -> Result<()> {
    let spec_path = std::env::args()
        .nth(1)
        .or_else(|| cfg.spec_path.clone())
        .context(ERR_SPEC_NOT_FOUND)?;
    let spec = ClusterSpec::load(&spec_path)?;
    let cluster = Arc::new(Cluster::resolve(spec, &cfg.node_name, cfg.init_password.as_deref()).context("invalid cluster spec")?);
    tracing::info!(
        spec_path = %spec_path,
        node = %cluster.self_node.name,
        database = %cluster.database_name,
        cluster_id = %cluster.database_id,
        mode = ?cluster.mode,
        "starting pgEdge node bootstrap controller",
    );

    let mut app = App::new(cfg, cluster, Arc::new(PgConnector));
    let interrupted = tokio::select! {
        res = app.run() => {
            let outcome = res?;
            tracing::info!(?outcome, "node bootstrap finished");
            false
        }
        res = wait_for_shutdown_signal() => {
            res?;
            true
        }
    };
    if interrupted {
        tracing::info!(state = ?app.state(), "node bootstrap interrupted");
    }
    Ok(())
}

/// Monitor for SIGINT or SIGTERM, returning when either is received.
async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("error constructing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("error constructing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
    }
    Ok(())
}
