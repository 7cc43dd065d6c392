use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};

use crate::bootstrap::{self, Context, Detection};
use crate::config::Config;
use crate::database::{Connector, Gateway};
use crate::spec::{Cluster, Mode};

/// The bootstrap state of this node, as derived during a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    Uninitialized,
    RolesProvisioned,
    TopologyRegistered,
    Peering,
    Initialized,
    /// The node is offline and will not be bootstrapped.
    Suspended,
}

/// How a completed run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A previous run already initialized this node.
    AlreadyInitialized,
    /// This run initialized the node.
    Initialized,
}

/// The application object driving the bootstrap of one node.
pub struct App {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The resolved cluster description.
    cluster: Arc<Cluster>,
    /// The driver used to open database sessions.
    connector: Arc<dyn Connector>,
    state: BootstrapState,
}

impl App {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, cluster: Arc<Cluster>, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            cluster,
            connector,
            state: BootstrapState::Uninitialized,
        }
    }

    /// The current bootstrap state.
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Run the bootstrap sequence to completion.
    ///
    /// In offline mode this never returns, and must be cancelled externally.
    pub async fn run(&mut self) -> Result<Outcome> {
        if self.cluster.mode == Mode::Offline {
            self.transition(BootstrapState::Suspended);
            tracing::info!("node is offline, skipping initialization");
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        let gateway = Gateway::new(self.connector.clone(), self.config.retry_policy(), self.config.probe_timeout());
        let ctx = Context::new(self.config.clone(), self.cluster.clone(), gateway).context("invalid bootstrap configuration")?;
        tracing::info!(
            node = %ctx.cluster.self_node.name,
            database = %ctx.cluster.database_name,
            version = %ctx.version,
            "starting node bootstrap"
        );

        if bootstrap::detect(&ctx).await == Detection::AlreadyInitialized {
            tracing::info!("database already initialized, skipping initialization");
            return Ok(Outcome::AlreadyInitialized);
        }

        bootstrap::provision(&ctx).await?;
        self.transition(BootstrapState::RolesProvisioned);

        bootstrap::register(&ctx).await?;
        self.transition(BootstrapState::TopologyRegistered);

        // Give peers a chance to reach their own registration.
        tokio::time::sleep(self.config.peer_delay()).await;
        self.transition(BootstrapState::Peering);
        bootstrap::subscribe(&ctx).await?;
        self.transition(BootstrapState::Initialized);

        tracing::info!("database initialization complete");
        Ok(Outcome::Initialized)
    }

    fn transition(&mut self, next: BootstrapState) {
        tracing::info!(from = ?self.state, to = ?next, "bootstrap state transition");
        self.state = next;
    }
}
