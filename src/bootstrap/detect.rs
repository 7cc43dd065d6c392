use super::Context;

/// The outcome of bootstrap state detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Detection {
    /// A previous run completed provisioning; there is nothing to do.
    AlreadyInitialized,
    /// The node still needs to be bootstrapped.
    NeedsBootstrap,
}

/// Decide whether this node has already been initialized.
///
/// A node is initialized once a previous run dropped the bootstrap database, which leaves the
/// bootstrap credentials unusable while the admin credentials work. Both are probed because
/// neither is reachable while the server is still starting up.
#[tracing::instrument(level = "debug", skip(ctx))]
pub async fn detect(ctx: &Context) -> Detection {
    // Give the local server a moment to start accepting connections.
    tokio::time::sleep(ctx.config.startup_delay()).await;

    let bootstrap_reachable = ctx.gateway.probe(&ctx.bootstrap_descriptor()).await;
    let admin_reachable = ctx.gateway.probe(&ctx.admin_descriptor()).await;
    tracing::debug!(bootstrap_reachable, admin_reachable, "probed local server");
    if !bootstrap_reachable && admin_reachable {
        Detection::AlreadyInitialized
    } else {
        Detection::NeedsBootstrap
    }
}
