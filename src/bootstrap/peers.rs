use anyhow::{Context as _, Result};

use super::Context;
use crate::database::{execute_in_transaction, ConnectionDescriptor, Session};
use crate::error::DbError;
use crate::retry::{retry, RetryOn};
use crate::sql::{self, COUNT_SPOCK_NODES};

/// Wait for every peer to come online and subscribe to it.
///
/// Peers are handled one at a time, in spec order. Each subscription operation runs over a fresh
/// admin session in its own transaction, so a failed attempt is rolled back, and a dropped
/// connection is replaced, before it is retried.
#[tracing::instrument(level = "debug", skip(ctx))]
pub async fn subscribe(ctx: &Context) -> Result<()> {
    let (policy, admin) = (ctx.gateway.policy(), &ctx.admin_descriptor());
    for peer in ctx.cluster.peers() {
        tracing::info!(peer = %peer.name, "waiting for peer");
        let provider = ctx.replication_descriptor(peer)?;
        wait_for_peer(ctx, &provider)
            .await
            .with_context(|| format!("error waiting for peer {}", peer.name))?;

        let sub_name = sql::subscription_name(&ctx.cluster.self_node.name, &peer.name);
        if ctx.config.resubscribe {
            let stmts = &[sql::sub_drop(&sub_name)];
            retry(policy, RetryOn::Transient, "waiting for subscription to drop", move || {
                drop_subscription(ctx, admin, stmts)
            })
            .await
            .with_context(|| format!("error dropping subscription {}", sub_name))?;
        }

        let stmts = &[sql::sub_create(&sub_name, &provider.dsn())];
        let name = sub_name.as_str();
        retry(policy, RetryOn::Transient, "waiting for subscription to work", move || {
            create_subscription(ctx, admin, name, stmts)
        })
        .await
        .with_context(|| format!("error creating subscription {}", sub_name))?;
        tracing::info!(peer = %peer.name, subscription = %sub_name, "subscribed to peer");
    }
    Ok(())
}

async fn drop_subscription(ctx: &Context, admin: &ConnectionDescriptor, stmts: &[String]) -> Result<(), DbError> {
    let session = ctx.gateway.connect(admin).await?;
    let res = execute_in_transaction(&*session, stmts).await;
    session.close().await;
    res
}

async fn create_subscription(ctx: &Context, admin: &ConnectionDescriptor, name: &str, stmts: &[String]) -> Result<(), DbError> {
    let session = ctx.gateway.connect(admin).await?;
    let res = create_subscription_on(&*session, name, stmts).await;
    session.close().await;
    res
}

async fn create_subscription_on(session: &dyn Session, name: &str, stmts: &[String]) -> Result<(), DbError> {
    if session.query_count(&sql::count_subscriptions(name)).await? > 0 {
        tracing::info!(subscription = %name, "subscription already exists");
        return Ok(());
    }
    execute_in_transaction(session, stmts).await
}

/// Block until the given peer has registered at least one node in its replication catalog.
///
/// Until the peer has finished bootstrapping itself, its internal user may be unable to log in
/// and its catalog may not exist yet, so unless strict polling is configured every error is
/// treated as a reason to keep waiting. Every poll is made over a new connection.
pub(super) async fn wait_for_peer(ctx: &Context, provider: &ConnectionDescriptor) -> Result<(), DbError> {
    let on = if ctx.config.peer_poll_strict { RetryOn::Transient } else { RetryOn::AnyError };
    retry(ctx.gateway.policy(), on, "peer spock.node not configured", move || poll_peer(ctx, provider)).await
}

async fn poll_peer(ctx: &Context, provider: &ConnectionDescriptor) -> Result<(), DbError> {
    let session = ctx.gateway.connect_once(provider).await?;
    let res = session.query_count(COUNT_SPOCK_NODES).await;
    session.close().await;
    match res? {
        0 => Err(DbError::transient("peer has not registered itself yet")),
        _ => Ok(()),
    }
}
