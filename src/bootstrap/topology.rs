use anyhow::{Context as _, Result};

use super::roles::suppress_logging;
use super::Context;
use crate::database::{execute_in_transaction, ConnectionDescriptor, Session};
use crate::error::DbError;
use crate::grants::{user_grants, ALL_SCHEMAS, APP_SCHEMAS};
use crate::retry::{retry, RetryOn};
use crate::spec::RoleClass;
use crate::sql;

/// Install extensions, apply user grants and register this node in the replication catalog.
///
/// Registration is guarded so that it is a no-op for a node which is already registered, which
/// makes the whole phase safe to repeat. Grants are applied once more scoped to the application
/// schema over the admin connection, and then again over the internal connection, as the admin
/// and internal principals see different sets of objects.
#[tracing::instrument(level = "debug", skip(ctx))]
pub async fn register(ctx: &Context) -> Result<()> {
    let self_dsn = ctx
        .replication_descriptor(&ctx.cluster.self_node)
        .context("error building replication DSN of this node")?
        .dsn();

    let mut stmts = sql::create_extensions();
    for user in ctx.cluster.users.iter().filter(|user| user.class == RoleClass::PoolerAuth) {
        stmts.push(sql::grant_shadow_read(&user.username));
    }
    stmts.extend(grants(ctx, ALL_SCHEMAS));
    stmts.push(sql::node_create(&ctx.cluster.self_node.name, &self_dsn, ctx.config.node_create_guard));
    apply(ctx, &ctx.internal_descriptor(), &stmts, true)
        .await
        .context("error registering node in replication catalog")?;
    tracing::info!(node = %ctx.cluster.self_node.name, "registered node in replication catalog");

    apply(ctx, &ctx.admin_descriptor(), &grants(ctx, APP_SCHEMAS), false)
        .await
        .context("error applying user grants as admin")?;
    apply(ctx, &ctx.internal_descriptor(), &grants(ctx, ALL_SCHEMAS), true)
        .await
        .context("error applying user grants as internal user")?;
    Ok(())
}

/// The grants of every configured user over the given schemas.
fn grants(ctx: &Context, schemas: &[&str]) -> Vec<String> {
    ctx.cluster
        .users
        .iter()
        .flat_map(|user| user_grants(&user.username, user.class, &ctx.cluster.database_name, schemas))
        .collect()
}

/// Apply the given statements over a fresh session, retrying the batch as a whole.
async fn apply(ctx: &Context, target: &ConnectionDescriptor, stmts: &[String], transactional: bool) -> Result<(), DbError> {
    retry(ctx.gateway.policy(), RetryOn::Transient, "error applying statements", move || async move {
        let session = ctx.gateway.connect(target).await?;
        let res = apply_on(&*session, stmts, transactional).await;
        session.close().await;
        res
    })
    .await
}

async fn apply_on(session: &dyn Session, stmts: &[String], transactional: bool) -> Result<(), DbError> {
    suppress_logging(session).await?;
    if transactional {
        return execute_in_transaction(session, stmts).await;
    }
    for stmt in stmts {
        session.execute(stmt).await?;
    }
    Ok(())
}
