use anyhow::{Context as _, Result};

use super::Context;
use crate::database::Session;
use crate::error::{DbError, ERR_SET_LOG_STATEMENT};
use crate::retry::{retry, RetryOn};
use crate::sql::{self, SUPERUSER_ROLE, SUPPRESS_LOGGING};

/// Provision roles and the target database, then remove the bootstrap credentials.
///
/// Roles and the database are created over the bootstrap connection with every statement
/// committed immediately, so that partial progress survives a failed run. Objects found to
/// already exist are not created again. Once everything is in place, the bootstrap database and
/// user are dropped over the internal connection, after which the node counts as initialized.
#[tracing::instrument(level = "debug", skip(ctx))]
pub async fn provision(ctx: &Context) -> Result<()> {
    retry(ctx.gateway.policy(), RetryOn::Transient, "error bootstrapping database users", move || create_roles(ctx))
        .await
        .context("error bootstrapping database users")?;
    tracing::info!("successfully bootstrapped database users");

    retry(ctx.gateway.policy(), RetryOn::Transient, "error dropping init database", move || drop_bootstrap(ctx))
        .await
        .context("error dropping init database")?;
    tracing::info!("successfully dropped init database");
    Ok(())
}

async fn create_roles(ctx: &Context) -> Result<(), DbError> {
    let session = ctx.gateway.connect(&ctx.bootstrap_descriptor()).await?;
    let res = create_roles_on(ctx, &*session).await;
    session.close().await;
    res
}

async fn create_roles_on(ctx: &Context, session: &dyn Session) -> Result<(), DbError> {
    suppress_logging(session).await?;

    if !role_exists(session, SUPERUSER_ROLE).await? {
        session.execute(&sql::create_superuser_role()).await?;
    }
    for stmt in sql::grant_superuser_role(ctx.version) {
        session.execute(&stmt).await?;
    }

    for user in ctx.cluster.users.iter() {
        let stmts = sql::create_user(&user.username, &user.password, user.class, user.superuser);
        if role_exists(session, user.username.as_str()).await? {
            tracing::debug!(user = %user.username, "user already exists");
        } else {
            session.execute(&stmts.create).await?;
        }
        for stmt in stmts.grants {
            session.execute(&stmt).await?;
        }
    }

    let (dbname, admin) = (&ctx.cluster.database_name, &ctx.cluster.admin.username);
    if database_exists(session, dbname.as_str()).await? {
        tracing::debug!(database = %dbname, "database already exists");
    } else {
        session.execute(&sql::create_database(dbname, admin)).await?;
    }
    for stmt in sql::grant_databases(dbname, admin, &ctx.init.dbname, &ctx.internal) {
        session.execute(&stmt).await?;
    }
    session
        .execute(&sql::promote_internal_user(&ctx.internal, &ctx.cluster.internal_password))
        .await
}

async fn drop_bootstrap(ctx: &Context) -> Result<(), DbError> {
    let session = ctx.gateway.connect(&ctx.internal_descriptor()).await?;
    let res = drop_bootstrap_on(ctx, &*session).await;
    session.close().await;
    res
}

async fn drop_bootstrap_on(ctx: &Context, session: &dyn Session) -> Result<(), DbError> {
    suppress_logging(session).await?;
    if database_exists(session, ctx.init.dbname.as_str()).await? {
        session.execute(&sql::drop_database(&ctx.init.dbname)).await?;
    }
    if role_exists(session, ctx.init.username.as_str()).await? {
        session.execute(&sql::drop_user(&ctx.init.username)).await?;
    }
    Ok(())
}

/// Keep the statements of this session, which carry credentials, out of the server log.
pub(super) async fn suppress_logging(session: &dyn Session) -> Result<(), DbError> {
    session.execute(SUPPRESS_LOGGING).await.map_err(|err| DbError {
        message: format!("{}: {}", ERR_SET_LOG_STATEMENT, err.message),
        ..err
    })
}

async fn role_exists(session: &dyn Session, name: &str) -> Result<bool, DbError> {
    Ok(session.query_count(&sql::count_roles(name)).await? > 0)
}

async fn database_exists(session: &dyn Session, name: &str) -> Result<bool, DbError> {
    Ok(session.query_count(&sql::count_databases(name)).await? > 0)
}
