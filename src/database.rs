//! Database connection management.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use tokio::sync::Mutex;

use crate::error::DbError;
use crate::retry::{retry, RetryOn, RetryPolicy};

/// The target of a database connection.
///
/// Descriptors are derived from the cluster spec and credentials, and are never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
    pub port: u16,
}

impl ConnectionDescriptor {
    /// Render this descriptor as a `key=value` connection string.
    pub fn dsn(&self) -> String {
        let mut fields = vec![
            format!("host={}", self.host),
            format!("dbname={}", self.dbname),
            format!("user={}", self.user),
            format!("port={}", self.port),
        ];
        if let Some(password) = self.password.as_deref().filter(|pw| !pw.is_empty()) {
            fields.push(format!("password={}", password));
        }
        fields.join(" ")
    }
}

// Passwords must never end up in the logs.
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.dbname)
    }
}

/// An open database session.
#[async_trait]
pub trait Session: Send + Sync {
    /// Execute the given statement, discarding any rows it returns.
    async fn execute(&self, stmt: &str) -> Result<(), DbError>;

    /// Execute the given query, returning the single integer it yields.
    async fn query_count(&self, query: &str) -> Result<i64, DbError>;

    async fn begin(&self) -> Result<(), DbError> {
        self.execute("BEGIN;").await
    }

    async fn commit(&self) -> Result<(), DbError> {
        self.execute("COMMIT;").await
    }

    async fn rollback(&self) -> Result<(), DbError> {
        self.execute("ROLLBACK;").await
    }

    /// Close this session, waiting for the server to acknowledge.
    async fn close(self: Box<Self>) {}
}

/// A driver able to open sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make a single connection attempt.
    async fn connect(&self, target: &ConnectionDescriptor) -> Result<Box<dyn Session>, DbError>;
}

/// Run the given statements in one transaction on the given session.
///
/// The transaction is rolled back when any statement fails, leaving the session usable.
pub async fn execute_in_transaction(session: &dyn Session, stmts: &[String]) -> Result<(), DbError> {
    session.begin().await?;
    for stmt in stmts {
        if let Err(err) = session.execute(stmt).await {
            if let Err(rollback_err) = session.rollback().await {
                tracing::debug!(error = %rollback_err, "error rolling back transaction");
            }
            return Err(err);
        }
    }
    session.commit().await
}

/// Gateway through which all bootstrap phases obtain connections.
#[derive(Clone)]
pub struct Gateway {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    probe_timeout: Duration,
}

impl Gateway {
    /// Create a new instance.
    pub fn new(connector: Arc<dyn Connector>, policy: RetryPolicy, probe_timeout: Duration) -> Self {
        Self { connector, policy, probe_timeout }
    }

    /// The retry policy used by this gateway, shared with the bootstrap phases.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open a session, retrying while the server is not yet accepting connections.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn connect(&self, target: &ConnectionDescriptor) -> Result<Box<dyn Session>, DbError> {
        self.connect_on(target, RetryOn::Transient).await
    }

    /// Open a session, retrying the errors selected by `on`.
    pub async fn connect_on(&self, target: &ConnectionDescriptor, on: RetryOn) -> Result<Box<dyn Session>, DbError> {
        let (connector, what) = (&self.connector, format!("unable to connect to database {:?}", target));
        retry(&self.policy, on, &what, move || connector.connect(target)).await
    }

    /// Make a single connection attempt, for callers which retry the connection along with the
    /// work done over it.
    pub async fn connect_once(&self, target: &ConnectionDescriptor) -> Result<Box<dyn Session>, DbError> {
        self.connector.connect(target).await
    }

    /// Make a single connection attempt bounded by the probe timeout, reporting success.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn probe(&self, target: &ConnectionDescriptor) -> bool {
        match tokio::time::timeout(self.probe_timeout, self.connector.connect(target)).await {
            Ok(Ok(session)) => {
                session.close().await;
                true
            }
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "probe failed");
                false
            }
            Err(_elapsed) => {
                tracing::debug!("probe timed out");
                false
            }
        }
    }
}

/// Connector backed by a PostgreSQL driver.
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, target: &ConnectionDescriptor) -> Result<Box<dyn Session>, DbError> {
        let mut opts = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&target.user)
            .database(&target.dbname);
        if let Some(password) = target.password.as_deref() {
            opts = opts.password(password);
        }
        // Statements carry credentials.
        let opts = opts.disable_statement_logging();
        let conn = PgConnection::connect_with(&opts).await?;
        Ok(Box::new(PgSession { conn: Mutex::new(conn) }))
    }
}

/// A session over a single PostgreSQL connection.
struct PgSession {
    conn: Mutex<PgConnection>,
}

#[async_trait]
impl Session for PgSession {
    async fn execute(&self, stmt: &str) -> Result<(), DbError> {
        let mut conn = self.conn.lock().await;
        sqlx::Executor::execute(&mut *conn, stmt).await?;
        Ok(())
    }

    async fn query_count(&self, query: &str) -> Result<i64, DbError> {
        let mut conn = self.conn.lock().await;
        let count: i64 = sqlx::query_scalar(query).fetch_one(&mut *conn).await?;
        Ok(count)
    }

    async fn close(self: Box<Self>) {
        if let Err(err) = self.conn.into_inner().close().await {
            tracing::debug!(error = %err, "error closing database connection");
        }
    }
}
