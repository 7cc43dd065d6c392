//! Bootstrap error abstractions.

use thiserror::Error;

// Error messages.
pub const ERR_SPEC_NOT_FOUND: &str = "spec not found, skipping initialization";
pub const ERR_SET_LOG_STATEMENT: &str = "error suppressing statement logging";

/// Configuration defects which make bootstrapping impossible.
///
/// These are reported once and the process exits non-zero. They are never retried.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("database name not found in spec")]
    MissingDatabaseName,
    #[error("nodes not found in spec")]
    MissingNodes,
    #[error("users not found in spec")]
    MissingUsers,
    #[error("node {0} not found in spec")]
    UnknownSelfNode(String),
    #[error("duplicate node name {0} in spec")]
    DuplicateNode(String),
    #[error("node {0} has neither a hostname nor an internal_hostname")]
    MissingHostname(String),
    #[error("user {0} has no password in spec")]
    MissingPassword(String),
    #[error("admin user configuration not found in spec")]
    MissingAdminCredentials,
    #[error("pgedge user configuration not found in spec")]
    MissingReplicationPassword,
    #[error("unrecognized postgres version: '{0}'")]
    UnrecognizedServerVersion(String),
    #[error("required env var {0} not found")]
    MissingEnv(&'static str),
    #[error("invalid identifier {0:?}, expected letters, digits and underscores only")]
    InvalidIdentifier(String),
}

/// The category of an operational database error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation may succeed if retried later, e.g. the server is still starting.
    Transient,
    /// The operation will never succeed without operator intervention.
    Permanent,
}

/// An operational error returned from a database connection or statement.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DbError {
    pub kind: ErrorKind,
    /// The SQLSTATE code reported by the server, if any.
    pub code: Option<String>,
    pub message: String,
}

impl DbError {
    /// Construct a transient error from the given message.
    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Transient, code: None, message: message.into() }
    }

    /// Construct a permanent error from the given message.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Permanent, code: None, message: message.into() }
    }

    /// Construct an error from a server-reported SQLSTATE code, classifying it accordingly.
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: classify_sqlstate(code),
            code: Some(code.to_string()),
            message: message.into(),
        }
    }

    /// Check if this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Classify a SQLSTATE code.
///
/// Objects which another bootstrap phase (possibly on another node) will eventually create are
/// transient: a missing database, schema, table or function. Authentication, privilege and syntax
/// failures are permanent.
pub fn classify_sqlstate(code: &str) -> ErrorKind {
    match code {
        // invalid_password, insufficient_privilege, syntax_error, feature_not_supported.
        "28P01" | "42501" | "42601" | "0A000" => ErrorKind::Permanent,
        // Integrity violations, e.g. registering a node name twice.
        _ if code.starts_with("23") => ErrorKind::Permanent,
        // invalid_catalog_name, invalid_schema_name, undefined_table, undefined_function.
        "3D000" | "3F000" | "42P01" | "42883" => ErrorKind::Transient,
        // Connection exceptions, operator intervention (cannot_connect_now) & resource exhaustion.
        _ if code.starts_with("08") || code.starts_with("57") || code.starts_with("53") => ErrorKind::Transient,
        // invalid_authorization_specification covers "role is not permitted to log in", which is
        // the state of the pre-baked internal identity until it is promoted.
        _ if code.starts_with("28") => ErrorKind::Transient,
        _ if code.starts_with("42") => ErrorKind::Permanent,
        _ => ErrorKind::Transient,
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => Self::from_sqlstate(&code, err.to_string()),
                None => Self::transient(err.to_string()),
            },
            sqlx::Error::Configuration(_) | sqlx::Error::Tls(_) => Self::permanent(err.to_string()),
            _ => Self::transient(err.to_string()),
        }
    }
}
