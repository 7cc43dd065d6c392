//! SQL statement construction.
//!
//! Most of the DDL/DCL issued during bootstrap cannot be parameterized by the server, so names
//! are interpolated into statement text. Every interpolated name passes through `Ident`, which
//! only admits plain unquoted identifiers, and every string value passes through `literal`.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::AppError;
use crate::spec::RoleClass;
use crate::version::{ServerVersion, SUPERUSER_PARAMETERS};

/// The aggregate role bundling restricted superuser capabilities.
pub const SUPERUSER_ROLE: &str = "pgedge_superuser";
/// The replication sets requested by every subscription.
pub const REPLICATION_SETS: &str = "{default, default_insert_only, ddl_sql}";
/// Extensions required on every node.
pub const EXTENSIONS: &[&str] = &["spock", "snowflake", "pg_stat_statements"];
/// Statement used to keep credentials out of the server log.
pub const SUPPRESS_LOGGING: &str = "SET log_statement = 'none';";
/// Query used to check whether a node has registered itself in the replication catalog.
pub const COUNT_SPOCK_NODES: &str = "SELECT COUNT(*) FROM spock.node;";

lazy_static! {
    static ref IDENT_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("failed to compile IDENT_RE regex");
}

/// A validated SQL identifier (role, database or schema name).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ident(String);

impl Ident {
    /// Validate the given name as an identifier.
    ///
    /// The name is folded to lower case, which is how the server stores unquoted identifiers, so
    /// that catalog lookups and connection targets match the objects the statements create.
    pub fn new(name: impl AsRef<str>) -> Result<Self, AppError> {
        let name = name.as_ref();
        if IDENT_RE.is_match(name) {
            Ok(Self(name.to_ascii_lowercase()))
        } else {
            Err(AppError::InvalidIdentifier(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Render the given value as a single-quoted SQL string literal.
pub fn literal(val: &str) -> String {
    format!("'{}'", val.replace('\'', "''"))
}

/// Derive the subscription name for the ordered pair `(local, peer)`.
///
/// Any character which is not ASCII alphanumeric is normalized to an underscore.
pub fn subscription_name(local: &str, peer: &str) -> String {
    format!("sub_{}{}", local, peer)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Statement creating the restricted superuser role.
pub fn create_superuser_role() -> String {
    format!("CREATE ROLE {} WITH NOLOGIN;", SUPERUSER_ROLE)
}

/// Statements granting the restricted superuser role its capabilities on the given version.
pub fn grant_superuser_role(version: ServerVersion) -> Vec<String> {
    vec![
        format!("GRANT {} TO {} WITH ADMIN true;", version.superuser_roles().join(", "), SUPERUSER_ROLE),
        format!("GRANT SET ON PARAMETER {} TO {};", SUPERUSER_PARAMETERS.join(", "), SUPERUSER_ROLE),
    ]
}

/// The statements provisioning one login user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserStatements {
    /// Creates the user. Skipped when the user already exists.
    pub create: String,
    /// Grants applied after creation. These are safe to repeat.
    pub grants: Vec<String>,
}

/// Statements creating a login user, shaped by its role class.
pub fn create_user(username: &Ident, password: &str, class: RoleClass, superuser: bool) -> UserStatements {
    let password = literal(password);
    if superuser {
        return UserStatements {
            create: format!("CREATE USER {} WITH LOGIN SUPERUSER PASSWORD {};", username, password),
            grants: vec![],
        };
    }
    match class {
        RoleClass::Admin | RoleClass::InternalAdmin => UserStatements {
            create: format!("CREATE USER {} WITH LOGIN CREATEROLE CREATEDB PASSWORD {};", username, password),
            grants: vec![format!("GRANT {} TO {} WITH ADMIN TRUE;", SUPERUSER_ROLE, username)],
        },
        _ => UserStatements {
            create: format!("CREATE USER {} WITH LOGIN PASSWORD {};", username, password),
            grants: vec![],
        },
    }
}

/// Statement creating the target database.
pub fn create_database(dbname: &Ident, owner: &Ident) -> String {
    format!("CREATE DATABASE {} OWNER {};", dbname, owner)
}

/// Statements granting the target and bootstrap databases to their principals.
pub fn grant_databases(dbname: &Ident, admin: &Ident, init_dbname: &Ident, internal: &Ident) -> Vec<String> {
    vec![
        format!("GRANT ALL PRIVILEGES ON DATABASE {} TO {};", dbname, admin),
        format!("GRANT ALL PRIVILEGES ON DATABASE {} TO {};", init_dbname, admin),
        format!("GRANT ALL PRIVILEGES ON DATABASE {} TO {};", dbname, internal),
    ]
}

/// Statement promoting the internal replication identity.
pub fn promote_internal_user(internal: &Ident, password: &str) -> String {
    format!("ALTER USER {} WITH PASSWORD {} LOGIN SUPERUSER REPLICATION;", internal, literal(password))
}

pub fn drop_database(name: &Ident) -> String {
    format!("DROP DATABASE {};", name)
}

pub fn drop_user(name: &Ident) -> String {
    format!("DROP USER {};", name)
}

/// Query counting roles of the given name.
pub fn count_roles(name: &str) -> String {
    format!("SELECT COUNT(*) FROM pg_roles WHERE rolname = {};", literal(name))
}

/// Query counting databases of the given name.
pub fn count_databases(name: &str) -> String {
    format!("SELECT COUNT(*) FROM pg_database WHERE datname = {};", literal(name))
}

/// Query counting subscriptions of the given name.
pub fn count_subscriptions(name: &str) -> String {
    format!("SELECT COUNT(*) FROM spock.subscription WHERE sub_name = {};", literal(name))
}

/// Statements installing the required extensions.
pub fn create_extensions() -> Vec<String> {
    EXTENSIONS.iter().map(|ext| format!("CREATE EXTENSION IF NOT EXISTS {};", ext)).collect()
}

/// Statement allowing a pooler identity to read password hashes for pass-through auth.
pub fn grant_shadow_read(username: &Ident) -> String {
    format!("GRANT SELECT ON pg_shadow TO {};", username)
}

/// Statement registering the local node in the replication catalog.
///
/// When `guarded`, the statement is a no-op if a node of the same name is already registered.
pub fn node_create(node_name: &str, dsn: &str, guarded: bool) -> String {
    let (name, dsn) = (literal(node_name), literal(dsn));
    if guarded {
        format!(
            "SELECT spock.node_create(node_name := {}, dsn := {}) WHERE {} NOT IN (SELECT node_name FROM spock.node);",
            name, dsn, name
        )
    } else {
        format!("SELECT spock.node_create(node_name := {}, dsn := {});", name, dsn)
    }
}

/// Statement creating a subscription to the given provider.
pub fn sub_create(sub_name: &str, provider_dsn: &str) -> String {
    format!(
        "SELECT spock.sub_create(subscription_name := {}, provider_dsn := {}, replication_sets := {}, forward_origins := '{{}}', synchronize_structure := 'false', synchronize_data := 'false', apply_delay := '0');",
        literal(sub_name),
        literal(provider_dsn),
        literal(REPLICATION_SETS),
    )
}

/// Statement dropping a subscription, tolerating its absence.
pub fn sub_drop(sub_name: &str) -> String {
    format!("SELECT spock.sub_drop(subscription_name := {}, ifexists := 'true');", literal(sub_name))
}
