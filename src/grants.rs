//! Per-user permission statements.

use crate::sql::Ident;
use crate::spec::RoleClass;

/// Schemas granted over the internal connection.
pub const ALL_SCHEMAS: &[&str] = &["public", "spock", "pg_catalog", "information_schema"];
/// Schemas granted over the admin connection.
pub const APP_SCHEMAS: &[&str] = &["public"];

/// Build the grant statements appropriate to the given user's role class.
///
/// Read-only classes receive `USAGE` + `SELECT` along with default privileges for future tables.
/// All other classes receive full privileges on existing and future tables and sequences.
pub fn user_grants(username: &Ident, class: RoleClass, dbname: &Ident, schemas: &[&str]) -> Vec<String> {
    let mut stmts = vec![format!("GRANT CONNECT ON DATABASE {} TO {};", dbname, username)];
    if class.is_read_only() {
        for schema in schemas {
            stmts.push(format!("GRANT USAGE ON SCHEMA {} TO {};", schema, username));
            stmts.push(format!("GRANT SELECT ON ALL TABLES IN SCHEMA {} TO {};", schema, username));
            stmts.push(format!("ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT SELECT ON TABLES TO {};", schema, username));
        }
        if class == RoleClass::InternalReadOnly {
            stmts.push(format!("GRANT EXECUTE ON FUNCTION pg_ls_waldir TO {};", username));
            stmts.push(format!("GRANT pg_read_all_stats TO {};", username));
        }
        return stmts;
    }
    for schema in schemas {
        stmts.push(format!("GRANT USAGE, CREATE ON SCHEMA {} TO {};", schema, username));
        stmts.push(format!("GRANT ALL PRIVILEGES ON ALL TABLES IN SCHEMA {} TO {};", schema, username));
        stmts.push(format!("GRANT ALL PRIVILEGES ON ALL SEQUENCES IN SCHEMA {} TO {};", schema, username));
        stmts.push(format!("ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT ALL PRIVILEGES ON TABLES TO {};", schema, username));
        stmts.push(format!("ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT ALL PRIVILEGES ON SEQUENCES TO {};", schema, username));
    }
    stmts
}
