//! Server version dependent privilege tables.

use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Runtime parameters which members of the restricted superuser role may set.
pub const SUPERUSER_PARAMETERS: &[&str] = &[
    "commit_delay",
    "deadlock_timeout",
    "lc_messages",
    "log_duration",
    "log_error_verbosity",
    "log_executor_stats",
    "log_lock_waits",
    "log_min_duration_sample",
    "log_min_duration_statement",
    "log_min_error_statement",
    "log_min_messages",
    "log_parser_stats",
    "log_planner_stats",
    "log_replication_commands",
    "log_statement",
    "log_statement_sample_rate",
    "log_statement_stats",
    "log_temp_files",
    "log_transaction_sample_rate",
    "pg_stat_statements.track",
    "pg_stat_statements.track_planning",
    "pg_stat_statements.track_utility",
    "session_replication_role",
    "temp_file_limit",
    "track_activities",
    "track_counts",
    "track_functions",
    "track_io_timing",
];

const PG15_ROLES: &[&str] = &[
    "pg_read_all_data",
    "pg_write_all_data",
    "pg_read_all_settings",
    "pg_read_all_stats",
    "pg_stat_scan_tables",
    "pg_monitor",
    "pg_signal_backend",
    "pg_checkpoint",
];

const PG16_ROLES: &[&str] = &[
    "pg_read_all_data",
    "pg_write_all_data",
    "pg_read_all_settings",
    "pg_read_all_stats",
    "pg_stat_scan_tables",
    "pg_monitor",
    "pg_signal_backend",
    "pg_checkpoint",
    "pg_use_reserved_connections",
    "pg_create_subscription",
];

/// A supported PostgreSQL major version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerVersion {
    V15,
    V16,
}

impl ServerVersion {
    /// The built-in roles bundled into the restricted superuser role on this version.
    pub fn superuser_roles(&self) -> &'static [&'static str] {
        match self {
            Self::V15 => PG15_ROLES,
            Self::V16 => PG16_ROLES,
        }
    }
}

impl FromStr for ServerVersion {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "15" => Ok(Self::V15),
            "16" => Ok(Self::V16),
            other => Err(AppError::UnrecognizedServerVersion(other.to_string())),
        }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V15 => f.write_str("15"),
            Self::V16 => f.write_str("16"),
        }
    }
}
