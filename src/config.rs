//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::AppError;
use crate::retry::RetryPolicy;
use crate::version::ServerVersion;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The logging config, which uses `tracing_subscriber::EnvFilter` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// The PostgreSQL major version of the local server.
    pub pgv: Option<String>,
    /// The name of this node, used when the spec has no explicit `self` entry.
    #[serde(default = "Config::default_node_name")]
    pub node_name: String,
    /// The path to the cluster spec, used when none is given on the command line.
    pub spec_path: Option<String>,

    /// The transient bootstrap database baked into the image.
    pub init_database: Option<String>,
    /// The transient bootstrap user baked into the image.
    pub init_username: Option<String>,
    /// The transient bootstrap user's password, also the fallback password of the internal user.
    pub init_password: Option<String>,

    /// Seconds to wait for the local server before the first reachability probe.
    #[serde(default = "Config::default_startup_delay_seconds")]
    pub startup_delay_seconds: u64,
    /// Timeout in seconds of a single reachability probe.
    #[serde(default = "Config::default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
    /// Seconds to wait before subscribing to peers, letting them reach their own registration.
    #[serde(default = "Config::default_peer_delay_seconds")]
    pub peer_delay_seconds: u64,

    /// The first delay between retries of a failed operation.
    #[serde(default = "Config::default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    /// The upper bound of the delay between retries.
    #[serde(default = "Config::default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// The maximum number of retries of a failed operation, `0` meaning unbounded.
    #[serde(default)]
    pub retry_max_attempts: usize,

    /// Drop existing subscriptions to peers before creating them.
    #[serde(default)]
    pub resubscribe: bool,
    /// Guard node registration so that it is a no-op when the node is already registered.
    #[serde(default = "Config::default_true")]
    pub node_create_guard: bool,
    /// Classify errors while waiting on peers instead of treating all of them as transient.
    #[serde(default)]
    pub peer_poll_strict: bool,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    /// Create a config for tests, overriding defaults with the given env pairs.
    ///
    /// An override with an empty value removes the variable.
    #[cfg(test)]
    pub fn new_test(overrides: &[(&str, &str)]) -> Result<Self> {
        let mut env: Vec<(String, String)> = vec![
            ("PGV".into(), "16".into()),
            ("INIT_DATABASE".into(), crate::fixtures::INIT_DATABASE.into()),
            ("INIT_USERNAME".into(), crate::fixtures::INIT_USERNAME.into()),
            ("INIT_PASSWORD".into(), crate::fixtures::INIT_PASSWORD.into()),
            ("STARTUP_DELAY_SECONDS".into(), "1".into()),
            ("PROBE_TIMEOUT_SECONDS".into(), "1".into()),
            ("PEER_DELAY_SECONDS".into(), "1".into()),
            ("RETRY_INITIAL_DELAY_MS".into(), "100".into()),
            ("RETRY_MAX_DELAY_MS".into(), "1000".into()),
        ];
        for (key, val) in overrides {
            env.retain(|(existing, _)| existing != key);
            if !val.is_empty() {
                env.push((key.to_string(), val.to_string()));
            }
        }
        envy::from_iter(env).context("error building test config")
    }

    /// The major version of the local server.
    pub fn server_version(&self) -> Result<ServerVersion, AppError> {
        self.pgv.as_deref().unwrap_or_default().parse()
    }

    /// The retry policy applied to database operations.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_initial_delay_ms)),
            max_attempts: if self.retry_max_attempts == 0 { None } else { Some(self.retry_max_attempts) },
        }
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn peer_delay(&self) -> Duration {
        Duration::from_secs(self.peer_delay_seconds)
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_node_name() -> String {
        "n1".into()
    }

    fn default_startup_delay_seconds() -> u64 {
        3
    }

    fn default_probe_timeout_seconds() -> u64 {
        5
    }

    fn default_peer_delay_seconds() -> u64 {
        5
    }

    fn default_retry_initial_delay_ms() -> u64 {
        2_000
    }

    fn default_retry_max_delay_ms() -> u64 {
        30_000
    }

    fn default_true() -> bool {
        true
    }
}
