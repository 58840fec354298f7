use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::db::pool::PoolOptions;
use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "broker.json";

/// Broker configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub listen_address: SocketAddr,
    /// Base URL of the manager API.
    pub manager_address: String,
    pub manager_privilege_secret: String,

    /// Max open connections per database pool.
    pub db_connections: usize,
    pub db_max_idle: usize,
    pub db_idle_timeout_seconds: u64,

    pub broker_db_path: PathBuf,
    /// Scope stores live at `<root>/server-<db_server_id>/<db_name>.sqlite`.
    pub scope_db_root: PathBuf,

    pub tls: Option<TlsConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// env-filter directive, e.g. `info,scanbroker_daemon=debug`.
    pub level: String,
    pub json: bool,
}

impl LoggingConfig {
    /// Filter directive in effect: the `--log` flag, then `RUST_LOG`, then
    /// the configured level.
    pub fn directive(&self, flag: Option<&str>, env: Option<&str>) -> String {
        flag.or(env)
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.level)
            .to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 2222)),
            manager_address: "http://127.0.0.1:3333".to_string(),
            manager_privilege_secret: String::new(),
            db_connections: 30,
            db_max_idle: 5,
            db_idle_timeout_seconds: 300,
            broker_db_path: PathBuf::from("broker.sqlite"),
            scope_db_root: PathBuf::from("scopedb"),
            tls: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Reads the file at `path`, applies environment overrides and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg = Self::from_json(&raw)?;
        cfg.apply_overrides(|k| std::env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Applies `SCANBROKER_*` overrides looked up through `var`.
    pub fn apply_overrides<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = var("SCANBROKER_LISTEN") {
            self.listen_address = listen
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("SCANBROKER_LISTEN: {e}")))?;
        }
        if let Some(manager) = var("SCANBROKER_MANAGER") {
            self.manager_address = manager;
        }
        if let Some(secret) = var("SCANBROKER_PRIVILEGE_SECRET") {
            self.manager_privilege_secret = secret;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.manager_privilege_secret.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "manager_privilege_secret must be set".into(),
            ));
        }
        if self.manager_address.trim().is_empty() {
            return Err(ConfigError::Invalid("manager_address must be set".into()));
        }
        if self.db_connections == 0 {
            return Err(ConfigError::Invalid("db_connections must be positive".into()));
        }
        Ok(())
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_open: self.db_connections,
            min_idle: self.db_max_idle.min(self.db_connections),
            idle_timeout: Duration::from_secs(self.db_idle_timeout_seconds),
            ..PoolOptions::default()
        }
    }
}

/// Intervals and thresholds of the dispatcher and background loops.
#[derive(Debug, Clone)]
pub struct BrokerTimings {
    pub stats_interval: Duration,
    pub gc_interval: Duration,
    /// GC and cycle checks are suppressed this long after startup.
    pub startup_grace: Duration,
    /// Unstarted submodule tasks above which discovery is not fed.
    pub backlog_limit: i64,
    pub banner_timeout_minutes: u32,
    pub gc_slack_minutes: u32,
    pub discovery_slack_minutes: u32,
    /// Retry delay of the resolver while the manager is unreachable.
    pub resolve_retry: Duration,
}

impl Default for BrokerTimings {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(6),
            gc_interval: Duration::from_secs(5 * 60),
            startup_grace: Duration::from_secs(20 * 60),
            backlog_limit: 10_000,
            banner_timeout_minutes: 20,
            gc_slack_minutes: 10,
            discovery_slack_minutes: 30,
            resolve_retry: Duration::from_secs(1),
        }
    }
}
