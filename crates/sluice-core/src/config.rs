//! sluice.toml configuration parser and validator.
//!
//! A [`Config`] is parsed and validated as a whole. Once built it is never
//! mutated; a reload produces a fresh `Config` and the caller swaps it in.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::{ConnectPolicy, PoolLimits, PoolMode, SecretHash, Target};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "sluice", default)]
    pub settings: Settings,
    /// Client credentials: user name → `sha256:` secret hash.
    #[serde(default)]
    pub users: BTreeMap<String, SecretHash>,
    /// Pooling targets keyed by the alias clients connect to.
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseConfig>,
}

/// Process-wide settings from the `[sluice]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    /// HTTP address for `/metrics`; disabled when absent.
    pub metrics_addr: Option<SocketAddr>,
    /// Pseudo-database name that routes a session to the admin console.
    pub admin_database: String,
    pub admin_users: Vec<String>,
    pub pool_mode: PoolMode,
    pub max_client_conn: usize,
    pub default_pool_size: usize,
    pub min_pool_size: usize,
    pub reserve_pool_size: usize,
    #[serde(with = "seconds")]
    pub reserve_pool_timeout: Duration,
    /// Cap across every pool pointing at the same backend database (0 = none).
    pub max_db_connections: usize,
    /// Cap across every pool using the same backend user (0 = none).
    pub max_user_connections: usize,
    /// Per-pool wait queue capacity; `max_client_conn` when unset.
    pub max_waiting_clients: Option<usize>,
    #[serde(with = "seconds")]
    pub connect_timeout: Duration,
    #[serde(with = "seconds")]
    pub idle_timeout: Duration,
    /// Zero disables the limit.
    #[serde(with = "seconds")]
    pub query_timeout: Duration,
    #[serde(with = "seconds")]
    pub query_wait_timeout: Duration,
    #[serde(with = "seconds")]
    pub client_login_timeout: Duration,
    #[serde(with = "seconds")]
    pub server_lifetime: Duration,
    #[serde(with = "seconds")]
    pub sweep_interval: Duration,
    /// How often aggregate pool statistics are written to the log.
    #[serde(with = "seconds")]
    pub stats_period: Duration,
    pub connect_retries: u32,
    #[serde(with = "seconds")]
    pub connect_backoff: Duration,
    #[serde(with = "seconds")]
    pub connect_backoff_max: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 6432)),
            metrics_addr: None,
            admin_database: "sluice".to_string(),
            admin_users: Vec::new(),
            pool_mode: PoolMode::Transaction,
            max_client_conn: 100,
            default_pool_size: 20,
            min_pool_size: 0,
            reserve_pool_size: 0,
            reserve_pool_timeout: Duration::from_secs(5),
            max_db_connections: 0,
            max_user_connections: 0,
            max_waiting_clients: None,
            connect_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(600),
            query_timeout: Duration::ZERO,
            query_wait_timeout: Duration::from_secs(120),
            client_login_timeout: Duration::from_secs(60),
            server_lifetime: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(1),
            stats_period: Duration::from_secs(60),
            connect_retries: 3,
            connect_backoff: Duration::from_millis(250),
            connect_backoff_max: Duration::from_secs(5),
        }
    }
}

/// One `[databases.<alias>]` table.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Backend database name; the alias when unset.
    pub dbname: Option<String>,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub pool_size: Option<usize>,
    pub min_pool_size: Option<usize>,
    pub reserve_pool_size: Option<usize>,
    pub pool_mode: Option<PoolMode>,
}

fn default_port() -> u16 {
    5432
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("pool_size", &self.pool_size)
            .field("min_pool_size", &self.min_pool_size)
            .field("reserve_pool_size", &self.reserve_pool_size)
            .field("pool_mode", &self.pool_mode)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a configuration held in memory.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every bound and cross-reference. Nothing is accepted partially.
    pub fn validate(&self) -> ConfigResult<()> {
        let s = &self.settings;

        if s.max_client_conn == 0 {
            return Err(ConfigError::invalid("max_client_conn must be greater than 0"));
        }
        if s.default_pool_size == 0 {
            return Err(ConfigError::invalid("default_pool_size must be greater than 0"));
        }
        if s.min_pool_size > s.default_pool_size {
            return Err(ConfigError::invalid(format!(
                "min_pool_size ({}) exceeds default_pool_size ({})",
                s.min_pool_size, s.default_pool_size
            )));
        }
        if s.max_db_connections > 0 && s.default_pool_size > s.max_db_connections {
            return Err(ConfigError::invalid(format!(
                "default_pool_size ({}) exceeds max_db_connections ({})",
                s.default_pool_size, s.max_db_connections
            )));
        }
        if s.admin_database.is_empty() {
            return Err(ConfigError::invalid("admin_database must not be empty"));
        }
        if s.sweep_interval.is_zero() {
            return Err(ConfigError::invalid("sweep_interval must be greater than 0"));
        }
        if s.stats_period.is_zero() {
            return Err(ConfigError::invalid("stats_period must be greater than 0"));
        }
        if s.connect_timeout.is_zero() {
            return Err(ConfigError::invalid("connect_timeout must be greater than 0"));
        }
        if s.connect_backoff > s.connect_backoff_max {
            return Err(ConfigError::invalid(
                "connect_backoff must not exceed connect_backoff_max",
            ));
        }
        if self.databases.is_empty() {
            return Err(ConfigError::invalid("at least one [databases.<name>] entry is required"));
        }
        if self.databases.contains_key(&s.admin_database) {
            return Err(ConfigError::invalid(format!(
                "database alias {:?} collides with admin_database",
                s.admin_database
            )));
        }
        for admin in &s.admin_users {
            if !self.users.contains_key(admin) {
                return Err(ConfigError::invalid(format!(
                    "admin user {admin:?} has no entry in [users]"
                )));
            }
        }

        for (alias, db) in &self.databases {
            if db.host.is_empty() {
                return Err(ConfigError::invalid(format!("database {alias:?}: host is empty")));
            }
            if db.port == 0 {
                return Err(ConfigError::invalid(format!("database {alias:?}: port is 0")));
            }
            if db.user.is_empty() {
                return Err(ConfigError::invalid(format!("database {alias:?}: user is empty")));
            }
            let size = db.pool_size.unwrap_or(s.default_pool_size);
            let min = db.min_pool_size.unwrap_or(s.min_pool_size);
            if size == 0 {
                return Err(ConfigError::invalid(format!(
                    "database {alias:?}: pool_size must be greater than 0"
                )));
            }
            if min > size {
                return Err(ConfigError::invalid(format!(
                    "database {alias:?}: min_pool_size ({min}) exceeds pool_size ({size})"
                )));
            }
            if s.max_db_connections > 0 && size > s.max_db_connections {
                return Err(ConfigError::invalid(format!(
                    "database {alias:?}: pool_size ({size}) exceeds max_db_connections ({})",
                    s.max_db_connections
                )));
            }
        }

        Ok(())
    }

    /// Wait queue capacity applied to every pool.
    pub fn queue_capacity(&self) -> usize {
        self.settings
            .max_waiting_clients
            .unwrap_or(self.settings.max_client_conn)
    }

    pub fn connect_policy(&self) -> ConnectPolicy {
        ConnectPolicy {
            timeout: self.settings.connect_timeout,
            retries: self.settings.connect_retries,
            backoff: self.settings.connect_backoff,
            backoff_max: self.settings.connect_backoff_max,
        }
    }

    /// Resolve one alias into a pooling target.
    pub fn target(&self, alias: &str) -> Option<Target> {
        let db = self.databases.get(alias)?;
        let s = &self.settings;
        let limits = PoolLimits::new(
            db.min_pool_size.unwrap_or(s.min_pool_size),
            db.pool_size.unwrap_or(s.default_pool_size),
        )
        .with_reserve(db.reserve_pool_size.unwrap_or(s.reserve_pool_size))
        .with_queue_capacity(self.queue_capacity());

        Some(Target {
            alias: alias.to_string(),
            host: db.host.clone(),
            port: db.port,
            dbname: db.dbname.clone().unwrap_or_else(|| alias.to_string()),
            user: db.user.clone(),
            password: db.password.clone(),
            pool_mode: db.pool_mode.unwrap_or(s.pool_mode),
            limits,
        })
    }

    /// Every configured target, ordered by alias.
    pub fn targets(&self) -> Vec<Target> {
        self.databases
            .keys()
            .filter_map(|alias| self.target(alias))
            .collect()
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.settings.admin_users.iter().any(|u| u == user)
    }

    /// Key/value listing of the active settings, for `SHOW CONFIG`.
    pub fn settings_rows(&self) -> Vec<(String, String)> {
        let s = &self.settings;
        let secs = |d: Duration| format!("{}", d.as_secs_f64());
        vec![
            ("listen_addr".into(), s.listen_addr.to_string()),
            (
                "metrics_addr".into(),
                s.metrics_addr.map(|a| a.to_string()).unwrap_or_default(),
            ),
            ("admin_database".into(), s.admin_database.clone()),
            ("admin_users".into(), s.admin_users.join(",")),
            ("pool_mode".into(), s.pool_mode.to_string()),
            ("max_client_conn".into(), s.max_client_conn.to_string()),
            ("default_pool_size".into(), s.default_pool_size.to_string()),
            ("min_pool_size".into(), s.min_pool_size.to_string()),
            ("reserve_pool_size".into(), s.reserve_pool_size.to_string()),
            ("reserve_pool_timeout".into(), secs(s.reserve_pool_timeout)),
            ("max_db_connections".into(), s.max_db_connections.to_string()),
            ("max_user_connections".into(), s.max_user_connections.to_string()),
            ("max_waiting_clients".into(), self.queue_capacity().to_string()),
            ("connect_timeout".into(), secs(s.connect_timeout)),
            ("idle_timeout".into(), secs(s.idle_timeout)),
            ("query_timeout".into(), secs(s.query_timeout)),
            ("query_wait_timeout".into(), secs(s.query_wait_timeout)),
            ("client_login_timeout".into(), secs(s.client_login_timeout)),
            ("server_lifetime".into(), secs(s.server_lifetime)),
            ("sweep_interval".into(), secs(s.sweep_interval)),
            ("stats_period".into(), secs(s.stats_period)),
            ("connect_retries".into(), s.connect_retries.to_string()),
            ("connect_backoff".into(), secs(s.connect_backoff)),
            ("connect_backoff_max".into(), secs(s.connect_backoff_max)),
        ]
    }
}

/// Durations are written as (possibly fractional) seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration {secs}: {e}")))
    }
}
