//! Shared types used across Sluice crates.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// How long a backend connection stays bound to one client session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// One backend connection for the whole client session.
    Session,
    /// Backend connection leased for one unit of work, then released.
    #[default]
    Transaction,
    /// Backend connection released after every completed request.
    Statement,
}

impl PoolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolMode::Session => "session",
            PoolMode::Transaction => "transaction",
            PoolMode::Statement => "statement",
        }
    }
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Ok(PoolMode::Session),
            "transaction" => Ok(PoolMode::Transaction),
            "statement" => Ok(PoolMode::Statement),
            other => Err(ConfigError::invalid(format!("unknown pool_mode: {other}"))),
        }
    }
}

/// A stored credential: `sha256:<64 hex chars>` of the user's password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretHash([u8; 32]);

impl SecretHash {
    const PREFIX: &'static str = "sha256:";

    /// Hash a plaintext password.
    pub fn from_password(password: &str) -> Self {
        Self(Sha256::digest(password.as_bytes()).into())
    }

    /// Check a plaintext password against this hash.
    pub fn verify(&self, password: &str) -> bool {
        let candidate: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        // Constant-time over the fixed-size digest.
        candidate
            .iter()
            .zip(self.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl FromStr for SecretHash {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| ConfigError::invalid("secret must start with \"sha256:\""))?;
        let bytes = hex::decode(hex_part)
            .map_err(|e| ConfigError::invalid(format!("secret is not valid hex: {e}")))?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConfigError::invalid("secret must be 64 hex characters"))?;
        Ok(Self(digest))
    }
}

impl TryFrom<String> for SecretHash {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SecretHash> for String {
    fn from(value: SecretHash) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

// Never print the digest in logs.
impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretHash(..)")
    }
}

/// Size bounds for one target pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PoolLimits {
    /// Connections kept open even when idle.
    pub min_size: usize,
    /// Connections the pool opens on demand.
    pub max_size: usize,
    /// Extra connections allowed for clients that waited past the reserve timeout.
    pub reserve_size: usize,
    /// Waiters allowed in the queue before new requests are rejected.
    pub queue_capacity: usize,
}

impl PoolLimits {
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self {
            min_size,
            max_size,
            reserve_size: 0,
            queue_capacity: usize::MAX,
        }
    }

    pub fn with_reserve(self, reserve_size: usize) -> Self {
        Self {
            reserve_size,
            ..self
        }
    }

    pub fn with_queue_capacity(self, queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            ..self
        }
    }

    /// Hard upper bound on open connections, reserve included.
    pub fn hard_max(&self) -> usize {
        self.max_size + self.reserve_size
    }
}

/// Backend connect retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectPolicy {
    /// Bound on a single connect attempt (TCP connect plus startup handshake).
    pub timeout: Duration,
    /// Extra attempts after the first failure.
    pub retries: u32,
    /// Delay before the first retry; doubled per retry.
    pub backoff: Duration,
    /// Upper bound on the retry delay.
    pub backoff_max: Duration,
}

impl ConnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(self.backoff_max)
    }
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            retries: 3,
            backoff: Duration::from_millis(250),
            backoff_max: Duration::from_secs(5),
        }
    }
}

/// A fully resolved pooling target: one backend identity plus one credential context.
#[derive(Clone, PartialEq, Eq)]
pub struct Target {
    /// Name clients use to select this target.
    pub alias: String,
    pub host: String,
    pub port: u16,
    /// Database name sent to the backend.
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub pool_mode: PoolMode,
    pub limits: PoolLimits,
}

impl Target {
    /// `host:port`, for connecting.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Key shared by every target pointing at the same backend database.
    pub fn database_key(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.dbname)
    }

    /// Whether two targets open interchangeable backend connections.
    pub fn same_identity(&self, other: &Target) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.dbname == other.dbname
            && self.user == other.user
            && self.password == other.password
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("alias", &self.alias)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("pool_mode", &self.pool_mode)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
