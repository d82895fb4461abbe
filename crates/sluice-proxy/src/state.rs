//! Shared proxy state: active configuration, credentials, pools and the
//! table of connected clients.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::time::Instant;
use tracing::{info, warn};

use sluice_core::{Config, ConfigError};
use sluice_pool::{ApplyReport, PoolRegistry};

use crate::auth::CredentialStore;
use crate::error::ProxyResult;

/// What a client session is doing right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// Authenticated, no backend bound.
    Idle,
    /// Queued for a backend connection.
    Waiting,
    /// Bound to a backend connection.
    Active,
    /// Connected to the admin console.
    Admin,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Idle => "idle",
            ClientState::Waiting => "waiting",
            ClientState::Active => "active",
            ClientState::Admin => "admin",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `SHOW CLIENTS`.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub id: u64,
    pub user: String,
    pub database: String,
    pub addr: SocketAddr,
    pub state: ClientState,
    pub connected_at: Instant,
}

/// Everything sessions and the admin console share.
pub struct ProxyState {
    config: RwLock<Arc<Config>>,
    config_path: Option<PathBuf>,
    credentials: RwLock<Arc<CredentialStore>>,
    registry: Arc<PoolRegistry>,
    clients: Mutex<BTreeMap<u64, ClientInfo>>,
    next_session_id: AtomicU64,
}

impl ProxyState {
    /// State over an already populated registry.
    ///
    /// `config_path` is what `RELOAD` re-reads; without it reload fails.
    pub fn new(config: Config, config_path: Option<PathBuf>, registry: Arc<PoolRegistry>) -> Self {
        let credentials = CredentialStore::from_config(&config);
        Self {
            config: RwLock::new(Arc::new(config)),
            config_path,
            credentials: RwLock::new(Arc::new(credentials)),
            registry,
            clients: Mutex::new(BTreeMap::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> Arc<Config> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn credentials(&self) -> Arc<CredentialStore> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config_path.as_ref()
    }

    /// Re-read the configuration file and apply it.
    ///
    /// The file is read on the blocking pool. An invalid file leaves the
    /// running configuration untouched.
    pub async fn reload(&self) -> ProxyResult<ApplyReport> {
        let path = self
            .config_path
            .clone()
            .ok_or_else(|| ConfigError::Invalid("no configuration file to reload".into()))?;
        let loaded = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || Config::load(&path))
                .await
                .map_err(|e| ConfigError::Invalid(format!("configuration read failed: {e}")))?
        };
        let config = match loaded {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "reload rejected, keeping current configuration");
                return Err(e.into());
            }
        };
        Ok(self.install(config))
    }

    /// Swap in an already validated configuration.
    pub fn install(&self, config: Config) -> ApplyReport {
        let report = self.registry.apply(&config);
        let credentials = CredentialStore::from_config(&config);
        *self.credentials.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(credentials);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        info!(
            added = report.added.len(),
            removed = report.removed.len(),
            replaced = report.replaced.len(),
            updated = report.updated.len(),
            "configuration reloaded"
        );
        report
    }

    // ── Client table ───────────────────────────────────────────────

    /// Record a logged-in client. The entry goes away with the returned handle.
    pub fn register_client(
        self: &Arc<Self>,
        user: &str,
        database: &str,
        addr: SocketAddr,
        state: ClientState,
    ) -> ClientHandle {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let info = ClientInfo {
            id,
            user: user.to_string(),
            database: database.to_string(),
            addr,
            state,
            connected_at: Instant::now(),
        };
        self.lock_clients().insert(id, info);
        ClientHandle {
            id,
            state: Arc::clone(self),
        }
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.lock_clients().values().cloned().collect()
    }

    /// Clients of `database` currently in `state`.
    pub fn count_clients(&self, database: &str, state: ClientState) -> usize {
        self.lock_clients()
            .values()
            .filter(|c| c.database == database && c.state == state)
            .count()
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, ClientInfo>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyState")
            .field("config_path", &self.config_path)
            .field("registry", &self.registry)
            .field("clients", &self.lock_clients().len())
            .finish_non_exhaustive()
    }
}

/// A client's entry in the table, removed on drop.
pub struct ClientHandle {
    id: u64,
    state: Arc<ProxyState>,
}

impl ClientHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_state(&self, new: ClientState) {
        if let Some(info) = self.state.lock_clients().get_mut(&self.id) {
            info.state = new;
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.state.lock_clients().remove(&self.id);
    }
}
