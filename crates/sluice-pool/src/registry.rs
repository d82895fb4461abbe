//! The set of live pools, keyed by database alias.
//!
//! Reloads diff the new configuration against the running pools: unchanged
//! targets keep their pools (and their leases), changed limits resize in
//! place, a changed backend identity replaces the pool, and removed targets
//! are closed. Counters belong to the alias and survive a replacement.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use sluice_core::{Config, Target};
use sluice_metrics::{PoolCounters, ProxyCounters, ProxySnapshot, StatsSnapshot};

use crate::budget::{Budgets, ConnectionBudget};
use crate::connector::BackendConnector;
use crate::error::{PoolError, PoolResult};
use crate::pool::{Pool, PoolSettings};

/// What a call to [`PoolRegistry::apply`] changed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Backend identity changed; the old pool was closed.
    pub replaced: Vec<String>,
    /// Same backend, new limits or settings.
    pub updated: Vec<String>,
}

impl ApplyReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.replaced.is_empty()
            && self.updated.is_empty()
    }
}

/// Shared database and user budgets, one per backend database and backend user.
#[derive(Debug, Default)]
struct BudgetBook {
    max_db: usize,
    max_user: usize,
    databases: HashMap<String, Arc<ConnectionBudget>>,
    users: HashMap<String, Arc<ConnectionBudget>>,
}

impl BudgetBook {
    fn set_limits(&mut self, max_db: usize, max_user: usize) {
        self.max_db = max_db;
        self.max_user = max_user;
        for budget in self.databases.values() {
            budget.set_limit(max_db);
        }
        for budget in self.users.values() {
            budget.set_limit(max_user);
        }
    }

    fn budgets_for(&mut self, target: &Target) -> Budgets {
        let max_db = self.max_db;
        let max_user = self.max_user;
        let database = self
            .databases
            .entry(target.database_key())
            .or_insert_with(|| Arc::new(ConnectionBudget::new(max_db)))
            .clone();
        let user = self
            .users
            .entry(target.user.clone())
            .or_insert_with(|| Arc::new(ConnectionBudget::new(max_user)))
            .clone();
        Budgets::new(database, user)
    }
}

/// Every pool the proxy serves, plus listener-level counters.
pub struct PoolRegistry {
    pools: RwLock<BTreeMap<String, Arc<Pool>>>,
    budgets: Mutex<BudgetBook>,
    counters: Mutex<BTreeMap<String, Arc<PoolCounters>>>,
    connector: Arc<dyn BackendConnector>,
    proxy: Arc<ProxyCounters>,
    started: Instant,
}

impl PoolRegistry {
    /// An empty registry. Call [`PoolRegistry::apply`] to create pools.
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            pools: RwLock::new(BTreeMap::new()),
            budgets: Mutex::new(BudgetBook::default()),
            counters: Mutex::new(BTreeMap::new()),
            connector,
            proxy: Arc::new(ProxyCounters::new()),
            started: Instant::now(),
        }
    }

    pub fn from_config(config: &Config, connector: Arc<dyn BackendConnector>) -> Self {
        let registry = Self::new(connector);
        registry.apply(config);
        registry
    }

    pub fn proxy_counters(&self) -> &Arc<ProxyCounters> {
        &self.proxy
    }

    pub fn get(&self, alias: &str) -> Option<Arc<Pool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alias)
            .cloned()
    }

    /// Like [`PoolRegistry::get`], with the error sessions report.
    pub fn require(&self, alias: &str) -> PoolResult<Arc<Pool>> {
        self.get(alias)
            .ok_or_else(|| PoolError::UnknownTarget(alias.to_string()))
    }

    /// All pools, ordered by alias.
    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Bring the pool set in line with `config`.
    ///
    /// The configuration must already be validated. In-flight leases on
    /// kept pools are untouched.
    pub fn apply(&self, config: &Config) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut book = self.budgets.lock().unwrap_or_else(PoisonError::into_inner);
        book.set_limits(
            config.settings.max_db_connections,
            config.settings.max_user_connections,
        );

        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = BTreeMap::new();

        for target in config.targets() {
            let settings = PoolSettings::from_config(config, &target);
            let alias = target.alias.clone();

            match pools.remove(&alias) {
                Some(pool) if pool.target().same_identity(&target) => {
                    if pool.target() != target || pool.settings() != settings {
                        pool.reconfigure(target, settings);
                        report.updated.push(alias.clone());
                    }
                    next.insert(alias, pool);
                }
                Some(old) => {
                    old.close();
                    let pool = self.create(&mut book, &mut counters, target, settings);
                    report.replaced.push(alias.clone());
                    next.insert(alias, pool);
                }
                None => {
                    let pool = self.create(&mut book, &mut counters, target, settings);
                    report.added.push(alias.clone());
                    next.insert(alias, pool);
                }
            }
        }

        for (alias, pool) in std::mem::take(&mut *pools) {
            pool.close();
            counters.remove(&alias);
            report.removed.push(alias);
        }
        *pools = next;

        if !report.is_empty() {
            info!(
                added = ?report.added,
                removed = ?report.removed,
                replaced = ?report.replaced,
                updated = ?report.updated,
                pools = pools.len(),
                "pool set updated"
            );
        }
        report
    }

    /// A new pool on the shared budgets, continuing the alias's counters.
    fn create(
        &self,
        book: &mut BudgetBook,
        counters: &mut BTreeMap<String, Arc<PoolCounters>>,
        target: Target,
        settings: PoolSettings,
    ) -> Arc<Pool> {
        let budgets = book.budgets_for(&target);
        let stats = counters
            .entry(target.alias.clone())
            .or_insert_with(|| Arc::new(PoolCounters::new()))
            .clone();
        Pool::with_counters(target, settings, Arc::clone(&self.connector), budgets, stats)
    }

    /// Open every pool's minimum connections. Returns how many opened.
    pub async fn warm_up(&self) -> usize {
        let mut opened = 0;
        for pool in self.pools() {
            opened += pool.warm_up().await;
        }
        if opened > 0 {
            info!(opened, "pools warmed up");
        }
        opened
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        for pool in self.pools() {
            pool.sweep(now);
        }
    }

    /// Pause one pool, or every pool when `alias` is `None`. Returns how many paused.
    pub fn pause(&self, alias: Option<&str>) -> PoolResult<usize> {
        let pools = self.select(alias)?;
        for pool in &pools {
            pool.pause();
        }
        Ok(pools.len())
    }

    pub fn resume(&self, alias: Option<&str>) -> PoolResult<usize> {
        let pools = self.select(alias)?;
        for pool in &pools {
            pool.resume();
        }
        Ok(pools.len())
    }

    fn select(&self, alias: Option<&str>) -> PoolResult<Vec<Arc<Pool>>> {
        match alias {
            Some(alias) => Ok(vec![self.require(alias)?]),
            None => Ok(self.pools()),
        }
    }

    pub fn close_all(&self) {
        for pool in self.pools() {
            pool.close();
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let taken_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        StatsSnapshot {
            taken_at_ms,
            uptime_secs: self.started.elapsed().as_secs_f64(),
            pools: self.pools().iter().map(|p| p.snapshot()).collect(),
            proxy: ProxySnapshot {
                clients_active: self.proxy.clients_active(),
                clients_accepted: self.proxy.clients_accepted(),
                clients_rejected: self.proxy.clients_rejected(),
                auth_failures: self.proxy.auth_failures(),
            },
        }
    }

    /// Log one line per pool.
    pub fn log_stats(&self) {
        for pool in self.snapshot().pools {
            info!(
                database = %pool.database,
                user = %pool.user,
                pool_mode = %pool.pool_mode,
                leased = pool.gauges.leased,
                idle = pool.gauges.idle,
                waiting = pool.gauges.waiting,
                max_wait_ms = pool.gauges.max_wait_ms,
                xacts = pool.counters.xacts,
                queries = pool.counters.queries,
                "pool statistics"
            );
        }
    }

    /// Sweep every `sweep_interval` and log stats every `stats_period`
    /// until `shutdown` flips.
    pub async fn run_maintenance(
        &self,
        sweep_interval: Duration,
        stats_period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            sweep_ms = sweep_interval.as_millis() as u64,
            stats_secs = stats_period.as_secs(),
            "pool maintenance started"
        );
        let mut sweep = tokio::time::interval(sweep_interval);
        let mut stats = tokio::time::interval(stats_period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately.
        stats.tick().await;

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    debug!("sweeping pools");
                    self.sweep();
                }
                _ = stats.tick() => self.log_stats(),
                _ = shutdown.changed() => {
                    info!("pool maintenance shutting down");
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.aliases())
            .finish_non_exhaustive()
    }
}
