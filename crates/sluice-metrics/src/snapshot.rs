//! Immutable point-in-time statistics.

use serde::Serialize;

use crate::counters::CounterValues;

/// Live pool state read under the pool lock at snapshot time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolGauges {
    pub idle: usize,
    pub leased: usize,
    /// Backend connects in flight.
    pub connecting: usize,
    pub waiting: usize,
    /// Age of the oldest waiter, in milliseconds.
    pub max_wait_ms: u64,
    pub min_size: usize,
    pub max_size: usize,
    pub reserve_size: usize,
}

impl PoolGauges {
    /// Open backend connections (idle + leased).
    pub fn total(&self) -> usize {
        self.idle + self.leased
    }
}

/// One pool's gauges and cumulative counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub database: String,
    pub user: String,
    pub pool_mode: String,
    pub paused: bool,
    pub gauges: PoolGauges,
    pub counters: CounterValues,
}

/// Listener-level state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProxySnapshot {
    pub clients_active: usize,
    pub clients_accepted: u64,
    pub clients_rejected: u64,
    pub auth_failures: u64,
}

/// Everything the admin console and the metrics endpoint report.
///
/// Built once, never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Milliseconds since the Unix epoch.
    pub taken_at_ms: u64,
    pub uptime_secs: f64,
    pub pools: Vec<PoolSnapshot>,
    pub proxy: ProxySnapshot,
}

impl StatsSnapshot {
    /// Counters summed across all pools.
    pub fn totals(&self) -> CounterValues {
        self.pools
            .iter()
            .fold(CounterValues::default(), |acc, p| acc.merge(p.counters))
    }

    /// Gauges summed across all pools.
    pub fn total_gauges(&self) -> PoolGauges {
        self.pools.iter().fold(PoolGauges::default(), |acc, p| PoolGauges {
            idle: acc.idle + p.gauges.idle,
            leased: acc.leased + p.gauges.leased,
            connecting: acc.connecting + p.gauges.connecting,
            waiting: acc.waiting + p.gauges.waiting,
            max_wait_ms: acc.max_wait_ms.max(p.gauges.max_wait_ms),
            min_size: acc.min_size + p.gauges.min_size,
            max_size: acc.max_size + p.gauges.max_size,
            reserve_size: acc.reserve_size + p.gauges.reserve_size,
        })
    }

    pub fn pool(&self, database: &str) -> Option<&PoolSnapshot> {
        self.pools.iter().find(|p| p.database == database)
    }
}
