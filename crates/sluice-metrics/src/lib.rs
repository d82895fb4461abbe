//! sluice-metrics — observability for Sluice pools.
//!
//! Counters are plain atomics updated on the hot path without touching any
//! pool lock. Gauges (idle, leased, waiting) are never cached here: the pool
//! registry reads them from live pool state when it builds a snapshot.
//!
//! # Architecture
//!
//! ```text
//! PoolCounters / ProxyCounters
//!   ├── record_*() ← called by pools and sessions
//!   └── load()     → CounterValues
//!
//! StatsSnapshot (immutable, built by the pool registry)
//!   ├── totals()            → aggregate counters
//!   └── render_prometheus() → text/plain for /metrics
//! ```

pub mod counters;
pub mod prometheus;
pub mod snapshot;

pub use counters::{ClientGuard, CounterValues, PoolCounters, ProxyCounters};
pub use prometheus::render_prometheus;
pub use snapshot::{PoolGauges, PoolSnapshot, ProxySnapshot, StatsSnapshot};
