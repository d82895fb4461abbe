//! Cumulative counters for pools and the client listener.
//!
//! Every cumulative series only ever grows (`fetch_add`). The single gauge in
//! this module, active clients, is driven by an RAII guard so it cannot drop
//! below zero.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Per-pool cumulative counters.
#[derive(Debug, Default)]
pub struct PoolCounters {
    acquires: AtomicU64,
    waits: AtomicU64,
    wait_timeouts: AtomicU64,
    overloaded: AtomicU64,
    connects: AtomicU64,
    connect_errors: AtomicU64,
    disconnects: AtomicU64,
    queries: AtomicU64,
    xacts: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    wait_time_us: AtomicU64,
    xact_time_us: AtomicU64,
    query_time_us: AtomicU64,
}

/// Point-in-time copy of [`PoolCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterValues {
    /// Successful acquisitions (immediate or after waiting).
    pub acquires: u64,
    /// Requests that had to enter the wait queue.
    pub waits: u64,
    /// Queued requests that hit their deadline.
    pub wait_timeouts: u64,
    /// Requests rejected because the wait queue was full.
    pub overloaded: u64,
    /// Backend connections opened.
    pub connects: u64,
    /// Failed backend connect attempts.
    pub connect_errors: u64,
    /// Backend connections closed.
    pub disconnects: u64,
    /// Requests relayed to the backend.
    pub queries: u64,
    /// Completed units of work.
    pub xacts: u64,
    /// Bytes read from clients and sent to backends.
    pub bytes_received: u64,
    /// Bytes read from backends and sent to clients.
    pub bytes_sent: u64,
    pub wait_time_us: u64,
    pub xact_time_us: u64,
    pub query_time_us: u64,
}

impl CounterValues {
    /// Field-wise sum, used for aggregate totals.
    pub fn merge(self, other: CounterValues) -> CounterValues {
        CounterValues {
            acquires: self.acquires + other.acquires,
            waits: self.waits + other.waits,
            wait_timeouts: self.wait_timeouts + other.wait_timeouts,
            overloaded: self.overloaded + other.overloaded,
            connects: self.connects + other.connects,
            connect_errors: self.connect_errors + other.connect_errors,
            disconnects: self.disconnects + other.disconnects,
            queries: self.queries + other.queries,
            xacts: self.xacts + other.xacts,
            bytes_received: self.bytes_received + other.bytes_received,
            bytes_sent: self.bytes_sent + other.bytes_sent,
            wait_time_us: self.wait_time_us + other.wait_time_us,
            xact_time_us: self.xact_time_us + other.xact_time_us,
            query_time_us: self.query_time_us + other.query_time_us,
        }
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

impl PoolCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection was handed out; `waited` is the time spent queued, if any.
    pub fn record_acquire(&self, waited: Option<Duration>) {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        if let Some(waited) = waited {
            self.wait_time_us.fetch_add(micros(waited), Ordering::Relaxed);
        }
    }

    pub fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait_timeout(&self, waited: Duration) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
        self.wait_time_us.fetch_add(micros(waited), Ordering::Relaxed);
    }

    pub fn record_overloaded(&self) {
        self.overloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_error(&self) {
        self.connect_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self, elapsed: Duration) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.query_time_us.fetch_add(micros(elapsed), Ordering::Relaxed);
    }

    pub fn record_xact(&self, elapsed: Duration) {
        self.xacts.fetch_add(1, Ordering::Relaxed);
        self.xact_time_us.fetch_add(micros(elapsed), Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn load(&self) -> CounterValues {
        CounterValues {
            acquires: self.acquires.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            overloaded: self.overloaded.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            connect_errors: self.connect_errors.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            xacts: self.xacts.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            wait_time_us: self.wait_time_us.load(Ordering::Relaxed),
            xact_time_us: self.xact_time_us.load(Ordering::Relaxed),
            query_time_us: self.query_time_us.load(Ordering::Relaxed),
        }
    }
}

/// Listener-level counters shared by every client session.
#[derive(Debug, Default)]
pub struct ProxyCounters {
    clients_active: AtomicUsize,
    clients_accepted: AtomicU64,
    clients_rejected: AtomicU64,
    auth_failures: AtomicU64,
}

impl ProxyCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live client. The gauge drops when the guard does.
    pub fn client_connected(self: &Arc<Self>) -> ClientGuard {
        self.clients_active.fetch_add(1, Ordering::Relaxed);
        self.clients_accepted.fetch_add(1, Ordering::Relaxed);
        ClientGuard {
            counters: Arc::clone(self),
        }
    }

    pub fn record_rejected(&self) {
        self.clients_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clients_active(&self) -> usize {
        self.clients_active.load(Ordering::Relaxed)
    }

    pub fn clients_accepted(&self) -> u64 {
        self.clients_accepted.load(Ordering::Relaxed)
    }

    pub fn clients_rejected(&self) -> u64 {
        self.clients_rejected.load(Ordering::Relaxed)
    }

    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }
}

/// Keeps one client counted as active while alive.
#[derive(Debug)]
pub struct ClientGuard {
    counters: Arc<ProxyCounters>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.counters.clients_active.fetch_sub(1, Ordering::Relaxed);
    }
}
