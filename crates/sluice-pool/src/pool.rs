//! Per-target connection pool.
//!
//! Holds the idle set, the ids of leased connections, the count of connects
//! in flight and the wait queue behind one mutex. Every check that decides
//! whether a new connection may be opened happens under that mutex and
//! reserves a slot (`connecting += 1`) before the connect starts, so the
//! number of open plus in-flight connections never exceeds the hard limit.

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sluice_core::{Config, ConnectPolicy, PoolLimits, PoolMode, Target};
use sluice_metrics::{PoolCounters, PoolGauges, PoolSnapshot};

use crate::admission::{Admission, Grant, Offer, WaitQueue};
use crate::budget::Budgets;
use crate::connection::{BackendConnection, ConnectionState};
use crate::connector::{BackendConnector, connect_with_retry};
use crate::error::{PoolError, PoolResult};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

/// Tunables for one pool, resolved from the configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    pub limits: PoolLimits,
    /// Idle connections unused this long are closed. Zero disables.
    pub idle_timeout: Duration,
    /// Connections older than this are closed on release or sweep. Zero disables.
    pub server_lifetime: Duration,
    /// A waiter older than this may use the reserve.
    pub reserve_timeout: Duration,
    pub connect: ConnectPolicy,
}

impl PoolSettings {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            limits,
            idle_timeout: Duration::from_secs(600),
            server_lifetime: Duration::from_secs(3600),
            reserve_timeout: Duration::from_secs(5),
            connect: ConnectPolicy::default(),
        }
    }

    pub fn from_config(config: &Config, target: &Target) -> Self {
        let s = &config.settings;
        Self {
            limits: target.limits,
            idle_timeout: s.idle_timeout,
            server_lifetime: s.server_lifetime,
            reserve_timeout: s.reserve_pool_timeout,
            connect: config.connect_policy(),
        }
    }
}

/// How a session hands a connection back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Protocol state is clean; the connection may serve another session.
    Reusable,
    /// State unknown or damaged; the connection is destroyed.
    Broken,
}

struct Inner {
    target: Target,
    settings: PoolSettings,
    /// Most recently used at the back.
    idle: Vec<BackendConnection>,
    leased: HashSet<u64>,
    connecting: usize,
    waiting: WaitQueue,
    paused: bool,
    closed: bool,
}

impl Inner {
    /// Established connections, idle or leased.
    fn total(&self) -> usize {
        self.idle.len() + self.leased.len()
    }

    /// Established plus in-flight connections.
    fn open(&self) -> usize {
        self.total() + self.connecting
    }

    fn gauges(&self, now: Instant) -> PoolGauges {
        let limits = self.settings.limits;
        PoolGauges {
            idle: self.idle.len(),
            leased: self.leased.len(),
            connecting: self.connecting,
            waiting: self.waiting.live_count(now),
            max_wait_ms: u64::try_from(self.waiting.oldest_wait(now).as_millis())
                .unwrap_or(u64::MAX),
            min_size: limits.min_size,
            max_size: limits.max_size,
            reserve_size: limits.reserve_size,
        }
    }

    fn past_lifetime(&self, conn: &BackendConnection, now: Instant) -> bool {
        let lifetime = self.settings.server_lifetime;
        !lifetime.is_zero() && conn.age(now) >= lifetime
    }
}

enum Step {
    Ready(BackendConnection),
    Connect(Target, ConnectPolicy),
    Wait {
        id: u64,
        rx: oneshot::Receiver<Grant>,
        spawn: usize,
        starved: bool,
    },
}

/// A pool of backend connections for one target.
pub struct Pool {
    inner: Mutex<Inner>,
    connector: Arc<dyn BackendConnector>,
    counters: Arc<PoolCounters>,
    budgets: Budgets,
}

impl Pool {
    pub fn new(
        target: Target,
        settings: PoolSettings,
        connector: Arc<dyn BackendConnector>,
        budgets: Budgets,
    ) -> Arc<Self> {
        Self::with_counters(
            target,
            settings,
            connector,
            budgets,
            Arc::new(PoolCounters::new()),
        )
    }

    /// Like [`Pool::new`], continuing existing counters.
    pub fn with_counters(
        target: Target,
        settings: PoolSettings,
        connector: Arc<dyn BackendConnector>,
        budgets: Budgets,
        counters: Arc<PoolCounters>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            inner: Mutex::new(Inner {
                target,
                settings,
                idle: Vec::new(),
                leased: HashSet::new(),
                connecting: 0,
                waiting: WaitQueue::default(),
                paused: false,
                closed: false,
            }),
            connector,
            counters,
            budgets,
        });
        pool.budgets.join(&pool);
        pool
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Nothing panics while the lock is held; recover rather than poison every caller.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn alias(&self) -> String {
        self.lock().target.alias.clone()
    }

    pub fn target(&self) -> Target {
        self.lock().target.clone()
    }

    pub fn pool_mode(&self) -> PoolMode {
        self.lock().target.pool_mode
    }

    pub fn settings(&self) -> PoolSettings {
        self.lock().settings
    }

    pub fn counters(&self) -> &Arc<PoolCounters> {
        &self.counters
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    // ── Acquire ────────────────────────────────────────────────────

    /// Lease a connection, waiting in the queue until `deadline` if needed.
    pub async fn acquire(self: &Arc<Self>, deadline: Instant) -> PoolResult<Lease> {
        let started = Instant::now();
        let step = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(PoolError::Closed(inner.target.alias.clone()));
            }
            self.dispatch(&mut inner, started);

            let immediate = if !inner.paused && inner.waiting.live_count(started) == 0 {
                self.try_immediate(&mut inner, started)
            } else {
                None
            };

            match immediate {
                Some(step) => step,
                None => {
                    let capacity = inner.settings.limits.queue_capacity;
                    if !inner.waiting.has_room(capacity) {
                        let alias = inner.target.alias.clone();
                        inner.waiting.reap(started, &alias);
                    }
                    if !inner.waiting.has_room(capacity) {
                        self.counters.record_overloaded();
                        warn!(
                            database = %inner.target.alias,
                            admission = ?Admission::Rejected,
                            waiting = inner.waiting.len(),
                            capacity,
                            "wait queue full, rejecting request"
                        );
                        return Err(PoolError::Overloaded {
                            target: inner.target.alias.clone(),
                        });
                    }
                    let id = NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed);
                    let rx = inner.waiting.push(id, started, deadline);
                    let spawn = self.plan_connects(&mut inner, started);
                    let starved = self.starved(&inner, started);
                    debug!(
                        database = %inner.target.alias,
                        admission = ?Admission::Queued,
                        waiter = id,
                        waiting = inner.waiting.len(),
                        paused = inner.paused,
                        starved,
                        "request queued"
                    );
                    Step::Wait {
                        id,
                        rx,
                        spawn,
                        starved,
                    }
                }
            }
        };

        match step {
            Step::Ready(conn) => {
                self.counters.record_acquire(None);
                Ok(Lease::new(Arc::clone(self), conn))
            }
            Step::Connect(target, policy) => {
                let slot = ConnectSlot::reserved(Arc::clone(self));
                let stream =
                    connect_with_retry(self.connector.as_ref(), &target, &policy, &self.counters)
                        .await?;

                let mut inner = self.lock();
                slot.commit(&mut inner);
                let mut conn = BackendConnection::new(
                    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                    &target.alias,
                    stream,
                );
                if inner.closed {
                    self.destroy(&target.alias, conn, "pool closed");
                    return Err(PoolError::Closed(target.alias));
                }
                conn.set_state(ConnectionState::Leased);
                inner.leased.insert(conn.id());
                debug!(
                    database = %target.alias,
                    conn_id = conn.id(),
                    total = inner.total(),
                    "opened backend connection for request"
                );
                drop(inner);
                self.counters.record_acquire(None);
                Ok(Lease::new(Arc::clone(self), conn))
            }
            Step::Wait {
                id,
                rx,
                spawn,
                starved,
            } => {
                let spawn = if starved {
                    spawn + self.reclaim_budget()
                } else {
                    spawn
                };
                self.spawn_connects(spawn);
                self.counters.record_wait();
                self.wait_for_grant(id, rx, started, deadline).await
            }
        }
    }

    /// Serve from the idle set, or reserve a slot for a new connection.
    fn try_immediate(&self, inner: &mut Inner, now: Instant) -> Option<Step> {
        while let Some(mut conn) = inner.idle.pop() {
            if inner.past_lifetime(&conn, now) {
                self.destroy(&inner.target.alias, conn, "server lifetime");
                continue;
            }
            conn.set_state(ConnectionState::Leased);
            conn.touch(now);
            inner.leased.insert(conn.id());
            debug!(
                database = %inner.target.alias,
                admission = ?Admission::Immediate,
                conn_id = conn.id(),
                idle = inner.idle.len(),
                "leased idle connection"
            );
            return Some(Step::Ready(conn));
        }

        if inner.open() < inner.settings.limits.max_size && self.budgets.try_acquire() {
            inner.connecting += 1;
            return Some(Step::Connect(inner.target.clone(), inner.settings.connect));
        }
        None
    }

    async fn wait_for_grant(
        self: &Arc<Self>,
        id: u64,
        rx: oneshot::Receiver<Grant>,
        started: Instant,
        deadline: Instant,
    ) -> PoolResult<Lease> {
        let mut request = QueuedRequest {
            pool: Arc::clone(self),
            id,
            rx,
            pending: true,
        };

        match tokio::time::timeout_at(deadline, &mut request.rx).await {
            Ok(Ok(Ok(conn))) => {
                request.pending = false;
                self.counters.record_acquire(Some(started.elapsed()));
                Ok(Lease::new(Arc::clone(self), conn))
            }
            Ok(Ok(Err(e))) => {
                request.pending = false;
                if let PoolError::PoolExhausted { waited, .. } = &e {
                    self.counters.record_wait_timeout(*waited);
                }
                Err(e)
            }
            Ok(Err(_)) => {
                request.pending = false;
                Err(PoolError::Closed(self.alias()))
            }
            Err(_) => {
                request.pending = false;
                let removed = self.lock().waiting.remove(id);
                if !removed {
                    // A grant raced the deadline; keep it.
                    if let Ok(Ok(conn)) = request.rx.try_recv() {
                        self.counters.record_acquire(Some(started.elapsed()));
                        return Ok(Lease::new(Arc::clone(self), conn));
                    }
                }
                let waited = started.elapsed();
                self.counters.record_wait_timeout(waited);
                let target = self.alias();
                debug!(database = %target, waiter = id, ?waited, "queued request timed out");
                Err(PoolError::PoolExhausted { target, waited })
            }
        }
    }

    // ── Release ────────────────────────────────────────────────────

    fn checkin(self: &Arc<Self>, mut conn: BackendConnection, outcome: ReleaseOutcome) {
        let now = Instant::now();
        let spawn = {
            let mut inner = self.lock();
            inner.leased.remove(&conn.id());
            let limits = inner.settings.limits;

            let reason = match outcome {
                ReleaseOutcome::Broken => Some("broken"),
                ReleaseOutcome::Reusable if inner.closed => Some("pool closed"),
                ReleaseOutcome::Reusable if inner.past_lifetime(&conn, now) => {
                    Some("server lifetime")
                }
                ReleaseOutcome::Reusable if inner.open() >= limits.hard_max() => {
                    Some("pool above size limit")
                }
                ReleaseOutcome::Reusable
                    if inner.open() >= limits.max_size && inner.waiting.live_count(now) == 0 =>
                {
                    Some("reserve no longer needed")
                }
                ReleaseOutcome::Reusable => None,
            };

            match reason {
                Some(reason) => {
                    if outcome == ReleaseOutcome::Broken {
                        conn.set_state(ConnectionState::Broken);
                    }
                    self.destroy(&inner.target.alias, conn, reason);
                    self.plan_connects(&mut inner, now)
                }
                None => {
                    conn.touch(now);
                    conn.set_state(ConnectionState::Idle);
                    self.place(&mut inner, conn, now);
                    0
                }
            }
        };
        self.spawn_connects(spawn);
    }

    /// Give `conn` to the oldest live waiter, or park it idle.
    fn place(&self, inner: &mut Inner, conn: BackendConnection, now: Instant) {
        if inner.paused {
            inner.idle.push(conn);
            return;
        }
        match inner.waiting.offer(conn, now) {
            Offer::Granted { conn_id, waited } => {
                inner.leased.insert(conn_id);
                debug!(
                    database = %inner.target.alias,
                    conn_id,
                    ?waited,
                    waiting = inner.waiting.len(),
                    "granted connection to waiter"
                );
            }
            Offer::Returned(conn) => inner.idle.push(conn),
        }
    }

    /// Hand idle connections to waiters.
    fn dispatch(&self, inner: &mut Inner, now: Instant) {
        if inner.paused {
            return;
        }
        while !inner.waiting.is_empty() {
            let Some(conn) = inner.idle.pop() else {
                break;
            };
            if inner.past_lifetime(&conn, now) {
                self.destroy(&inner.target.alias, conn, "server lifetime");
                continue;
            }
            match inner.waiting.offer(conn, now) {
                Offer::Granted { conn_id, .. } => {
                    inner.leased.insert(conn_id);
                }
                Offer::Returned(conn) => {
                    inner.idle.push(conn);
                    break;
                }
            }
        }
    }

    fn destroy(&self, alias: &str, mut conn: BackendConnection, reason: &'static str) {
        if conn.state() != ConnectionState::Broken {
            conn.set_state(ConnectionState::Closing);
        }
        debug!(database = %alias, conn_id = conn.id(), reason, "closing backend connection");
        self.budgets.release();
        self.counters.record_disconnect();
    }

    // ── Shared budgets ─────────────────────────────────────────────

    /// Live waiters need connections that only the shared budget is holding back.
    fn starved(&self, inner: &Inner, now: Instant) -> bool {
        !inner.paused
            && !inner.closed
            && inner.open() < inner.settings.limits.max_size
            && inner.waiting.live_count(now) > inner.connecting + inner.idle.len()
            && self.budgets.is_exhausted()
    }

    /// Free a budget unit from a sibling's idle connection and plan connects
    /// with it. Returns how many connects to spawn. Call without the lock.
    fn reclaim_budget(&self) -> usize {
        if !self.budgets.reclaim_idle(self) {
            return 0;
        }
        let mut inner = self.lock();
        self.plan_connects(&mut inner, Instant::now())
    }

    /// Close the least recently used idle connection, handing its budget
    /// unit back. Returns whether one was closed.
    pub fn close_one_idle(&self) -> bool {
        let mut inner = self.lock();
        if inner.idle.is_empty() {
            return false;
        }
        let conn = inner.idle.remove(0);
        let alias = inner.target.alias.clone();
        self.destroy(&alias, conn, "budget needed by another pool");
        true
    }

    // ── Background connects ────────────────────────────────────────

    /// Reserve slots for connects needed by live waiters or the minimum size.
    fn plan_connects(&self, inner: &mut Inner, now: Instant) -> usize {
        if inner.closed {
            return 0;
        }
        let limits = inner.settings.limits;
        let for_waiters = if inner.paused {
            0
        } else {
            inner
                .waiting
                .live_count(now)
                .saturating_sub(inner.connecting + inner.idle.len())
        };
        let below_min = limits.min_size.saturating_sub(inner.open());
        let wanted = for_waiters.max(below_min);

        let use_reserve = for_waiters > 0
            && limits.reserve_size > 0
            && inner.waiting.oldest_wait(now) >= inner.settings.reserve_timeout;
        let cap = if use_reserve {
            limits.hard_max()
        } else {
            limits.max_size
        };

        let mut planned = 0;
        while planned < wanted && inner.open() < cap && self.budgets.try_acquire() {
            inner.connecting += 1;
            planned += 1;
        }
        if planned > 0 {
            debug!(
                database = %inner.target.alias,
                planned,
                reserve = use_reserve,
                open = inner.open(),
                "scheduling backend connects"
            );
        }
        planned
    }

    fn spawn_connects(self: &Arc<Self>, n: usize) {
        if n == 0 {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            let mut inner = self.lock();
            inner.connecting = inner.connecting.saturating_sub(n);
            drop(inner);
            for _ in 0..n {
                self.budgets.release();
            }
            return;
        };
        for _ in 0..n {
            let pool = Arc::clone(self);
            handle.spawn(async move {
                pool.open_reserved().await;
            });
        }
    }

    /// Fill one slot reserved by `plan_connects`. Returns whether it connected.
    async fn open_reserved(self: Arc<Self>) -> bool {
        let slot = ConnectSlot::reserved(Arc::clone(&self));
        let (target, policy) = {
            let inner = self.lock();
            (inner.target.clone(), inner.settings.connect)
        };

        match connect_with_retry(self.connector.as_ref(), &target, &policy, &self.counters).await {
            Ok(stream) => {
                let now = Instant::now();
                let mut inner = self.lock();
                slot.commit(&mut inner);
                let conn = BackendConnection::new(
                    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                    &target.alias,
                    stream,
                );
                if inner.closed {
                    self.destroy(&target.alias, conn, "pool closed");
                    return false;
                }
                debug!(database = %target.alias, conn_id = conn.id(), "opened backend connection");
                self.place(&mut inner, conn, now);
                true
            }
            Err(e) => {
                drop(slot);
                let mut inner = self.lock();
                if !inner.paused {
                    inner.waiting.fail_front(e, Instant::now());
                }
                false
            }
        }
    }

    /// Open connections up to the minimum size. Returns how many opened.
    pub async fn warm_up(self: &Arc<Self>) -> usize {
        let planned = {
            let mut inner = self.lock();
            self.plan_connects(&mut inner, Instant::now())
        };
        let mut opened = 0;
        for _ in 0..planned {
            if Arc::clone(self).open_reserved().await {
                opened += 1;
            }
        }
        opened
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Replace size limits. Leased connections are never closed here.
    pub fn resize(self: &Arc<Self>, limits: PoolLimits) {
        let now = Instant::now();
        let spawn = {
            let mut inner = self.lock();
            let old = inner.settings.limits;
            if old == limits {
                return;
            }
            inner.settings.limits = limits;

            let mut closed = 0;
            while inner.total() > limits.max_size && !inner.idle.is_empty() {
                // Least recently used first.
                let conn = inner.idle.remove(0);
                self.destroy(&inner.target.alias, conn, "pool shrunk");
                closed += 1;
            }
            info!(
                database = %inner.target.alias,
                min = limits.min_size,
                max = limits.max_size,
                reserve = limits.reserve_size,
                queue = limits.queue_capacity,
                old_max = old.max_size,
                closed_idle = closed,
                "pool resized"
            );
            self.dispatch(&mut inner, now);
            self.plan_connects(&mut inner, now)
        };
        self.spawn_connects(spawn);
    }

    /// Apply a new target definition with the same backend identity.
    pub fn reconfigure(self: &Arc<Self>, target: Target, settings: PoolSettings) {
        {
            let mut inner = self.lock();
            let limits = inner.settings.limits;
            inner.target = target;
            inner.settings = PoolSettings { limits, ..settings };
        }
        self.resize(settings.limits);
    }

    /// Close idle connections unused for longer than `max_idle`, keeping
    /// at least `min_size` open. Idle connections past the server lifetime
    /// are closed regardless of the minimum.
    pub fn evict_idle_older_than(&self, max_idle: Duration) -> usize {
        let mut inner = self.lock();
        self.evict_idle(&mut inner, max_idle, Instant::now())
    }

    fn evict_idle(&self, inner: &mut Inner, max_idle: Duration, now: Instant) -> usize {
        let min = inner.settings.limits.min_size;
        let mut total = inner.total();
        let idle = std::mem::take(&mut inner.idle);
        let mut kept = Vec::with_capacity(idle.len());
        let mut evicted = 0;

        for conn in idle {
            if inner.past_lifetime(&conn, now) {
                self.destroy(&inner.target.alias, conn, "server lifetime");
            } else if total > min && conn.idle_for(now) > max_idle {
                self.destroy(&inner.target.alias, conn, "idle timeout");
            } else {
                kept.push(conn);
                continue;
            }
            total -= 1;
            evicted += 1;
        }
        inner.idle = kept;
        evicted
    }

    /// Periodic maintenance: reap waiters, evict idle, open connections for
    /// waiters and for the minimum size.
    pub fn sweep(self: &Arc<Self>, now: Instant) {
        let (planned, starved) = {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            let alias = inner.target.alias.clone();
            let reaped = inner.waiting.reap(now, &alias);
            let max_idle = match inner.settings.idle_timeout {
                d if d.is_zero() => Duration::MAX,
                d => d,
            };
            let evicted = self.evict_idle(&mut inner, max_idle, now);
            self.dispatch(&mut inner, now);
            let planned = self.plan_connects(&mut inner, now);
            if reaped > 0 || evicted > 0 {
                debug!(database = %alias, reaped, evicted, planned, "pool swept");
            }
            (planned, self.starved(&inner, now))
        };
        let spawn = if starved {
            planned + self.reclaim_budget()
        } else {
            planned
        };
        self.spawn_connects(spawn);
    }

    /// Stop leasing. Requests queue until resumed or their deadline passes.
    pub fn pause(&self) {
        let mut inner = self.lock();
        if !inner.paused {
            inner.paused = true;
            info!(database = %inner.target.alias, leased = inner.leased.len(), "pool paused");
        }
    }

    pub fn resume(self: &Arc<Self>) {
        let now = Instant::now();
        let spawn = {
            let mut inner = self.lock();
            if !inner.paused {
                return;
            }
            inner.paused = false;
            info!(
                database = %inner.target.alias,
                waiting = inner.waiting.len(),
                "pool resumed"
            );
            self.dispatch(&mut inner, now);
            self.plan_connects(&mut inner, now)
        };
        self.spawn_connects(spawn);
    }

    /// Close the pool: idle connections go now, leased ones on release.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let alias = inner.target.alias.clone();
        for conn in std::mem::take(&mut inner.idle) {
            self.destroy(&alias, conn, "pool closed");
        }
        inner.waiting.close_all(PoolError::Closed(alias.clone()));
        info!(database = %alias, leased = inner.leased.len(), "pool closed");
    }

    // ── Stats ──────────────────────────────────────────────────────

    pub fn gauges(&self) -> PoolGauges {
        self.lock().gauges(Instant::now())
    }

    /// Gauges and target fields read under one lock.
    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.lock();
        PoolSnapshot {
            database: inner.target.alias.clone(),
            user: inner.target.user.clone(),
            pool_mode: inner.target.pool_mode.to_string(),
            paused: inner.paused,
            gauges: inner.gauges(Instant::now()),
            counters: self.counters.load(),
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Pool")
            .field("target", &inner.target.alias)
            .field("idle", &inner.idle.len())
            .field("leased", &inner.leased.len())
            .field("connecting", &inner.connecting)
            .field("waiting", &inner.waiting.len())
            .field("paused", &inner.paused)
            .field("closed", &inner.closed)
            .finish()
    }
}

/// A slot reserved under the pool lock for one in-flight connect.
///
/// Dropping it without `commit` hands the slot and its budget unit back.
struct ConnectSlot {
    pool: Arc<Pool>,
    armed: bool,
}

impl ConnectSlot {
    fn reserved(pool: Arc<Pool>) -> Self {
        Self { pool, armed: true }
    }

    /// The connect succeeded; the caller now owns the budget unit.
    fn commit(mut self, inner: &mut Inner) {
        inner.connecting = inner.connecting.saturating_sub(1);
        self.armed = false;
    }
}

impl Drop for ConnectSlot {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.pool.lock();
            inner.connecting = inner.connecting.saturating_sub(1);
            drop(inner);
            self.pool.budgets.release();
        }
    }
}

/// A parked acquire. Dropping it while pending withdraws from the queue.
struct QueuedRequest {
    pool: Arc<Pool>,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    pending: bool,
}

impl Drop for QueuedRequest {
    fn drop(&mut self) {
        if !self.pending {
            return;
        }
        let removed = self.pool.lock().waiting.remove(self.id);
        if !removed {
            // Served before the cancellation landed; pass the connection on.
            if let Ok(Ok(conn)) = self.rx.try_recv() {
                self.pool.checkin(conn, ReleaseOutcome::Reusable);
            }
        }
    }
}

/// Exclusive use of one backend connection.
///
/// Dropping a lease without calling [`Lease::release`] destroys the
/// connection: its protocol state is unknown.
pub struct Lease {
    pool: Arc<Pool>,
    conn: Option<BackendConnection>,
    leased_at: Instant,
}

impl Lease {
    fn new(pool: Arc<Pool>, conn: BackendConnection) -> Self {
        Self {
            pool,
            conn: Some(conn),
            leased_at: Instant::now(),
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn leased_at(&self) -> Instant {
        self.leased_at
    }

    /// Give the connection back.
    pub fn release(mut self, outcome: ReleaseOutcome) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn, outcome);
        }
    }
}

impl Deref for Lease {
    type Target = BackendConnection;

    fn deref(&self) -> &Self::Target {
        // Only `release` takes the connection, and it consumes the lease.
        self.conn.as_ref().expect("lease holds a connection")
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("lease holds a connection")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn, ReleaseOutcome::Broken);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("conn", &self.conn)
            .field("leased_at", &self.leased_at)
            .finish()
    }
}
