//! A single backend connection and its bookkeeping.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::connector::BackendStream;

/// Lifecycle state of a backend connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Owned by the pool, available for reuse.
    Idle,
    /// Owned by exactly one client session.
    Leased,
    /// Being closed by the pool (eviction, shrink, shutdown).
    Closing,
    /// Unusable; never returned to the idle set.
    Broken,
}

/// One established, authenticated connection to a backend.
pub struct BackendConnection {
    id: u64,
    target: String,
    state: ConnectionState,
    created_at: Instant,
    last_used: Instant,
    bytes_sent: u64,
    bytes_received: u64,
    stream: Box<dyn BackendStream>,
}

impl BackendConnection {
    pub fn new(id: u64, target: &str, stream: Box<dyn BackendStream>) -> Self {
        let now = Instant::now();
        Self {
            id,
            target: target.to_string(),
            state: ConnectionState::Idle,
            created_at: now,
            last_used: now,
            bytes_sent: 0,
            bytes_received: 0,
            stream,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Alias of the target this connection belongs to.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_used = now;
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    /// Transport to the backend. Only the current owner may touch it.
    pub fn stream_mut(&mut self) -> &mut (dyn BackendStream + 'static) {
        self.stream.as_mut()
    }

    /// Bytes written to the backend.
    pub fn record_sent(&mut self, n: usize) {
        self.bytes_sent += n as u64;
    }

    /// Bytes read from the backend.
    pub fn record_received(&mut self, n: usize) {
        self.bytes_received += n as u64;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state)
            .field("bytes_sent", &self.bytes_sent)
            .field("bytes_received", &self.bytes_received)
            .finish_non_exhaustive()
    }
}
