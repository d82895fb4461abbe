//! Wait queue and admission control.
//!
//! A request that cannot be served immediately is parked here as a
//! [`Waiter`] holding the sending half of a one-shot channel. Entries are
//! served strictly in arrival order. An entry whose deadline has passed is
//! skipped and failed with `PoolExhausted`; an entry whose receiver is gone
//! (the client went away) is skipped without being granted anything.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::connection::{BackendConnection, ConnectionState};
use crate::error::PoolError;

/// What a parked request eventually receives.
pub(crate) type Grant = Result<BackendConnection, PoolError>;

/// Admission decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Served without waiting.
    Immediate,
    /// Parked in the wait queue.
    Queued,
    /// Rejected because the queue is full.
    Rejected,
}

/// A parked request.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) enqueued_at: Instant,
    pub(crate) deadline: Instant,
    tx: oneshot::Sender<Grant>,
}

impl Waiter {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline > now && !self.tx.is_closed()
    }
}

/// Result of offering a connection to the queue.
#[derive(Debug)]
pub(crate) enum Offer {
    /// Handed to a waiter.
    Granted { conn_id: u64, waited: Duration },
    /// Nobody could take it.
    Returned(BackendConnection),
}

/// FIFO queue of parked requests for one pool.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    entries: VecDeque<Waiter>,
}

impl WaitQueue {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether another request may be parked under `capacity`.
    pub(crate) fn has_room(&self, capacity: usize) -> bool {
        self.entries.len() < capacity
    }

    /// Park a request at the back of the queue.
    pub(crate) fn push(
        &mut self,
        id: u64,
        enqueued_at: Instant,
        deadline: Instant,
    ) -> oneshot::Receiver<Grant> {
        let (tx, rx) = oneshot::channel();
        self.entries.push_back(Waiter {
            id,
            enqueued_at,
            deadline,
            tx,
        });
        rx
    }

    /// Remove a waiter by id. Returns `false` if it was already served.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        // Timeouts and cancellations usually hit the front of the queue.
        match self.entries.iter().position(|w| w.id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Waiters that can still be granted.
    pub(crate) fn live_count(&self, now: Instant) -> usize {
        self.entries.iter().filter(|w| w.is_live(now)).count()
    }

    /// How long the oldest live waiter has been parked.
    pub(crate) fn oldest_wait(&self, now: Instant) -> Duration {
        self.entries
            .iter()
            .find(|w| w.is_live(now))
            .map(|w| now.saturating_duration_since(w.enqueued_at))
            .unwrap_or_default()
    }

    /// Hand `conn` to the oldest live waiter.
    ///
    /// Expired entries met on the way are failed with `PoolExhausted`;
    /// cancelled entries are dropped and the connection moves on.
    pub(crate) fn offer(&mut self, mut conn: BackendConnection, now: Instant) -> Offer {
        while let Some(waiter) = self.entries.pop_front() {
            if waiter.deadline <= now {
                let waited = now.saturating_duration_since(waiter.enqueued_at);
                let _ = waiter.tx.send(Err(PoolError::PoolExhausted {
                    target: conn.target().to_string(),
                    waited,
                }));
                continue;
            }

            let conn_id = conn.id();
            conn.set_state(ConnectionState::Leased);
            conn.touch(now);
            match waiter.tx.send(Ok(conn)) {
                Ok(()) => {
                    return Offer::Granted {
                        conn_id,
                        waited: now.saturating_duration_since(waiter.enqueued_at),
                    };
                }
                Err(Ok(returned)) => {
                    conn = returned;
                    conn.set_state(ConnectionState::Idle);
                }
                // Only `Ok` grants are sent on this path.
                Err(Err(_)) => unreachable!("grant channel returned an error value"),
            }
        }
        Offer::Returned(conn)
    }

    /// Fail every expired waiter and drop cancelled ones. Returns how many were removed.
    pub(crate) fn reap(&mut self, now: Instant, target: &str) -> usize {
        let before = self.entries.len();
        let mut kept = VecDeque::with_capacity(before);
        for waiter in self.entries.drain(..) {
            if waiter.tx.is_closed() {
                continue;
            }
            if waiter.deadline <= now {
                let waited = now.saturating_duration_since(waiter.enqueued_at);
                let _ = waiter.tx.send(Err(PoolError::PoolExhausted {
                    target: target.to_string(),
                    waited,
                }));
                continue;
            }
            kept.push_back(waiter);
        }
        self.entries = kept;
        before - self.entries.len()
    }

    /// Fail the oldest live waiter with `err`. Returns `false` if none was live.
    pub(crate) fn fail_front(&mut self, err: PoolError, now: Instant) -> bool {
        while let Some(waiter) = self.entries.pop_front() {
            if !waiter.is_live(now) {
                // Expired ones get their own error; cancelled ones nothing.
                if waiter.deadline <= now && !waiter.tx.is_closed() {
                    let waited = now.saturating_duration_since(waiter.enqueued_at);
                    let target = match &err {
                        PoolError::BackendUnavailable { target, .. } => target.clone(),
                        _ => String::new(),
                    };
                    let _ = waiter.tx.send(Err(PoolError::PoolExhausted { target, waited }));
                }
                continue;
            }
            let _ = waiter.tx.send(Err(err));
            return true;
        }
        false
    }

    /// Fail every waiter with `err`.
    pub(crate) fn close_all(&mut self, err: PoolError) {
        for waiter in self.entries.drain(..) {
            let _ = waiter.tx.send(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: u64) -> BackendConnection {
        let (stream, _peer) = tokio::io::duplex(64);
        BackendConnection::new(id, "app", Box::new(stream))
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn offer_serves_oldest_first() {
        let mut queue = WaitQueue::default();
        let now = Instant::now();
        let mut first = queue.push(1, now, far());
        let mut second = queue.push(2, now, far());

        assert!(matches!(queue.offer(conn(10), now), Offer::Granted { conn_id: 10, .. }));
        let granted = first.try_recv().unwrap().unwrap();
        assert_eq!(granted.id(), 10);
        assert_eq!(granted.state(), ConnectionState::Leased);
        assert!(second.try_recv().is_err());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn offer_skips_cancelled_waiters() {
        let mut queue = WaitQueue::default();
        let now = Instant::now();
        let cancelled = queue.push(1, now, far());
        let mut live = queue.push(2, now, far());
        drop(cancelled);

        assert!(matches!(queue.offer(conn(10), now), Offer::Granted { .. }));
        assert_eq!(live.try_recv().unwrap().unwrap().id(), 10);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn offer_fails_expired_waiters() {
        let mut queue = WaitQueue::default();
        let now = Instant::now();
        let mut expired = queue.push(1, now - Duration::from_secs(2), now - Duration::from_secs(1));
        let mut live = queue.push(2, now, far());

        assert!(matches!(queue.offer(conn(10), now), Offer::Granted { .. }));
        assert!(matches!(
            expired.try_recv().unwrap(),
            Err(PoolError::PoolExhausted { .. })
        ));
        assert!(live.try_recv().unwrap().is_ok());
    }

    #[tokio::test]
    async fn offer_returns_connection_when_nobody_waits() {
        let mut queue = WaitQueue::default();
        match queue.offer(conn(10), Instant::now()) {
            Offer::Returned(c) => assert_eq!(c.state(), ConnectionState::Idle),
            Offer::Granted { .. } => panic!("granted to nobody"),
        }
    }

    #[tokio::test]
    async fn remove_by_id() {
        let mut queue = WaitQueue::default();
        let now = Instant::now();
        let _a = queue.push(1, now, far());
        let _b = queue.push(2, now, far());
        let _c = queue.push(3, now, far());
        assert!(queue.remove(2));
        assert!(!queue.remove(2));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn reap_fails_expired_and_drops_cancelled() {
        let mut queue = WaitQueue::default();
        let now = Instant::now();
        let mut expired = queue.push(1, now, now);
        let cancelled = queue.push(2, now, far());
        let _live = queue.push(3, now, far());
        drop(cancelled);

        assert_eq!(queue.reap(now, "app"), 2);
        assert_eq!(queue.len(), 1);
        assert!(matches!(
            expired.try_recv().unwrap(),
            Err(PoolError::PoolExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn has_room_respects_capacity() {
        let mut queue = WaitQueue::default();
        assert!(!queue.has_room(0));
        assert!(queue.has_room(1));
        let _a = queue.push(1, Instant::now(), far());
        assert!(!queue.has_room(1));
    }

    #[tokio::test]
    async fn fail_front_targets_oldest_live_waiter() {
        let mut queue = WaitQueue::default();
        let now = Instant::now();
        let mut first = queue.push(1, now, far());
        let mut second = queue.push(2, now, far());
        let err = PoolError::BackendUnavailable {
            target: "app".to_string(),
            attempts: 1,
            reason: "down".to_string(),
        };
        assert!(queue.fail_front(err.clone(), now));
        assert_eq!(first.try_recv().unwrap().unwrap_err(), err);
        assert!(second.try_recv().is_err());
    }

    #[tokio::test]
    async fn oldest_wait_reports_head_age() {
        let mut queue = WaitQueue::default();
        let now = Instant::now();
        let _a = queue.push(1, now - Duration::from_millis(250), far());
        let _b = queue.push(2, now, far());
        assert_eq!(queue.oldest_wait(now), Duration::from_millis(250));
        assert_eq!(queue.live_count(now), 2);
    }
}
