//! Backend connector abstraction and connect retry.
//!
//! The pool never opens sockets itself. A [`BackendConnector`] is injected
//! so tests can hand out in-memory duplex streams while the proxy uses real
//! TCP connections with a startup handshake.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use sluice_core::{ConnectPolicy, Target};
use sluice_metrics::PoolCounters;

use crate::error::{ConnectError, PoolError};

/// Byte-stream transport to a backend.
pub trait BackendStream: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug {}

impl<T> BackendStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug {}

/// Boxed future alias for connector results.
pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Box<dyn BackendStream>, ConnectError>> + Send + 'a>>;

/// Opens one authenticated backend transport for a target.
pub trait BackendConnector: Send + Sync {
    fn connect<'a>(&'a self, target: &'a Target) -> ConnectFuture<'a>;
}

/// Connect with bounded attempts and exponential backoff.
///
/// Each attempt is capped by `policy.timeout`. After `policy.retries` extra
/// attempts the last failure is surfaced as [`PoolError::BackendUnavailable`].
pub async fn connect_with_retry(
    connector: &dyn BackendConnector,
    target: &Target,
    policy: &ConnectPolicy,
    counters: &PoolCounters,
) -> Result<Box<dyn BackendStream>, PoolError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.timeout, connector.connect(target)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout(policy.timeout)),
        };

        match result {
            Ok(stream) => {
                counters.record_connect();
                return Ok(stream);
            }
            Err(e) => {
                counters.record_connect_error();
                if attempt > policy.retries {
                    warn!(
                        database = %target.alias,
                        endpoint = %target.endpoint(),
                        attempts = attempt,
                        error = %e,
                        "backend connect failed, giving up"
                    );
                    return Err(PoolError::BackendUnavailable {
                        target: target.alias.clone(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    database = %target.alias,
                    endpoint = %target.endpoint(),
                    attempt,
                    retry_in = ?delay,
                    error = %e,
                    "backend connect failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory connector shared by the pool tests.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::time::Duration;

    use tokio::io::DuplexStream;

    use super::*;

    /// Hands out duplex streams and keeps the peer ends alive.
    #[derive(Default)]
    pub struct MockConnector {
        pub connects: AtomicU64,
        pub should_fail: AtomicBool,
        /// Fail this many attempts before succeeding.
        pub fail_first: AtomicU32,
        pub delay: Mutex<Option<Duration>>,
        pub peers: Mutex<Vec<DuplexStream>>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn connects(&self) -> u64 {
            self.connects.load(Ordering::SeqCst)
        }
    }

    impl BackendConnector for MockConnector {
        fn connect<'a>(&'a self, _target: &'a Target) -> ConnectFuture<'a> {
            Box::pin(async move {
                let delay = *self.delay.lock().unwrap();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if self.should_fail.load(Ordering::SeqCst) {
                    return Err(ConnectError::Rejected("connection refused".to_string()));
                }
                let remaining = self.fail_first.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.fail_first.store(remaining - 1, Ordering::SeqCst);
                    return Err(ConnectError::Rejected("not yet".to_string()));
                }
                self.connects.fetch_add(1, Ordering::SeqCst);
                let (ours, theirs) = tokio::io::duplex(1024);
                self.peers.lock().unwrap().push(theirs);
                Ok(Box::new(ours) as Box<dyn BackendStream>)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use sluice_core::{PoolLimits, PoolMode};

    use super::testing::MockConnector;
    use super::*;

    fn target() -> Target {
        Target {
            alias: "app".to_string(),
            host: "db.local".to_string(),
            port: 5432,
            dbname: "app".to_string(),
            user: "app".to_string(),
            password: "pw".to_string(),
            pool_mode: PoolMode::Transaction,
            limits: PoolLimits::new(0, 2),
        }
    }

    fn policy(retries: u32) -> ConnectPolicy {
        ConnectPolicy {
            timeout: Duration::from_millis(200),
            retries,
            backoff: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn connects_on_first_attempt() {
        let connector = MockConnector::new();
        let counters = PoolCounters::new();
        let result = connect_with_retry(&connector, &target(), &policy(3), &counters).await;
        assert!(result.is_ok());
        assert_eq!(counters.load().connects, 1);
        assert_eq!(counters.load().connect_errors, 0);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let connector = MockConnector::new();
        connector.fail_first.store(2, Ordering::SeqCst);
        let counters = PoolCounters::new();
        let result = connect_with_retry(&connector, &target(), &policy(3), &counters).await;
        assert!(result.is_ok());
        assert_eq!(counters.load().connect_errors, 2);
        assert_eq!(counters.load().connects, 1);
    }

    #[tokio::test]
    async fn gives_up_after_retry_bound() {
        let connector = MockConnector::new();
        connector.should_fail.store(true, Ordering::SeqCst);
        let counters = PoolCounters::new();
        let err = connect_with_retry(&connector, &target(), &policy(2), &counters)
            .await
            .unwrap_err();
        match err {
            PoolError::BackendUnavailable { target, attempts, reason } => {
                assert_eq!(target, "app");
                assert_eq!(attempts, 3);
                assert!(reason.contains("connection refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(counters.load().connect_errors, 3);
    }

    #[tokio::test]
    async fn slow_connect_times_out() {
        let connector = MockConnector::new();
        *connector.delay.lock().unwrap() = Some(Duration::from_secs(5));
        let counters = PoolCounters::new();
        let err = connect_with_retry(&connector, &target(), &policy(0), &counters)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
