//! Session multiplexer: bridges one client's frames to leased backend
//! connections.
//!
//! # Unit of work
//!
//! ```text
//! client Query, nothing bound   → acquire(now + query_wait_timeout)
//! relay backend frames          → T / D / C / E forwarded to the client
//! backend ReadyForQuery(I)      → unit done; transaction/statement mode release Reusable
//! backend ReadyForQuery(T|F)    → keep the binding for the next request
//! ```
//!
//! A client that goes away while a backend is bound in any state other
//! than a known idle one costs that backend connection: it is released
//! Broken and destroyed. A client that goes away while queued is withdrawn
//! from the wait queue at once.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, warn};

use sluice_core::{Config, PoolMode};
use sluice_metrics::PoolCounters;
use sluice_pool::{Lease, PoolResult, ReleaseOutcome};

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{Frame, HEADER_LEN, TxStatus, read_frame, write_frame, write_frames};
use crate::state::{ClientHandle, ClientState, ProxyState};

/// Stand-in deadline when `query_wait_timeout` is zero (wait indefinitely).
const UNBOUNDED_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Why relaying one request stopped early.
#[derive(Debug)]
enum RelayError {
    /// Writing to the client failed; the client is gone.
    Client(ProxyError),
    /// The backend misbehaved, closed, or timed out.
    Backend(String),
}

/// One authenticated client connection.
pub struct Session<S> {
    client: S,
    handle: ClientHandle,
    user: String,
    database: String,
    state: Arc<ProxyState>,
    /// Bound backend, kept between requests only while a unit of work is
    /// open or in session mode.
    lease: Option<Lease>,
    backend_status: TxStatus,
    unit_started: Option<Instant>,
    /// First byte of the next frame, read while waiting for a backend.
    pending: Option<u8>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        client: S,
        handle: ClientHandle,
        user: String,
        database: String,
        state: Arc<ProxyState>,
    ) -> Self {
        Self {
            client,
            handle,
            user,
            database,
            state,
            lease: None,
            backend_status: TxStatus::Idle,
            unit_started: None,
            pending: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Serve requests until the client terminates or disconnects.
    pub async fn run(mut self) -> ProxyResult<()> {
        let result = self.serve().await;
        self.finish();
        debug!(
            session_id = self.id(),
            user = %self.user,
            database = %self.database,
            ok = result.is_ok(),
            "session ended"
        );
        result
    }

    async fn serve(&mut self) -> ProxyResult<()> {
        loop {
            let next = match self.pending.take() {
                Some(first) => {
                    let head = [first];
                    read_frame(&mut (&head[..]).chain(&mut self.client)).await?
                }
                None => read_frame(&mut self.client).await?,
            };
            let frame = match next {
                Some(frame) => frame,
                None => return Ok(()),
            };
            match frame {
                Frame::Terminate => return Ok(()),
                Frame::Query(payload) => self.handle_request(payload).await?,
                other => {
                    let msg = format!("unexpected frame {:?} from client", other.tag() as char);
                    let _ = write_frames(
                        &mut self.client,
                        &[
                            Frame::Error(msg.clone()),
                            Frame::ReadyForQuery(self.backend_status),
                        ],
                    )
                    .await;
                    return Err(ProxyError::Protocol(msg));
                }
            }
        }
    }

    /// Relay one request. An `Err` means the client is gone.
    async fn handle_request(&mut self, payload: Vec<u8>) -> ProxyResult<()> {
        let config = self.state.config();

        let mut lease = match self.lease.take() {
            Some(lease) => lease,
            None => match self.acquire(&config).await? {
                Ok(lease) => lease,
                Err(e) => {
                    self.handle.set_state(ClientState::Idle);
                    warn!(
                        session_id = self.id(),
                        database = %self.database,
                        error = %e,
                        "could not acquire backend connection"
                    );
                    write_frames(
                        &mut self.client,
                        &[
                            Frame::Error(e.to_string()),
                            Frame::ReadyForQuery(TxStatus::Idle),
                        ],
                    )
                    .await?;
                    return Ok(());
                }
            },
        };

        let counters = Arc::clone(lease.pool().counters());
        let started = Instant::now();
        self.unit_started.get_or_insert(started);

        let relay = relay(&mut self.client, &mut lease, &counters, payload);
        let query_timeout = config.settings.query_timeout;
        let result = if query_timeout.is_zero() {
            relay.await
        } else {
            match tokio::time::timeout(query_timeout, relay).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::Backend(format!(
                    "query timeout after {:.3}s",
                    query_timeout.as_secs_f64()
                ))),
            }
        };

        match result {
            Ok(status) => {
                counters.record_query(started.elapsed());
                self.complete(lease, status, &counters).await
            }
            Err(RelayError::Client(e)) => {
                debug!(
                    session_id = self.id(),
                    conn_id = lease.id(),
                    "client went away mid-request, destroying backend connection"
                );
                lease.release(ReleaseOutcome::Broken);
                self.reset_unit();
                Err(e)
            }
            Err(RelayError::Backend(msg)) => {
                warn!(
                    session_id = self.id(),
                    database = %self.database,
                    conn_id = lease.id(),
                    error = %msg,
                    "backend failure, destroying connection"
                );
                lease.release(ReleaseOutcome::Broken);
                self.reset_unit();
                write_frames(
                    &mut self.client,
                    &[Frame::Error(msg), Frame::ReadyForQuery(TxStatus::Idle)],
                )
                .await?;
                Ok(())
            }
        }
    }

    /// Wait for a backend while watching the client.
    ///
    /// The outer error means the client closed while queued; the pending
    /// acquire is dropped, which withdraws it from the wait queue.
    async fn acquire(&mut self, config: &Config) -> ProxyResult<PoolResult<Lease>> {
        let pool = match self.state.registry().require(&self.database) {
            Ok(pool) => pool,
            Err(e) => return Ok(Err(e)),
        };
        let wait = match config.settings.query_wait_timeout {
            d if d.is_zero() => UNBOUNDED_WAIT,
            d => d,
        };
        self.handle.set_state(ClientState::Waiting);

        let acquire = pool.acquire(Instant::now() + wait);
        tokio::pin!(acquire);
        let result = loop {
            let mut next = [0u8; 1];
            tokio::select! {
                biased;
                result = &mut acquire => break result,
                read = self.client.read(&mut next), if self.pending.is_none() => match read {
                    Ok(0) | Err(_) => {
                        debug!(
                            session_id = self.id(),
                            database = %self.database,
                            "client disconnected while queued"
                        );
                        return Err(ProxyError::Disconnected);
                    }
                    // First byte of the next frame; the read loop replays it.
                    Ok(_) => self.pending = Some(next[0]),
                },
            }
        };
        let lease = match result {
            Ok(lease) => lease,
            Err(e) => return Ok(Err(e)),
        };
        self.handle.set_state(ClientState::Active);
        debug!(
            session_id = self.id(),
            database = %self.database,
            conn_id = lease.id(),
            "backend bound"
        );
        Ok(Ok(lease))
    }

    /// The backend reported ReadyForQuery: decide whether the binding ends.
    async fn complete(
        &mut self,
        lease: Lease,
        status: TxStatus,
        counters: &PoolCounters,
    ) -> ProxyResult<()> {
        let mode = lease.pool().pool_mode();

        if mode == PoolMode::Statement && status != TxStatus::Idle {
            lease.release(ReleaseOutcome::Broken);
            self.reset_unit();
            write_frames(
                &mut self.client,
                &[
                    Frame::Error("units of work are not allowed in statement pool mode".into()),
                    Frame::ReadyForQuery(TxStatus::Idle),
                ],
            )
            .await?;
            return Ok(());
        }

        self.backend_status = status;
        if status == TxStatus::Idle {
            if let Some(unit_started) = self.unit_started.take() {
                counters.record_xact(unit_started.elapsed());
            }
        }

        if status == TxStatus::Idle && mode != PoolMode::Session {
            debug!(session_id = self.id(), conn_id = lease.id(), "unit of work done, releasing");
            lease.release(ReleaseOutcome::Reusable);
            self.handle.set_state(ClientState::Idle);
        } else {
            self.lease = Some(lease);
        }

        write_frame(&mut self.client, &Frame::ReadyForQuery(status)).await?;
        Ok(())
    }

    fn reset_unit(&mut self) {
        self.backend_status = TxStatus::Idle;
        self.unit_started = None;
        self.handle.set_state(ClientState::Idle);
    }

    /// Hand back whatever is still bound when the session ends.
    fn finish(&mut self) {
        if let Some(lease) = self.lease.take() {
            let outcome = if self.backend_status == TxStatus::Idle {
                ReleaseOutcome::Reusable
            } else {
                ReleaseOutcome::Broken
            };
            debug!(
                session_id = self.id(),
                conn_id = lease.id(),
                ?outcome,
                status = ?self.backend_status,
                "releasing backend at session end"
            );
            lease.release(outcome);
        }
    }
}

/// Send one request and forward responses until ReadyForQuery, which is
/// returned rather than forwarded.
async fn relay<S>(
    client: &mut S,
    lease: &mut Lease,
    counters: &PoolCounters,
    payload: Vec<u8>,
) -> Result<TxStatus, RelayError>
where
    S: AsyncWrite + Unpin + Send,
{
    let sent = write_frame(lease.stream_mut(), &Frame::Query(payload))
        .await
        .map_err(|e| RelayError::Backend(e.to_string()))?;
    lease.record_sent(sent);
    counters.record_bytes_received(sent);

    loop {
        let frame = match read_frame(lease.stream_mut()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(RelayError::Backend("backend closed the connection".into())),
            Err(e) => return Err(RelayError::Backend(e.to_string())),
        };
        match frame {
            Frame::ReadyForQuery(status) => {
                lease.record_received(HEADER_LEN + 1);
                return Ok(status);
            }
            Frame::RowDescription(_)
            | Frame::DataRow(_)
            | Frame::CommandComplete(_)
            | Frame::Error(_) => {
                let n = write_frame(client, &frame).await.map_err(RelayError::Client)?;
                lease.record_received(n);
                counters.record_bytes_sent(n);
            }
            other => {
                return Err(RelayError::Backend(format!(
                    "protocol error: unexpected frame {:?} from backend",
                    other.tag() as char
                )));
            }
        }
    }
}
