//! Client listener and login handshake.
//!
//! # Login
//!
//! ```text
//! accept          → over max_client_conn? ErrorResponse + close
//! Startup frame   → within client_login_timeout
//! credentials     → mismatch: ErrorResponse("authentication failed") + close
//! admin database  → admin console (admin users only)
//! pool database   → AuthenticationOk, ReadyForQuery(Idle), session
//! ```
//!
//! The listener never touches a pool; sessions acquire on first request.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use sluice_pool::PoolError;

use crate::admin::run_admin_session;
use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{Frame, TxStatus, read_frame, write_frame, write_frames};
use crate::session::Session;
use crate::state::{ClientState, ProxyState};

/// Accepts client connections and spawns one task per session.
pub struct Listener {
    inner: TcpListener,
    state: Arc<ProxyState>,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, state: Arc<ProxyState>) -> ProxyResult<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner, state })
    }

    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept until `shutdown` flips. Running sessions are left to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.inner.local_addr() {
            info!(%addr, "accepting client connections");
        }
        loop {
            tokio::select! {
                accepted = self.inner.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(stream, addr),
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                },
                _ = shutdown.changed() => {
                    info!("listener shutting down");
                    break;
                }
            }
        }
    }

    fn admit(&self, mut stream: TcpStream, addr: SocketAddr) {
        let config = self.state.config();
        let counters = self.state.registry().proxy_counters();

        if counters.clients_active() >= config.settings.max_client_conn {
            counters.record_rejected();
            warn!(
                client = %addr,
                max_client_conn = config.settings.max_client_conn,
                "rejecting client: too many client connections"
            );
            tokio::spawn(async move {
                let _ = write_frame(
                    &mut stream,
                    &Frame::Error("too many client connections".into()),
                )
                .await;
                let _ = stream.shutdown().await;
            });
            return;
        }

        let _ = stream.set_nodelay(true);
        let guard = counters.client_connected();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = handle_client(stream, addr, state).await {
                debug!(client = %addr, error = %e, "client connection ended with error");
            }
        });
    }
}

/// Run the login handshake on an accepted stream, then serve it.
pub async fn handle_client<S>(mut stream: S, addr: SocketAddr, state: Arc<ProxyState>) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let config = state.config();
    let counters = state.registry().proxy_counters();

    let login = tokio::time::timeout(config.settings.client_login_timeout, read_frame(&mut stream));
    let (user, database, password) = match login.await {
        Ok(Ok(Some(Frame::Startup {
            user,
            database,
            password,
        }))) => (user, database, password),
        Ok(Ok(Some(other))) => {
            let msg = format!("expected startup frame, got {:?}", other.tag() as char);
            reject(&mut stream, &msg).await;
            return Err(ProxyError::Protocol(msg));
        }
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => {
            reject(&mut stream, &e.to_string()).await;
            return Err(e);
        }
        Err(_) => {
            reject(&mut stream, "login timeout").await;
            return Err(ProxyError::Auth(format!("{addr}: login timeout")));
        }
    };

    if let Err(e) = state.credentials().verify(&user, &password) {
        counters.record_auth_failure();
        warn!(client = %addr, user = %user, error = %e, "authentication failed");
        reject(&mut stream, "authentication failed").await;
        return Err(e);
    }

    if database == config.settings.admin_database {
        if !config.is_admin(&user) {
            counters.record_auth_failure();
            warn!(client = %addr, user = %user, "non-admin user refused on admin console");
            reject(&mut stream, "not allowed to connect to the admin console").await;
            return Err(ProxyError::Auth(format!("{user} is not an admin user")));
        }
        write_frames(&mut stream, &[Frame::AuthOk, Frame::ReadyForQuery(TxStatus::Idle)]).await?;
        let handle = state.register_client(&user, &database, addr, ClientState::Admin);
        info!(session_id = handle.id(), client = %addr, user = %user, "admin console login");
        return run_admin_session(stream, handle, state).await;
    }

    if state.registry().get(&database).is_none() {
        reject(&mut stream, &format!("unknown database \"{database}\"")).await;
        return Err(PoolError::UnknownTarget(database).into());
    }

    write_frames(&mut stream, &[Frame::AuthOk, Frame::ReadyForQuery(TxStatus::Idle)]).await?;
    let handle = state.register_client(&user, &database, addr, ClientState::Idle);
    info!(
        session_id = handle.id(),
        client = %addr,
        user = %user,
        database = %database,
        "client logged in"
    );
    Session::new(stream, handle, user, database, state).run().await
}

async fn reject<S>(stream: &mut S, msg: &str)
where
    S: AsyncWrite + Unpin + Send,
{
    let _ = write_frame(stream, &Frame::Error(msg.to_string())).await;
    let _ = stream.shutdown().await;
}
