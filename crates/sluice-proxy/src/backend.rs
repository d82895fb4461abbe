//! TCP connector for real backends.
//!
//! # Startup handshake
//!
//! ```text
//! proxy   → backend : Startup{user, dbname, password}
//! backend → proxy   : AuthenticationOk
//! backend → proxy   : ReadyForQuery(Idle)
//! ```
//!
//! An `ErrorResponse` at either step is a rejection; anything else is a
//! protocol error. Both count as a failed connect attempt and are retried
//! by the pool.

use tokio::net::TcpStream;
use tracing::debug;

use sluice_core::Target;
use sluice_pool::{BackendConnector, BackendStream, ConnectError, ConnectFuture};

use crate::error::ProxyError;
use crate::protocol::{Frame, TxStatus, read_frame, write_frame};

/// Opens plain TCP connections and performs the startup handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

impl BackendConnector for TcpConnector {
    fn connect<'a>(&'a self, target: &'a Target) -> ConnectFuture<'a> {
        Box::pin(async move {
            let mut stream = TcpStream::connect(target.endpoint()).await?;
            stream.set_nodelay(true)?;
            handshake(&mut stream, target).await?;
            debug!(
                database = %target.alias,
                endpoint = %target.endpoint(),
                "backend handshake complete"
            );
            Ok(Box::new(stream) as Box<dyn BackendStream>)
        })
    }
}

/// Authenticate on a freshly opened transport.
pub async fn handshake<S>(stream: &mut S, target: &Target) -> Result<(), ConnectError>
where
    S: BackendStream + ?Sized,
{
    let startup = Frame::Startup {
        user: target.user.clone(),
        database: target.dbname.clone(),
        password: target.password.clone(),
    };
    write_frame(stream, &startup).await.map_err(connect_error)?;

    match read_frame(stream).await.map_err(connect_error)? {
        Some(Frame::AuthOk) => {}
        Some(Frame::Error(msg)) => return Err(ConnectError::Rejected(msg)),
        Some(other) => {
            return Err(ConnectError::Protocol(format!(
                "expected authentication ok, got {:?}",
                other.tag() as char
            )));
        }
        None => return Err(ConnectError::Protocol("backend closed during startup".into())),
    }

    match read_frame(stream).await.map_err(connect_error)? {
        Some(Frame::ReadyForQuery(TxStatus::Idle)) => Ok(()),
        Some(Frame::Error(msg)) => Err(ConnectError::Rejected(msg)),
        Some(other) => Err(ConnectError::Protocol(format!(
            "expected ready-for-query idle, got {other:?}"
        ))),
        None => Err(ConnectError::Protocol("backend closed during startup".into())),
    }
}

fn connect_error(e: ProxyError) -> ConnectError {
    match e {
        ProxyError::Io(e) => ConnectError::Io(e),
        other => ConnectError::Protocol(other.to_string()),
    }
}
