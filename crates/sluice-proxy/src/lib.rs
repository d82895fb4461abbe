//! sluice-proxy — the client-facing side of Sluice.
//!
//! # Architecture
//!
//! ```text
//! TCP client ─► Listener (max_client_conn, login timeout, auth)
//!                 ├─ admin database ─► admin console (SHOW / RELOAD / PAUSE / RESUME)
//!                 └─ pool database  ─► Session ─► PoolRegistry ─► Pool ─► backend
//! ```
//!
//! Backend connections are opened by [`TcpConnector`], which performs the
//! startup handshake before the pool ever sees the stream.

pub mod admin;
pub mod auth;
pub mod backend;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod session;
pub mod state;

pub use admin::{AdminCommand, AdminResult, execute, run_admin_session};
pub use auth::CredentialStore;
pub use backend::TcpConnector;
pub use error::{ProxyError, ProxyResult};
pub use listener::{Listener, handle_client};
pub use protocol::{Frame, TxStatus, read_frame, write_frame, write_frames};
pub use session::Session;
pub use state::{ClientHandle, ClientInfo, ClientState, ProxyState};
