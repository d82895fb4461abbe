//! Admin console.
//!
//! Reached by logging in to the configured admin database as one of the
//! admin users. Each request is one command; the answer is a table sent as
//! a row description, data rows, a command tag and `ReadyForQuery`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{Frame, TxStatus, read_frame, write_frames};
use crate::state::{ClientHandle, ClientState, ProxyState};

/// A parsed admin command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminCommand {
    ShowPools,
    ShowStats,
    ShowConfig,
    ShowDatabases,
    ShowClients,
    ShowLists,
    ShowVersion,
    Reload,
    /// Pause one database, or all of them.
    Pause(Option<String>),
    Resume(Option<String>),
}

impl FromStr for AdminCommand {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().trim_end_matches(';').trim();
        let words: Vec<&str> = text.split_whitespace().collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
        let upper: Vec<&str> = upper.iter().map(String::as_str).collect();

        let cmd = match upper.as_slice() {
            ["SHOW", "POOLS"] => AdminCommand::ShowPools,
            ["SHOW", "STATS"] => AdminCommand::ShowStats,
            ["SHOW", "CONFIG"] => AdminCommand::ShowConfig,
            ["SHOW", "DATABASES"] => AdminCommand::ShowDatabases,
            ["SHOW", "CLIENTS"] => AdminCommand::ShowClients,
            ["SHOW", "LISTS"] => AdminCommand::ShowLists,
            ["SHOW", "VERSION"] => AdminCommand::ShowVersion,
            ["RELOAD"] => AdminCommand::Reload,
            ["PAUSE"] => AdminCommand::Pause(None),
            ["PAUSE", _] => AdminCommand::Pause(Some(words[1].to_string())),
            ["RESUME"] => AdminCommand::Resume(None),
            ["RESUME", _] => AdminCommand::Resume(Some(words[1].to_string())),
            [] => return Err(ProxyError::protocol("empty admin command")),
            _ => {
                return Err(ProxyError::Protocol(format!(
                    "unknown admin command: {text}"
                )));
            }
        };
        Ok(cmd)
    }
}

/// Tabular answer to an admin command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdminResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Command-complete tag.
    pub tag: String,
}

impl AdminResult {
    fn table(columns: &[&str], rows: Vec<Vec<String>>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            tag: "SHOW".to_string(),
        }
    }

    fn done(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Self::default()
        }
    }

    /// Value at `column` in `row`, for assertions and scripting.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(index).map(String::as_str)
    }

    pub fn into_frames(self) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(self.rows.len() + 3);
        if !self.columns.is_empty() {
            frames.push(Frame::RowDescription(self.columns));
        }
        for row in &self.rows {
            frames.push(Frame::text_row(row));
        }
        frames.push(Frame::CommandComplete(self.tag));
        frames.push(Frame::ReadyForQuery(TxStatus::Idle));
        frames
    }
}

impl fmt::Display for AdminResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.columns.is_empty() {
            writeln!(f, "{}", self.columns.join("\t"))?;
        }
        for row in &self.rows {
            writeln!(f, "{}", row.join("\t"))?;
        }
        write!(f, "{}", self.tag)
    }
}

/// Run one command against the proxy state.
pub async fn execute(cmd: &AdminCommand, state: &ProxyState) -> ProxyResult<AdminResult> {
    let registry = state.registry();
    let result = match cmd {
        AdminCommand::ShowPools => {
            let rows = registry
                .snapshot()
                .pools
                .into_iter()
                .map(|p| {
                    vec![
                        p.database.clone(),
                        p.user,
                        state
                            .count_clients(&p.database, ClientState::Active)
                            .to_string(),
                        p.gauges.waiting.to_string(),
                        p.gauges.leased.to_string(),
                        p.gauges.idle.to_string(),
                        p.gauges.connecting.to_string(),
                        p.gauges.max_wait_ms.to_string(),
                        p.pool_mode,
                        p.paused.to_string(),
                    ]
                })
                .collect();
            AdminResult::table(
                &[
                    "database",
                    "user",
                    "cl_active",
                    "cl_waiting",
                    "sv_active",
                    "sv_idle",
                    "sv_connecting",
                    "maxwait_ms",
                    "pool_mode",
                    "paused",
                ],
                rows,
            )
        }
        AdminCommand::ShowStats => {
            let rows = registry
                .snapshot()
                .pools
                .into_iter()
                .map(|p| {
                    let c = p.counters;
                    vec![
                        p.database,
                        c.xacts.to_string(),
                        c.queries.to_string(),
                        c.bytes_received.to_string(),
                        c.bytes_sent.to_string(),
                        c.xact_time_us.to_string(),
                        c.query_time_us.to_string(),
                        c.wait_time_us.to_string(),
                        c.waits.to_string(),
                        c.wait_timeouts.to_string(),
                        c.overloaded.to_string(),
                        c.connects.to_string(),
                        c.connect_errors.to_string(),
                        c.disconnects.to_string(),
                    ]
                })
                .collect();
            AdminResult::table(
                &[
                    "database",
                    "total_xact_count",
                    "total_query_count",
                    "total_received",
                    "total_sent",
                    "total_xact_time_us",
                    "total_query_time_us",
                    "total_wait_time_us",
                    "total_wait_count",
                    "total_wait_timeouts",
                    "total_overloaded",
                    "total_server_connects",
                    "total_connect_errors",
                    "total_server_disconnects",
                ],
                rows,
            )
        }
        AdminCommand::ShowConfig => {
            let rows = state
                .config()
                .settings_rows()
                .into_iter()
                .map(|(key, value)| vec![key, value])
                .collect();
            AdminResult::table(&["key", "value"], rows)
        }
        AdminCommand::ShowDatabases => {
            let rows = state
                .config()
                .targets()
                .into_iter()
                .map(|t| {
                    vec![
                        t.alias,
                        t.host,
                        t.port.to_string(),
                        t.dbname,
                        t.user,
                        t.limits.max_size.to_string(),
                        t.limits.min_size.to_string(),
                        t.limits.reserve_size.to_string(),
                        t.pool_mode.to_string(),
                    ]
                })
                .collect();
            AdminResult::table(
                &[
                    "name",
                    "host",
                    "port",
                    "database",
                    "user",
                    "pool_size",
                    "min_pool_size",
                    "reserve_pool",
                    "pool_mode",
                ],
                rows,
            )
        }
        AdminCommand::ShowClients => {
            let rows = state
                .clients()
                .into_iter()
                .map(|c| {
                    vec![
                        c.id.to_string(),
                        c.user,
                        c.database,
                        c.addr.to_string(),
                        c.state.to_string(),
                        format!("{:.3}", c.connected_at.elapsed().as_secs_f64()),
                    ]
                })
                .collect();
            AdminResult::table(
                &["id", "user", "database", "addr", "state", "connected_secs"],
                rows,
            )
        }
        AdminCommand::ShowLists => {
            let config = state.config();
            let snapshot = registry.snapshot();
            let gauges = snapshot.total_gauges();
            let clients = state.clients();
            let count = |s: ClientState| clients.iter().filter(|c| c.state == s).count();
            let rows = [
                ("databases", config.databases.len()),
                ("users", config.users.len()),
                ("pools", snapshot.pools.len()),
                ("used_clients", count(ClientState::Active)),
                ("idle_clients", count(ClientState::Idle)),
                ("waiting_clients", count(ClientState::Waiting)),
                ("admin_clients", count(ClientState::Admin)),
                ("used_servers", gauges.leased),
                ("idle_servers", gauges.idle),
                ("connecting_servers", gauges.connecting),
            ]
            .into_iter()
            .map(|(name, n)| vec![name.to_string(), n.to_string()])
            .collect();
            AdminResult::table(&["list", "items"], rows)
        }
        AdminCommand::ShowVersion => AdminResult::table(
            &["version"],
            vec![vec![format!("sluice {}", env!("CARGO_PKG_VERSION"))]],
        ),
        AdminCommand::Reload => {
            let report = state.reload().await?;
            let mut rows = Vec::new();
            for (change, names) in [
                ("added", report.added),
                ("removed", report.removed),
                ("replaced", report.replaced),
                ("updated", report.updated),
            ] {
                rows.extend(names.into_iter().map(|n| vec![change.to_string(), n]));
            }
            AdminResult {
                tag: "RELOAD".to_string(),
                ..AdminResult::table(&["change", "database"], rows)
            }
        }
        AdminCommand::Pause(db) => {
            registry.pause(db.as_deref())?;
            AdminResult::done("PAUSE")
        }
        AdminCommand::Resume(db) => {
            registry.resume(db.as_deref())?;
            AdminResult::done("RESUME")
        }
    };
    Ok(result)
}

/// Serve an admin console session until the client leaves.
pub async fn run_admin_session<S>(
    mut client: S,
    handle: ClientHandle,
    state: Arc<ProxyState>,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let frame = match read_frame(&mut client).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        let payload = match frame {
            Frame::Terminate => return Ok(()),
            Frame::Query(payload) => payload,
            other => {
                let msg = format!("unexpected frame {:?} on admin console", other.tag() as char);
                let _ = write_frames(
                    &mut client,
                    &[Frame::Error(msg.clone()), Frame::ReadyForQuery(TxStatus::Idle)],
                )
                .await;
                return Err(ProxyError::Protocol(msg));
            }
        };

        let parsed = String::from_utf8(payload)
            .map_err(|_| ProxyError::protocol("admin command is not UTF-8"))
            .and_then(|text| text.parse::<AdminCommand>());
        let outcome = match parsed {
            Ok(cmd) => {
                info!(session_id = handle.id(), command = ?cmd, "admin command");
                execute(&cmd, &state).await
            }
            Err(e) => Err(e),
        };

        let frames = match outcome {
            Ok(result) => result.into_frames(),
            Err(e) => {
                warn!(session_id = handle.id(), error = %e, "admin command failed");
                vec![Frame::Error(e.to_string()), Frame::ReadyForQuery(TxStatus::Idle)]
            }
        };
        write_frames(&mut client, &frames).await?;
    }
}
