//! Process assembly: binds sockets, runs background tasks, shuts down.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use sluice_core::Config;
use sluice_pool::PoolRegistry;
use sluice_proxy::{Listener, ProxyState, TcpConnector};

/// A configured proxy with its sockets bound, not yet serving.
pub struct Daemon {
    state: Arc<ProxyState>,
    listener: Listener,
    metrics: Option<TcpListener>,
}

impl Daemon {
    /// Build the registry and bind the client and metrics sockets.
    pub async fn start(config: Config, config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let listen_addr = config.settings.listen_addr;
        let metrics_addr = config.settings.metrics_addr;

        let registry = Arc::new(PoolRegistry::from_config(&config, Arc::new(TcpConnector::new())));
        info!(pools = registry.aliases().len(), "pool registry initialized");

        let state = Arc::new(ProxyState::new(config, config_path, registry));
        let listener = Listener::bind(listen_addr, state.clone())
            .await
            .with_context(|| format!("binding client listener on {listen_addr}"))?;
        let metrics = match metrics_addr {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("binding metrics endpoint on {addr}"))?,
            ),
            None => None,
        };

        Ok(Self {
            state,
            listener,
            metrics,
        })
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    pub fn client_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Serve until `shutdown` flips, then close every pool and wait for
    /// the background tasks.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let Daemon {
            state,
            listener,
            metrics,
        } = self;
        let registry = state.registry().clone();
        let config = state.config();

        let warmed = registry.warm_up().await;
        if warmed > 0 {
            info!(connections = warmed, "pools warmed to min_pool_size");
        }

        // ── Background tasks ───────────────────────────────────

        let maintenance = {
            let registry = registry.clone();
            let sweep_interval = config.settings.sweep_interval;
            let stats_period = config.settings.stats_period;
            let rx = shutdown.clone();
            tokio::spawn(async move {
                registry.run_maintenance(sweep_interval, stats_period, rx).await;
            })
        };

        let accept = tokio::spawn(listener.run(shutdown.clone()));

        let http = metrics.map(|l| {
            let router = sluice_api::build_router(registry.clone());
            let rx = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = sluice_api::serve(l, router, rx).await {
                    error!(error = %e, "metrics endpoint failed");
                }
            })
        });

        let reload = tokio::spawn(reload_on_hangup(state.clone(), shutdown.clone()));

        info!("sluice ready");
        let _ = shutdown.changed().await;

        // ── Shutdown ───────────────────────────────────────────

        info!("closing pools");
        registry.close_all();

        let _ = accept.await;
        let _ = maintenance.await;
        let _ = reload.await;
        if let Some(http) = http {
            let _ = http.await;
        }

        info!("sluice stopped");
        Ok(())
    }
}

/// Reload the configuration file on SIGHUP.
#[cfg(unix)]
async fn reload_on_hangup(state: Arc<ProxyState>, mut shutdown: watch::Receiver<bool>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!(error = %e, "SIGHUP reload disabled");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = hangup.recv() => match state.reload().await {
                Ok(report) => info!(?report, "configuration reloaded on SIGHUP"),
                Err(e) => warn!(error = %e, "reload failed, keeping current configuration"),
            },
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_state: Arc<ProxyState>, mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.changed().await;
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use sluice_core::SecretHash;
    use sluice_proxy::{Frame, TxStatus, read_frame, write_frame};

    use super::*;

    fn config() -> Config {
        let toml = format!(
            r#"
[sluice]
listen_addr = "127.0.0.1:0"
metrics_addr = "127.0.0.1:0"
admin_users = ["admin"]

[users]
admin = "{}"

[databases.app]
host = "127.0.0.1"
port = 1
user = "app"
"#,
            SecretHash::from_password("pw")
        );
        Config::from_toml_str(&toml).unwrap()
    }

    async fn admin_login(addr: SocketAddr) -> TcpStream {
        let mut admin = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut admin,
            &Frame::Startup {
                user: "admin".into(),
                database: "sluice".into(),
                password: "pw".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(read_frame(&mut admin).await.unwrap(), Some(Frame::AuthOk));
        assert_eq!(
            read_frame(&mut admin).await.unwrap(),
            Some(Frame::ReadyForQuery(TxStatus::Idle))
        );
        admin
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        body
    }

    #[tokio::test]
    async fn serves_clients_and_metrics_then_stops() {
        let daemon = Daemon::start(config(), None).await.unwrap();
        let client_addr = daemon.client_addr().unwrap();
        let metrics_addr = daemon.metrics_addr().unwrap();
        let state = daemon.state().clone();

        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(daemon.run(rx));

        // Admin console works without any backend.
        let _admin = admin_login(client_addr).await;

        let response = http_get(metrics_addr, "/healthz").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"pools\":1"));

        let response = http_get(metrics_addr, "/metrics").await;
        assert!(response.contains("sluice_clients_active 1"));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(state.registry().get("app").unwrap().is_closed());
    }

    #[tokio::test]
    async fn admin_reload_rereads_the_config_file() {
        let toml = format!(
            r#"
[sluice]
listen_addr = "127.0.0.1:0"
admin_users = ["admin"]

[users]
admin = "{}"

[databases.app]
host = "127.0.0.1"
port = 1
user = "app"
"#,
            SecretHash::from_password("pw")
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();

        let daemon = Daemon::start(config, Some(file.path().to_path_buf()))
            .await
            .unwrap();
        let client_addr = daemon.client_addr().unwrap();
        let state = daemon.state().clone();
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(daemon.run(rx));

        write!(file, "\n[databases.reports]\nhost = \"127.0.0.1\"\nport = 1\nuser = \"r\"\n").unwrap();
        file.flush().unwrap();

        let mut admin = admin_login(client_addr).await;
        write_frame(&mut admin, &Frame::query("RELOAD")).await.unwrap();
        let mut frames = Vec::new();
        loop {
            let frame = read_frame(&mut admin).await.unwrap().unwrap();
            let done = matches!(frame, Frame::ReadyForQuery(_));
            frames.push(frame);
            if done {
                break;
            }
        }
        assert!(frames.contains(&Frame::CommandComplete("RELOAD".into())));
        assert!(state.registry().get("reports").is_some());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn start_fails_when_listen_addr_is_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = config();
        cfg.settings.listen_addr = taken.local_addr().unwrap();
        cfg.settings.metrics_addr = None;

        let err = Daemon::start(cfg, None).await.err().unwrap();
        assert!(format!("{err:#}").contains("binding client listener"));
    }
}
