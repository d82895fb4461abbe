//! End-to-end tests: real TCP clients talk to the proxy, which pools
//! connections to an in-process mock backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use sluice_core::{Config, SecretHash};
use sluice_pool::PoolRegistry;
use sluice_proxy::{Frame, Listener, ProxyState, TcpConnector, TxStatus, read_frame, write_frame};

// ── Mock backend ───────────────────────────────────────────────────

/// Speaks just enough of the frame protocol to exercise the proxy.
///
/// `BEGIN` opens a unit of work, `COMMIT`/`ROLLBACK` close it, `CLOSE`
/// drops the connection, `BOGUS` answers with a frame a backend must not
/// send, `SLEEP <ms>` delays the answer. Anything else echoes one row.
struct MockBackend {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

async fn spawn_backend() -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_backend(stream));
        }
    });
    MockBackend { addr, connections }
}

async fn serve_backend(mut stream: TcpStream) {
    match read_frame(&mut stream).await {
        Ok(Some(Frame::Startup { password, .. })) if password == "backend-pw" => {}
        _ => {
            let _ = write_frame(&mut stream, &Frame::Error("bad backend login".into())).await;
            return;
        }
    }
    write_frame(&mut stream, &Frame::AuthOk).await.unwrap();
    write_frame(&mut stream, &Frame::ReadyForQuery(TxStatus::Idle))
        .await
        .unwrap();

    let mut status = TxStatus::Idle;
    while let Ok(Some(Frame::Query(payload))) = read_frame(&mut stream).await {
        let text = String::from_utf8(payload).unwrap();
        let upper = text.to_ascii_uppercase();
        let mut reply = Vec::new();
        if upper == "BEGIN" {
            status = TxStatus::InTransaction;
            reply.push(Frame::CommandComplete("BEGIN".into()));
        } else if upper == "COMMIT" || upper == "ROLLBACK" {
            status = TxStatus::Idle;
            reply.push(Frame::CommandComplete(upper.clone()));
        } else if upper == "CLOSE" {
            return;
        } else if upper == "BOGUS" {
            reply.push(Frame::AuthOk);
        } else if let Some(ms) = upper.strip_prefix("SLEEP ") {
            let ms: u64 = ms.trim().parse().unwrap();
            tokio::time::sleep(Duration::from_millis(ms)).await;
            reply.push(Frame::CommandComplete("SLEEP".into()));
        } else {
            reply.push(Frame::RowDescription(vec!["echo".into()]));
            reply.push(Frame::DataRow(text.into_bytes()));
            reply.push(Frame::CommandComplete("SELECT 1".into()));
        }
        reply.push(Frame::ReadyForQuery(status));
        for frame in &reply {
            if write_frame(&mut stream, frame).await.is_err() {
                return;
            }
        }
    }
}

// ── Proxy harness ──────────────────────────────────────────────────

struct Harness {
    addr: SocketAddr,
    state: Arc<ProxyState>,
    backend: MockBackend,
    _shutdown: watch::Sender<bool>,
}

async fn start(settings: &str, database: &str) -> Harness {
    let backend = spawn_backend().await;
    let toml = format!(
        r#"
[sluice]
listen_addr = "127.0.0.1:0"
admin_users = ["admin"]
connect_retries = 0
{settings}

[users]
alice = "{alice}"
admin = "{admin}"

[databases.app]
host = "127.0.0.1"
port = {port}
user = "app"
password = "backend-pw"
{database}
"#,
        alice = SecretHash::from_password("secret"),
        admin = SecretHash::from_password("admin-pw"),
        port = backend.addr.port(),
    );
    let config = Config::from_toml_str(&toml).unwrap();
    let registry = Arc::new(PoolRegistry::from_config(&config, Arc::new(TcpConnector::new())));
    let state = Arc::new(ProxyState::new(config, None, registry));

    let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), state.clone())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    tokio::spawn(listener.run(rx));

    Harness {
        addr,
        state,
        backend,
        _shutdown: tx,
    }
}

impl Harness {
    fn pool_gauges(&self) -> sluice_metrics::PoolGauges {
        self.state.registry().get("app").unwrap().gauges()
    }

    fn pool_counters(&self) -> sluice_metrics::CounterValues {
        self.state.registry().get("app").unwrap().counters().load()
    }
}

struct Client {
    stream: TcpStream,
}

impl Client {
    async fn raw(addr: SocketAddr) -> TcpStream {
        TcpStream::connect(addr).await.unwrap()
    }

    /// Log in and return the frames the proxy answered with.
    async fn login_frames(addr: SocketAddr, user: &str, database: &str, password: &str) -> (TcpStream, Vec<Frame>) {
        let mut stream = Self::raw(addr).await;
        write_frame(
            &mut stream,
            &Frame::Startup {
                user: user.into(),
                database: database.into(),
                password: password.into(),
            },
        )
        .await
        .unwrap();
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = read_frame(&mut stream).await {
            let done = matches!(frame, Frame::ReadyForQuery(_) | Frame::Error(_));
            frames.push(frame);
            if done {
                break;
            }
        }
        (stream, frames)
    }

    async fn connect(addr: SocketAddr, user: &str, database: &str, password: &str) -> Self {
        let (stream, frames) = Self::login_frames(addr, user, database, password).await;
        assert_eq!(frames, [Frame::AuthOk, Frame::ReadyForQuery(TxStatus::Idle)]);
        Self { stream }
    }

    async fn app(addr: SocketAddr) -> Self {
        Self::connect(addr, "alice", "app", "secret").await
    }

    /// Send one request and collect everything up to ReadyForQuery.
    async fn query(&mut self, text: &str) -> Vec<Frame> {
        write_frame(&mut self.stream, &Frame::query(text)).await.unwrap();
        self.reply().await
    }

    /// Collect frames up to and including ReadyForQuery.
    async fn reply(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let frame = read_frame(&mut self.stream).await.unwrap().unwrap();
            let done = matches!(frame, Frame::ReadyForQuery(_));
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    async fn terminate(mut self) {
        write_frame(&mut self.stream, &Frame::Terminate).await.unwrap();
    }
}

fn last_status(frames: &[Frame]) -> TxStatus {
    match frames.last() {
        Some(Frame::ReadyForQuery(status)) => *status,
        other => panic!("expected ReadyForQuery, got {other:?}"),
    }
}

fn error_text(frames: &[Frame]) -> Option<&str> {
    frames.iter().find_map(|f| match f {
        Frame::Error(msg) => Some(msg.as_str()),
        _ => None,
    })
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

// ── Transaction pooling ────────────────────────────────────────────

#[tokio::test]
async fn simple_request_is_relayed_and_counted() {
    let h = start("", "").await;
    let mut client = Client::app(h.addr).await;

    let frames = client.query("hello").await;
    assert_eq!(
        frames,
        [
            Frame::RowDescription(vec!["echo".into()]),
            Frame::DataRow(b"hello".to_vec()),
            Frame::CommandComplete("SELECT 1".into()),
            Frame::ReadyForQuery(TxStatus::Idle),
        ]
    );

    let counters = h.pool_counters();
    assert_eq!(counters.queries, 1);
    assert_eq!(counters.xacts, 1);
    assert!(counters.bytes_received > 0);
    assert!(counters.bytes_sent > 0);
    assert_eq!(h.pool_gauges().idle, 1);
}

#[tokio::test]
async fn unit_of_work_keeps_backend_until_commit() {
    let h = start("", "").await;
    let mut client = Client::app(h.addr).await;

    assert_eq!(last_status(&client.query("BEGIN").await), TxStatus::InTransaction);
    assert_eq!(h.pool_gauges().leased, 1);
    client.query("work").await;
    assert_eq!(h.pool_gauges().leased, 1);

    assert_eq!(last_status(&client.query("COMMIT").await), TxStatus::Idle);
    let g = h.pool_gauges();
    assert_eq!(g.leased, 0);
    assert_eq!(g.idle, 1);
    assert_eq!(h.pool_counters().xacts, 1);
}

#[tokio::test]
async fn clients_share_one_backend_between_units() {
    let h = start("", "pool_size = 1").await;
    let mut a = Client::app(h.addr).await;
    let mut b = Client::app(h.addr).await;

    for _ in 0..3 {
        assert_eq!(last_status(&a.query("x").await), TxStatus::Idle);
        assert_eq!(last_status(&b.query("y").await), TxStatus::Idle);
    }
    assert_eq!(h.backend.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn n_units_of_work_show_up_in_snapshot() {
    let h = start("", "").await;
    let mut client = Client::app(h.addr).await;
    for _ in 0..5 {
        client.query("BEGIN").await;
        client.query("work").await;
        client.query("COMMIT").await;
    }
    let snapshot = h.state.registry().snapshot();
    let app = snapshot.pool("app").unwrap();
    assert_eq!(app.counters.xacts, 5);
    assert_eq!(app.counters.queries, 15);
}

#[tokio::test]
async fn disconnect_mid_unit_destroys_backend() {
    let h = start("", "").await;
    let mut client = Client::app(h.addr).await;
    client.query("BEGIN").await;
    assert_eq!(h.pool_gauges().leased, 1);

    drop(client);
    eventually(|| h.pool_gauges().leased == 0).await;
    let g = h.pool_gauges();
    assert_eq!(g.idle, 0, "a backend with an open unit of work was reused");
    assert_eq!(h.pool_counters().disconnects, 1);
}

#[tokio::test]
async fn backend_failure_is_reported_and_session_survives() {
    let h = start("", "").await;
    let mut client = Client::app(h.addr).await;

    let frames = client.query("CLOSE").await;
    assert!(error_text(&frames).is_some());
    assert_eq!(last_status(&frames), TxStatus::Idle);
    assert_eq!(h.pool_gauges().total(), 0);

    assert_eq!(last_status(&client.query("again").await), TxStatus::Idle);
    assert_eq!(h.backend.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unexpected_backend_frame_destroys_backend() {
    let h = start("", "").await;
    let mut client = Client::app(h.addr).await;

    let frames = client.query("BOGUS").await;
    assert!(error_text(&frames).unwrap().contains("protocol error"));
    assert_eq!(h.pool_gauges().total(), 0);
}

#[tokio::test]
async fn query_timeout_destroys_slow_backend() {
    let h = start("query_timeout = 0.1", "").await;
    let mut client = Client::app(h.addr).await;

    let frames = client.query("SLEEP 1000").await;
    assert!(error_text(&frames).unwrap().contains("query timeout"));
    assert_eq!(h.pool_gauges().total(), 0);
}

// ── Admission ──────────────────────────────────────────────────────

#[tokio::test]
async fn waiting_client_gets_pool_exhausted_then_recovers() {
    let h = start("query_wait_timeout = 0.1", "pool_size = 1").await;
    let mut holder = Client::app(h.addr).await;
    let mut waiter = Client::app(h.addr).await;

    holder.query("BEGIN").await;
    let frames = waiter.query("x").await;
    assert!(error_text(&frames).unwrap().contains("pool exhausted"));
    assert_eq!(last_status(&frames), TxStatus::Idle);

    holder.query("COMMIT").await;
    assert_eq!(last_status(&waiter.query("x").await), TxStatus::Idle);
    assert_eq!(h.pool_counters().wait_timeouts, 1);
}

#[tokio::test]
async fn full_queue_reports_overloaded() {
    let h = start("max_waiting_clients = 0", "pool_size = 1").await;
    let mut holder = Client::app(h.addr).await;
    let mut other = Client::app(h.addr).await;

    holder.query("BEGIN").await;
    let frames = other.query("x").await;
    assert!(error_text(&frames).unwrap().contains("overloaded"));
    assert_eq!(h.pool_counters().overloaded, 1);
}

#[tokio::test]
async fn queued_client_is_served_on_commit() {
    let h = start("", "pool_size = 1").await;
    let mut holder = Client::app(h.addr).await;
    let mut waiter = Client::app(h.addr).await;

    holder.query("BEGIN").await;
    let pending = tokio::spawn(async move { waiter.query("queued").await });
    eventually(|| h.pool_gauges().waiting == 1).await;

    holder.query("COMMIT").await;
    let frames = pending.await.unwrap();
    assert_eq!(frames[1], Frame::DataRow(b"queued".to_vec()));
    assert_eq!(h.backend.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn queued_client_that_disconnects_leaves_the_queue() {
    let h = start("", "pool_size = 1").await;
    let mut holder = Client::app(h.addr).await;
    let mut waiter = Client::app(h.addr).await;

    holder.query("BEGIN").await;
    write_frame(&mut waiter.stream, &Frame::query("queued")).await.unwrap();
    eventually(|| h.pool_gauges().waiting == 1).await;

    drop(waiter);
    eventually(|| h.pool_gauges().waiting == 0).await;
    eventually(|| h.state.clients().len() == 1).await;

    holder.query("COMMIT").await;
    let g = h.pool_gauges();
    assert_eq!(g.idle, 1);
    assert_eq!(g.leased, 0);
    assert_eq!(h.pool_counters().disconnects, 0);
    assert_eq!(h.backend.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_sent_while_queued_is_answered_after_the_first() {
    let h = start("", "pool_size = 1").await;
    let mut holder = Client::app(h.addr).await;
    let mut waiter = Client::app(h.addr).await;

    holder.query("BEGIN").await;
    write_frame(&mut waiter.stream, &Frame::query("first")).await.unwrap();
    eventually(|| h.pool_gauges().waiting == 1).await;
    write_frame(&mut waiter.stream, &Frame::query("second")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.pool_gauges().waiting, 1);

    holder.query("COMMIT").await;
    let first = waiter.reply().await;
    let second = waiter.reply().await;
    assert_eq!(first[1], Frame::DataRow(b"first".to_vec()));
    assert_eq!(second[1], Frame::DataRow(b"second".to_vec()));
    assert_eq!(last_status(&second), TxStatus::Idle);
}

// ── Pool modes ─────────────────────────────────────────────────────

#[tokio::test]
async fn session_mode_keeps_backend_until_terminate() {
    let h = start("", "pool_mode = \"session\"").await;
    let mut client = Client::app(h.addr).await;

    client.query("x").await;
    assert_eq!(h.pool_gauges().leased, 1);
    client.query("y").await;
    assert_eq!(h.pool_gauges().leased, 1);

    client.terminate().await;
    eventually(|| h.pool_gauges().idle == 1).await;
    assert_eq!(h.pool_gauges().leased, 0);
}

#[tokio::test]
async fn statement_mode_refuses_open_units_of_work() {
    let h = start("pool_mode = \"statement\"", "").await;
    let mut client = Client::app(h.addr).await;

    assert_eq!(last_status(&client.query("x").await), TxStatus::Idle);
    let frames = client.query("BEGIN").await;
    assert!(error_text(&frames).unwrap().contains("statement pool mode"));
    assert_eq!(last_status(&frames), TxStatus::Idle);
    assert_eq!(h.pool_gauges().leased, 0);
}

// ── Login ──────────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_password_is_rejected() {
    let h = start("", "").await;
    let (_stream, frames) = Client::login_frames(h.addr, "alice", "app", "nope").await;
    assert_eq!(frames, [Frame::Error("authentication failed".into())]);
    eventually(|| h.state.registry().proxy_counters().auth_failures() == 1).await;
}

#[tokio::test]
async fn unknown_database_is_rejected() {
    let h = start("", "").await;
    let (_stream, frames) = Client::login_frames(h.addr, "alice", "missing", "secret").await;
    assert!(error_text(&frames).unwrap().contains("unknown database"));
}

#[tokio::test]
async fn client_limit_rejects_extra_connections() {
    let h = start("max_client_conn = 1", "").await;
    let _first = Client::app(h.addr).await;

    let mut second = Client::raw(h.addr).await;
    let frame = read_frame(&mut second).await.unwrap();
    assert_eq!(frame, Some(Frame::Error("too many client connections".into())));
    eventually(|| h.state.registry().proxy_counters().clients_rejected() == 1).await;
}

#[tokio::test]
async fn silent_client_hits_login_timeout() {
    let h = start("client_login_timeout = 0.1", "").await;
    let mut stream = Client::raw(h.addr).await;
    let frame = read_frame(&mut stream).await.unwrap();
    assert_eq!(frame, Some(Frame::Error("login timeout".into())));
}

// ── Admin console ──────────────────────────────────────────────────

#[tokio::test]
async fn admin_console_shows_pools() {
    let h = start("", "").await;
    let mut app = Client::app(h.addr).await;
    app.query("warm").await;

    let mut admin = Client::connect(h.addr, "admin", "sluice", "admin-pw").await;
    let frames = admin.query("SHOW POOLS;").await;
    assert!(matches!(&frames[0], Frame::RowDescription(cols) if cols[0] == "database"));
    let Frame::DataRow(row) = &frames[1] else {
        panic!("expected a data row, got {:?}", frames[1]);
    };
    let row = String::from_utf8(row.clone()).unwrap();
    assert!(row.starts_with("app\tapp\t"));
    assert_eq!(frames[frames.len() - 2], Frame::CommandComplete("SHOW".into()));
}

#[tokio::test]
async fn admin_pause_holds_requests_until_resume() {
    let h = start("", "").await;
    let mut admin = Client::connect(h.addr, "admin", "sluice", "admin-pw").await;
    let mut app = Client::app(h.addr).await;

    admin.query("PAUSE app").await;
    let pending = tokio::spawn(async move { app.query("later").await });
    eventually(|| h.pool_gauges().waiting == 1).await;

    let frames = admin.query("RESUME").await;
    assert_eq!(frames[0], Frame::CommandComplete("RESUME".into()));
    let frames = pending.await.unwrap();
    assert_eq!(last_status(&frames), TxStatus::Idle);
}

#[tokio::test]
async fn non_admin_user_cannot_open_console() {
    let h = start("", "").await;
    let (_stream, frames) = Client::login_frames(h.addr, "alice", "sluice", "secret").await;
    assert!(error_text(&frames).unwrap().contains("admin console"));
}

#[tokio::test]
async fn unknown_admin_command_keeps_console_open() {
    let h = start("", "").await;
    let mut admin = Client::connect(h.addr, "admin", "sluice", "admin-pw").await;
    let frames = admin.query("SHOW TABLES").await;
    assert!(error_text(&frames).unwrap().contains("unknown admin command"));
    let frames = admin.query("SHOW VERSION").await;
    assert!(matches!(&frames[1], Frame::DataRow(v) if v.starts_with(b"sluice ")));
}
