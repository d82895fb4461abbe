//! Prometheus text exposition format.
//!
//! Renders a [`StatsSnapshot`] for scraping by a Prometheus server or a
//! compatible agent. Metric names are stable; cumulative series are typed
//! `counter`, live pool state is typed `gauge`.

use std::fmt::Write;

use crate::counters::CounterValues;
use crate::snapshot::{PoolGauges, StatsSnapshot};

type CounterField = fn(&CounterValues) -> u64;
type GaugeField = fn(&PoolGauges) -> u64;

const POOL_COUNTERS: &[(&str, &str, CounterField)] = &[
    ("sluice_acquires_total", "Backend connections handed to clients.", |c| c.acquires),
    ("sluice_waits_total", "Requests that entered the wait queue.", |c| c.waits),
    ("sluice_wait_timeouts_total", "Queued requests that hit their deadline.", |c| c.wait_timeouts),
    ("sluice_overloaded_total", "Requests rejected because the wait queue was full.", |c| c.overloaded),
    ("sluice_server_connects_total", "Backend connections opened.", |c| c.connects),
    ("sluice_server_connect_errors_total", "Failed backend connect attempts.", |c| c.connect_errors),
    ("sluice_server_disconnects_total", "Backend connections closed.", |c| c.disconnects),
    ("sluice_queries_total", "Requests relayed to the backend.", |c| c.queries),
    ("sluice_xacts_total", "Completed units of work.", |c| c.xacts),
    ("sluice_received_bytes_total", "Bytes received from clients.", |c| c.bytes_received),
    ("sluice_sent_bytes_total", "Bytes sent to clients.", |c| c.bytes_sent),
    ("sluice_wait_time_microseconds_total", "Time clients spent waiting for a connection.", |c| c.wait_time_us),
    ("sluice_xact_time_microseconds_total", "Time spent inside units of work.", |c| c.xact_time_us),
    ("sluice_query_time_microseconds_total", "Time spent waiting for backend responses.", |c| c.query_time_us),
];

const POOL_GAUGES: &[(&str, &str, GaugeField)] = &[
    ("sluice_pool_idle_connections", "Idle backend connections.", |g| g.idle as u64),
    ("sluice_pool_leased_connections", "Backend connections leased to clients.", |g| g.leased as u64),
    ("sluice_pool_connecting_connections", "Backend connects in flight.", |g| g.connecting as u64),
    ("sluice_pool_waiting_clients", "Requests queued for a connection.", |g| g.waiting as u64),
    ("sluice_pool_max_wait_milliseconds", "Age of the oldest queued request.", |g| g.max_wait_ms),
    ("sluice_pool_max_size", "Configured maximum pool size.", |g| g.max_size as u64),
];

/// Render a stats snapshot into Prometheus text format.
pub fn render_prometheus(snapshot: &StatsSnapshot) -> String {
    let mut out = String::new();

    for (name, help, field) in POOL_GAUGES {
        header(&mut out, name, help, "gauge");
        for p in &snapshot.pools {
            let _ = writeln!(
                out,
                "{name}{{database=\"{}\"}} {}",
                escape(&p.database),
                field(&p.gauges)
            );
        }
    }

    header(&mut out, "sluice_pool_paused", "Whether the pool is paused (0 or 1).", "gauge");
    for p in &snapshot.pools {
        let _ = writeln!(
            out,
            "sluice_pool_paused{{database=\"{}\"}} {}",
            escape(&p.database),
            u8::from(p.paused)
        );
    }

    for (name, help, field) in POOL_COUNTERS {
        header(&mut out, name, help, "counter");
        for p in &snapshot.pools {
            let _ = writeln!(
                out,
                "{name}{{database=\"{}\"}} {}",
                escape(&p.database),
                field(&p.counters)
            );
        }
    }

    let proxy = &snapshot.proxy;
    header(&mut out, "sluice_clients_active", "Connected client sessions.", "gauge");
    let _ = writeln!(out, "sluice_clients_active {}", proxy.clients_active);
    header(&mut out, "sluice_clients_accepted_total", "Client connections accepted.", "counter");
    let _ = writeln!(out, "sluice_clients_accepted_total {}", proxy.clients_accepted);
    header(&mut out, "sluice_clients_rejected_total", "Client connections rejected at max_client_conn.", "counter");
    let _ = writeln!(out, "sluice_clients_rejected_total {}", proxy.clients_rejected);
    header(&mut out, "sluice_auth_failures_total", "Failed client authentications.", "counter");
    let _ = writeln!(out, "sluice_auth_failures_total {}", proxy.auth_failures);
    header(&mut out, "sluice_uptime_seconds", "Seconds since the proxy started.", "gauge");
    let _ = writeln!(out, "sluice_uptime_seconds {:.3}", snapshot.uptime_secs);

    out
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

/// Escape a label value per the exposition format.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{PoolSnapshot, ProxySnapshot};

    fn test_snapshot(database: &str) -> StatsSnapshot {
        StatsSnapshot {
            taken_at_ms: 1_000,
            uptime_secs: 12.0,
            pools: vec![PoolSnapshot {
                database: database.to_string(),
                user: "app".to_string(),
                pool_mode: "transaction".to_string(),
                paused: false,
                gauges: PoolGauges {
                    idle: 3,
                    leased: 2,
                    waiting: 1,
                    max_size: 5,
                    ..PoolGauges::default()
                },
                counters: CounterValues {
                    xacts: 42,
                    bytes_sent: 1024,
                    ..CounterValues::default()
                },
            }],
            proxy: ProxySnapshot {
                clients_active: 7,
                clients_accepted: 9,
                ..ProxySnapshot::default()
            },
        }
    }

    #[test]
    fn render_empty() {
        let snapshot = StatsSnapshot {
            taken_at_ms: 0,
            uptime_secs: 0.0,
            pools: vec![],
            proxy: ProxySnapshot::default(),
        };
        let output = render_prometheus(&snapshot);
        // Type declarations are emitted even without pools.
        assert!(output.contains("# HELP sluice_xacts_total"));
        assert!(output.contains("# TYPE sluice_xacts_total counter"));
        assert!(output.contains("sluice_clients_active 0"));
    }

    #[test]
    fn render_single_pool() {
        let output = render_prometheus(&test_snapshot("app"));
        assert!(output.contains("sluice_pool_idle_connections{database=\"app\"} 3"));
        assert!(output.contains("sluice_pool_leased_connections{database=\"app\"} 2"));
        assert!(output.contains("sluice_pool_waiting_clients{database=\"app\"} 1"));
        assert!(output.contains("sluice_xacts_total{database=\"app\"} 42"));
        assert!(output.contains("sluice_sent_bytes_total{database=\"app\"} 1024"));
        assert!(output.contains("sluice_pool_paused{database=\"app\"} 0"));
        assert!(output.contains("sluice_clients_active 7"));
        assert!(output.contains("sluice_clients_accepted_total 9"));
    }

    #[test]
    fn gauges_and_counters_are_typed() {
        let output = render_prometheus(&test_snapshot("app"));
        assert!(output.contains("# TYPE sluice_pool_idle_connections gauge"));
        assert!(output.contains("# TYPE sluice_queries_total counter"));
    }

    #[test]
    fn label_values_are_escaped() {
        let output = render_prometheus(&test_snapshot("we\"ird"));
        assert!(output.contains("database=\"we\\\"ird\""));
    }

    #[test]
    fn every_sample_line_has_a_value() {
        let output = render_prometheus(&test_snapshot("app"));
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let value = line.rsplit(' ').next().unwrap();
            assert!(value.parse::<f64>().is_ok(), "bad sample line: {line}");
        }
    }
}
