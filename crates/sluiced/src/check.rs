//! `sluiced check`: validate a configuration without starting anything.

use std::fmt::Write;
use std::path::Path;

use anyhow::Context;

use sluice_core::Config;

/// Load and validate `path`, returning a human-readable summary.
pub fn check(path: &Path) -> anyhow::Result<String> {
    let config = Config::load(path).with_context(|| format!("{} is invalid", path.display()))?;
    Ok(summarize(&config, path))
}

fn summarize(config: &Config, path: &Path) -> String {
    let s = &config.settings;
    let mut out = String::new();
    let _ = writeln!(out, "{}: ok", path.display());
    let _ = writeln!(out, "listen {}", s.listen_addr);
    if let Some(addr) = s.metrics_addr {
        let _ = writeln!(out, "metrics {addr}");
    }
    let _ = writeln!(
        out,
        "{} user(s), {} admin(s), max_client_conn {}",
        config.users.len(),
        s.admin_users.len(),
        s.max_client_conn
    );
    for target in config.targets() {
        let l = &target.limits;
        let _ = writeln!(
            out,
            "database {} -> {} as {} ({}, size {}, min {}, reserve {}, queue {})",
            target.alias,
            target.database_key(),
            target.user,
            target.pool_mode,
            l.max_size,
            l.min_size,
            l.reserve_size,
            l.queue_capacity
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn summary_lists_each_database() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[sluice]
default_pool_size = 10
reserve_pool_size = 2

[databases.app]
host = "10.0.0.1"
user = "app"

[databases.reports]
host = "10.0.0.2"
port = 6543
dbname = "warehouse"
user = "reporter"
pool_mode = "session"
pool_size = 3
"#
        )
        .unwrap();

        let summary = check(file.path()).unwrap();
        assert!(summary.contains(": ok"));
        assert!(summary.contains(
            "database app -> 10.0.0.1:5432/app as app (transaction, size 10, min 0, reserve 2, queue 100)"
        ));
        assert!(summary.contains("database reports -> 10.0.0.2:6543/warehouse as reporter (session, size 3"));
    }

    #[test]
    fn invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[sluice]\nmax_client_conn = 0\n").unwrap();
        let err = check(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("max_client_conn"));
    }
}
