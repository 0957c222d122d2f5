// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tracing setup for the supervisor binary.
//!
//! Foreground modes log to stderr only. Supervise mode additionally
//! writes `log/reefd.log` through a non-blocking appender, rotating at
//! startup when the previous incarnation left an oversized file, and
//! stamps a pid-bearing startup marker so operators can find where the
//! current attempt begins.

use std::io::Write;
use std::path::Path;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

/// Maximum log file size before startup rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files to keep.
const MAX_ROTATED_LOGS: u32 = 3;

/// Startup marker prefix; full format `--- reefd: starting (pid: N) ---`.
const STARTUP_MARKER_PREFIX: &str = "--- reefd: starting (pid: ";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(crate::env::LOG_FILTER_VAR)
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Stderr-only logging for CLI modes and spawned children.
pub fn init_stderr() {
    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Supervise-mode logging: stderr plus the daemon log file.
///
/// The returned guard must live until exit so buffered lines flush.
pub fn init_daemon(
    config: &Config,
) -> std::io::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_path = config.log_path();

    rotate_log_if_needed(&log_path);
    write_startup_marker(&log_path)?;

    let file_appender = tracing_appender::rolling::never(&log_dir, "reefd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .init();

    Ok(guard)
}

/// Rotate the log file if it exceeds [`MAX_LOG_SIZE`].
///
/// Shifts `reefd.log` → `.1` → `.2` → `.3`, deleting the oldest.
/// Best-effort: rotation failures never block startup.
fn rotate_log_if_needed(log_path: &Path) {
    let size = match std::fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(_) => return,
    };
    if size < MAX_LOG_SIZE {
        return;
    }

    let log_str = log_path.display().to_string();
    for i in (1..MAX_ROTATED_LOGS).rev() {
        let from = format!("{log_str}.{i}");
        let to = format!("{log_str}.{}", i + 1);
        let _ = std::fs::rename(&from, &to);
    }
    let _ = std::fs::rename(log_path, format!("{log_str}.1"));
}

/// Append the startup marker before the subscriber exists, so it lands
/// even if setup fails right after.
fn write_startup_marker(log_path: &Path) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    writeln!(file, "{}{}) ---\n", STARTUP_MARKER_PREFIX, std::process::id())
}
