use std::fs;
use std::path::Path;

use fingergate_core::identification::SCAN_TARGET;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const SCAN_LOG_FILE: &str = "scan.log";

/// Installs the stderr subscriber and, when `scan_log_dir` is given, a daily
/// rolling file that only receives scan and webhook records.
///
/// The returned guard flushes the scan log when dropped.
pub fn init_tracing(verbose: u8, scan_log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    let (scan_layer, guard) = match scan_log_dir.and_then(scan_writer) {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer)
                .with_filter(Targets::new().with_target(SCAN_TARGET, Level::INFO));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(scan_layer);
    if tracing::subscriber::set_global_default(registry).is_err() {
        // Already initialised (tests).
    }
    guard
}

fn scan_writer(
    dir: &Path,
) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    if let Err(err) = fs::create_dir_all(dir) {
        eprintln!(
            "warning: scan log disabled; cannot create {}: {err}",
            dir.display()
        );
        return None;
    }
    let appender = tracing_appender::rolling::daily(dir, SCAN_LOG_FILE);
    Some(tracing_appender::non_blocking(appender))
}
