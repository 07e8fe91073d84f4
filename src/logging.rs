//! tracing setup for labctl.
//!
//! stderr always receives formatted output filtered by `RUST_LOG` (default
//! `warn`). Setting `LABCTL_LOG=1` raises the default to `info` and tees
//! everything, uncoloured, into `labctl.log` under [`LabPaths::logs`].

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths::LabPaths;

const LOG_ENV: &str = "LABCTL_LOG";
const LOG_FILE: &str = "labctl.log";

/// Keeps the file writer's worker alive; drop it last so pending lines are
/// flushed.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init() -> LogGuard {
    let to_file = std::env::var(LOG_ENV).as_deref() == Ok("1");
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if to_file { "info" } else { "warn" }));

    let (file_layer, guard) = match to_file.then(log_dir) {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE));
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    LogGuard { _file: guard }
}

/// The labctl log directory, created on demand. Falls back to a directory
/// under the system temp dir when `HOME` is unset or unwritable.
fn log_dir() -> PathBuf {
    match LabPaths::resolve().filter(|paths| paths.ensure().is_ok()) {
        Some(paths) => paths.logs,
        None => {
            let dir = std::env::temp_dir().join("labctl");
            let _ = std::fs::create_dir_all(&dir);
            dir
        }
    }
}
