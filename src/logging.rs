//! Logging sink setup.
//!
//! With `--logfile` set, log lines are appended to that file through a
//! non-blocking writer; otherwise they go to stderr. `RUST_LOG` overrides
//! the `--log-level` flag when present (useful for development).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Initialise the tracing subscriber.
///
/// Returns a [`WorkerGuard`] that must be held for the lifetime of the
/// program; dropping it flushes and closes the log file writer.
pub fn init(level: LogLevel, logfile: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    match logfile {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    eprintln!(
                        "warning: could not create log directory {}: {e}",
                        parent.display()
                    );
                }
            }
            let appender = match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("warning: could not open logfile {}: {e}", path.display());
                    init_stderr(filter);
                    return None;
                }
            };
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .init();
            Some(guard)
        }
        None => {
            init_stderr(filter);
            None
        }
    }
}

fn init_stderr(filter: EnvFilter) {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
