//! Logging initialization.
//!
//! `RUST_LOG` controls the filter (default `info`); output is human-readable
//! or JSON, optionally duplicated to a daily-rolling file.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. Returns the appender guard when file
/// logging is enabled; hold it for the lifetime of the process.
///
/// Safe to call more than once (later calls are no-ops), so tests and
/// embedding callers don't fight over the global.
pub fn init(json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "epicycle.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false);
            if json {
                let _ = builder.json().try_init();
            } else {
                let _ = builder.try_init();
            }
            Some(guard)
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            if json {
                let _ = builder.json().try_init();
            } else {
                let _ = builder.try_init();
            }
            None
        }
    }
}
