//! Structured logging setup shared by both binaries.
//!
//! Initializes a tracing subscriber once per process: console output always,
//! plus an optional daily-rolling file appender behind a non-blocking
//! writer. `RUST_LOG` overrides the configured level when set.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::{Result, TelemetryError};

static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize tracing for this process.
///
/// Returns the file writer guard when file logging is enabled; the caller
/// must keep it alive for the process lifetime or buffered lines are lost
/// on exit. Calling more than once is a no-op.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    if TRACING_INITIALIZED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        return Ok(None);
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));

    let console_layer = fmt::layer().with_target(true);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir).map_err(|e| {
                TelemetryError::Configuration(format!("failed to create log directory: {e}"))
            })?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "agent.log".to_string());
            let appender = rolling::daily(dir, file_name);
            let (writer, guard) = non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // try_init rather than init: tests may race to install a subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let first = init("info", None).unwrap();
        let second = init("debug", None).unwrap();
        assert!(first.is_none());
        assert!(second.is_none());
    }
}
