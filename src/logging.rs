//! Logging initialisation for modforge.
//!
//! Stderr output is always enabled and filtered by `RUST_LOG` (default
//! `info`). When `MODFORGE_LOG` is set to `1`, structured logs are also
//! written to `<data>/modforge.log` through a non-blocking appender.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, fmt};

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init(data_dir: &Path) -> LogGuard {
    let file_guard = if std::env::var("MODFORGE_LOG").as_deref() == Ok("1") {
        let _ = std::fs::create_dir_all(data_dir);
        let file_appender = tracing_appender::rolling::never(data_dir, "modforge.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard { _file_guard: file_guard }
}

/// A dedicated plain-text sink for one test run.
///
/// The CI driver gives every (kernel, run) pair its own log file so that
/// interleaved VM output stays readable; the returned guard flushes the file
/// when dropped.
pub fn run_log_file(
    dir: &Path,
    file_name: &str,
) -> std::io::Result<(
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
)> {
    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::never(dir, file_name.to_owned());
    Ok(tracing_appender::non_blocking(appender))
}
