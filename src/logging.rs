//! Daily-rotated, structured JSON-lines debug logging.
//!
//! `init` owns the non-blocking writer guard explicitly rather than leaking
//! it into module-scope state: callers hold the returned `LoggingHandle` for
//! the lifetime of the process and drop it on shutdown to flush pending
//! lines.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

/// Owns the background log-writer thread. Dropping this flushes and stops
/// it; keep it alive for the lifetime of the process.
pub struct LoggingHandle {
    _guard: WorkerGuard,
}

/// Initialize structured logging: human-readable to stderr, and daily
/// rotated JSON-lines under `logs_dir`. Each JSON line carries
/// `{timestamp, level, category, message, data?, error?}` via `tracing`'s
/// standard fields (`category`/`data`/`error` are conventions applied at
/// call sites with `tracing::info!(category = "...", ...)`, not a custom
/// schema enforced here).
pub fn init(logs_dir: &Path) -> std::io::Result<LoggingHandle> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "colabctl.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer().json().with_writer(non_blocking).with_ansi(false);
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(LoggingHandle { _guard: guard })
}
