//! Logging setup.
//!
//! Console output respects `RUST_LOG` and defaults to debug for this crate,
//! which includes the per-chunk relay annotations. An optional log file gets
//! the same events without ANSI colors.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "ukey_bridge=debug,issue_cert=info,info";

/// Install the global subscriber.
///
/// Returns the file writer's guard when `log_file` is set; keep it alive until
/// exit so buffered lines are flushed.
pub fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let console_layer = fmt::layer().with_target(false).with_filter(filter());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path {}", path.display()))?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
