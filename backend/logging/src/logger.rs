//! Global subscriber: console output plus an optional daily-rolling NDJSON
//! file, filtered by `RUST_LOG` or the configured level.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Rolled files are named `equaforge.log.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "equaforge.log";

/// `RUST_LOG` wins over the configured level; an unparsable level falls
/// back to `info`.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global logger. Console lines go to stderr so command output
/// on stdout stays clean. Calling it twice leaves the first logger in place.
pub fn init_logger(log_dir: Option<&Path>, level: &str, json: bool) -> Result<()> {
    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            Some(fmt::layer().json().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    let console_text = (!json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });
    let console_json = json.then(|| fmt::layer().json().with_writer(std::io::stderr));

    let _ = tracing_subscriber::registry()
        .with(build_filter(level))
        .with(console_text)
        .with(console_json)
        .with(file_layer)
        .try_init();
    Ok(())
}
