//! Tracing setup for the `ferri` binary.
//!
//! Layers:
//! - stderr (always on; stdout carries command output)
//! - optional rolling app log under `log_path`
//! - optional rolling error-only log under `log_error_path`
//!
//! `RUST_LOG` wins over the configured `log_level`.

use std::io::{self, IsTerminal};

use anyhow::{Context, Result};
use ferri_core::{Config, LogRotation};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Non-blocking writer guards. Keep alive until exit so file logs flush.
#[derive(Debug, Default)]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
    _error_file: Option<WorkerGuard>,
}

fn filter(cfg: &Config) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn rotation(cfg: &Config) -> Rotation {
    match cfg.log_rotation {
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Hourly => Rotation::HOURLY,
    }
}

fn appender(cfg: &Config, dir: &std::path::Path, prefix: &str) -> Result<rolling::RollingFileAppender> {
    rolling::Builder::new()
        .rotation(rotation(cfg))
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(dir)
        .with_context(|| format!("failed to create log appender in {}", dir.display()))
}

/// Install the global subscriber described by `cfg`.
pub fn init(cfg: &Config) -> Result<LoggingGuards> {
    let console = fmt::layer()
        .with_writer(io::stderr)
        .with_target(true)
        .with_ansi(io::stderr().is_terminal())
        .with_filter(filter(cfg));

    let (file_layer, file_guard) = match &cfg.log_path {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(appender(cfg, dir, "ferri")?);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .with_filter(filter(cfg));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let (error_layer, error_guard) = match &cfg.log_error_path {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(appender(cfg, dir, "ferri-error")?);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .with_filter(LevelFilter::ERROR);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(error_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    install_panic_hook();

    Ok(LoggingGuards {
        _file: file_guard,
        _error_file: error_guard,
    })
}

/// Route panics through `tracing::error!` so they reach the error log.
fn install_panic_hook() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let default = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let payload = info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic occurred".to_string());
            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_default();
            tracing::error!(target: "panic", %location, "panic: {payload}");
            default(info);
        }));
    });
}
