//! Shared logging utilities for CIB bridge binaries.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "cib_bridge=info,cib_protocol=info";
const VERBOSE_LOG_FILTER: &str = "cib_bridge=debug,cib_protocol=debug";

/// Logging configuration shared by the bridge binaries.
pub struct LogConfig<'a> {
    /// Raise the console filter to match the file filter.
    pub verbose: bool,
    /// Optional append-mode log file alongside stderr output.
    pub log_file: Option<&'a Path>,
}

/// Initialize tracing with a stderr layer and an optional file layer.
///
/// The filter comes from `RUST_LOG` when set, otherwise the crate
/// defaults. Installs the global subscriber; call once per process.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let console_filter = if config.verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(console_filter),
    );

    match config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let file_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Arc::new(file))
                        .with_ansi(false)
                        .with_filter(file_filter),
                )
                .init();
        }
        None => registry.init(),
    }

    Ok(())
}
