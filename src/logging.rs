//! Diagnostics setup for the CLI, server, and worker processes.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    /// Emit to stderr. Stdout is reserved for command output.
    pub stderr: bool,
    /// Optional directory for a daily-rolling log file.
    pub log_dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            stderr: true,
            log_dir: None,
            file_prefix: "gitdeploy.log".to_string(),
        }
    }
}

fn make_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. The returned guard must be held for the
/// life of the process when file logging is enabled, otherwise buffered
/// lines are dropped.
pub fn init_logging(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut guard = None;

    if options.stderr {
        let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
        if options.json {
            layers.push(layer.json().with_filter(make_filter(&options.level)).boxed());
        } else {
            layers.push(layer.with_filter(make_filter(&options.level)).boxed());
        }
    }

    if let Some(dir) = &options.log_dir {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow!("Failed to create log directory {}: {}", dir.display(), e))?;
        let appender = tracing_appender::rolling::daily(dir, &options.file_prefix);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(make_filter(&options.level))
                .boxed(),
        );
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    Ok(guard)
}
