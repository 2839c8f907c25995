//! Logging initialization

use std::path::Path;

use once_cell::sync::OnceCell;
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingConfig};
use crate::Result;

/// The non-blocking writer stops flushing once its guard drops; logging
/// lives as long as the process, so the guard is parked here.
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Install the global subscriber: console always, plus a daily-rotated
/// file when one is configured. `RUST_LOG` overrides the configured level.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = default_filter(&config.level)?;

    let mut layers = vec![formatted(&config.format, BoxMakeWriter::new(std::io::stdout))];
    if let Some(path) = &config.file {
        layers.push(formatted(&config.format, rolling_writer(Path::new(path))?));
    }

    tracing_subscriber::registry().with(layers).with(filter).init();

    info!("Logging initialized at level {}", config.level);
    Ok(())
}

fn default_filter(level: &str) -> Result<EnvFilter> {
    let level: Level = level
        .parse()
        .map_err(|_| crate::Error::parse(format!("Unrecognized log level '{}'", level)))?;
    Ok(EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy())
}

/// One formatting path for every destination; the format choice is the
/// only thing that varies between console and file output.
fn formatted(format: &LogFormat, writer: BoxMakeWriter) -> Box<dyn Layer<Registry> + Send + Sync> {
    let base = fmt::layer().with_writer(writer);
    match format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Full => base.boxed(),
    }
}

fn rolling_writer(path: &Path) -> Result<BoxMakeWriter> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(crate::NAME);

    let appender = rolling::RollingFileAppender::builder()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix(stem)
        .filename_suffix("log")
        .build(directory)
        .map_err(|e| crate::Error::internal(format!("Cannot open log directory: {}", e)))?;

    let (writer, guard) = non_blocking(appender);
    let _ = FILE_GUARD.set(guard);
    Ok(BoxMakeWriter::new(writer))
}
