//! Process-wide tracing setup.
use std::path::Path;

use anyhow::{anyhow, Result};
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

/// Changes the active filter at runtime.
pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// `level` unless `RUST_LOG` says otherwise.
fn filter_for(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy()
}

/// Initialize structured JSON logging into hourly rolling files under `dir`.
///
/// Keep the returned guard alive for as long as logs should be flushed.
pub fn init(dir: impl AsRef<Path>, level: Level) -> Result<(FilterHandle, WorkerGuard)> {
    let appender = RollingFileAppender::new(Rotation::HOURLY, dir, "shardbase.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let (filter, handle) = reload::Layer::new(filter_for(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()?;
    Ok((handle, guard))
}

/// Human-readable logging to stderr, for command-line tools.
pub fn init_stderr(level: Level) -> Result<FilterHandle> {
    let (filter, handle) = reload::Layer::new(filter_for(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()?;
    Ok(handle)
}

pub fn set_level(handle: &FilterHandle, level: Level) -> Result<()> {
    handle.reload(filter_for(level))?;
    Ok(())
}

pub fn parse_level(name: &str) -> Result<Level> {
    name.parse::<Level>().map_err(|_| anyhow!("unknown log level `{name}`"))
}
