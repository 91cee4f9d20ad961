use std::io;

use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Install the global subscriber. Logs go to stderr so stdout stays free for tables and JSON.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(&config.level)?;
    let registry = Registry::default().with(filter);

    let res = match config.format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_writer(io::stderr).with_target(true))
            .try_init(),
        "compact" => registry
            .with(fmt::layer().compact().with_writer(io::stderr).with_target(false))
            .try_init(),
        _ => registry
            .with(fmt::layer().pretty().with_writer(io::stderr).with_target(false))
            .try_init(),
    };
    res.map_err(|e| Error::Config(format!("failed to install subscriber: {e}")))?;

    info!(level = %config.level, format = %config.format, "logging initialized");
    Ok(())
}

fn parse_level(level: &str) -> Result<Level> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(Error::Config(format!("invalid log level: {level}"))),
    }
}

/// `RUST_LOG` wins over the configured level when set.
fn env_filter(level: &str) -> Result<EnvFilter> {
    let base = parse_level(level)?;
    Ok(EnvFilter::builder()
        .with_default_directive(base.into())
        .from_env_lossy()
        .add_directive("hyper=warn".parse().map_err(|e| Error::Config(format!("{e}")))?)
        .add_directive("reqwest=warn".parse().map_err(|e| Error::Config(format!("{e}")))?))
}
