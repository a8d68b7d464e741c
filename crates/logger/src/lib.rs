//! Process-wide tracing setup.
//!
//! `RUST_LOG` overrides the configured level. `RUST_LOG_FORMAT=json` switches
//! to one JSON object per event, anything else gives compact text.

use std::env::var;
use std::str::FromStr;

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid log level {0:?}")]
    InvalidLevel(String),

    #[error("A global subscriber is already installed")]
    AlreadyInitialized,
}

/// Output format of the log layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Compact,
    Json,
}

impl Format {
    /// Read from `RUST_LOG_FORMAT`
    pub fn from_env() -> Self {
        match var("RUST_LOG_FORMAT").as_deref() {
            Ok("json") => Format::Json,
            _ => Format::Compact,
        }
    }
}

/// Install the subscriber at `info`
pub fn init() -> Result<(), Error> {
    initialize_tracing(LevelFilter::INFO, Format::from_env())
}

/// Install the subscriber at a level named in configuration, e.g. `"debug"`
pub fn init_with_level(level: &str) -> Result<(), Error> {
    let level = parse_level(level)?;
    initialize_tracing(level, Format::from_env())
}

fn parse_level(level: &str) -> Result<LevelFilter, Error> {
    LevelFilter::from_str(level.trim()).map_err(|_| Error::InvalidLevel(level.to_string()))
}

fn initialize_tracing(level: LevelFilter, format: Format) -> Result<(), Error> {
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let log_layer = match format {
        Format::Json => tracing_subscriber::fmt::layer().json().with_filter(env_filter).boxed(),
        Format::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .without_time()
            .with_target(false)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(log_layer)
        .try_init()
        .map_err(|_| Error::AlreadyInitialized)
}
