//! Log output
//!
//! The runtime emits `tracing` events (`trace!` per iteration, `debug!` for
//! lifecycle, `warn!` for failed handlers). Nothing is printed until a
//! subscriber is installed, either by the embedder or with [`init`].
//!
//! ```no_run
//! hostrt::logging::init();
//! tracing::info!("loop starting");
//! ```

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

use crate::config::RuntimeConfig;

/// Log level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Initialize logging at INFO level
pub fn init() {
    init_with_level(LogLevel::Info);
}

/// Initialize logging at the level named in the configuration
pub fn init_from_config(config: &RuntimeConfig) {
    init_with_level(config.logging.level);
}

/// Initialize logging with a custom level.
///
/// A second call, or a call after the embedder installed its own
/// subscriber, leaves the existing subscriber in place.
pub fn init_with_level(level: LogLevel) {
    let filter = tracing_subscriber::filter::LevelFilter::from_level(level.into());

    let layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_thread_names(true)
        .with_level(true)
        .with_ansi(false)
        .compact()
        .with_filter(filter);

    let _ = Registry::default().with(layer).try_init();
}
