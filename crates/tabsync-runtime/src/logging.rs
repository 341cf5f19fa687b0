//! Tracing subscriber setup
//!
//! Library crates only emit events; binaries and test harnesses call
//! [`init_tracing`] once. `RUST_LOG` wins over the configured level.

use tabsync_core::{SyncError, SyncResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::LogConfig;

pub fn init_tracing(config: &LogConfig) -> SyncResult<()> {
    let filter = build_filter(config)?;
    let registry = Registry::default().with(filter);

    let result = if config.json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    result.map_err(|e| SyncError::Logging(e.to_string()))
}

fn build_filter(config: &LogConfig) -> SyncResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| SyncError::Logging(e.to_string()))
}
