//! Tracing setup.
//!
//! The subscriber is installed once at startup with `info`, before the config
//! is read; [`apply_logging_level`] swaps the filter in place once
//! `logging.level` is known. `RUST_LOG` always wins over the configured level.

use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Connection-level crates that are noisy below `warn`.
const QUIET_TARGETS: [&str; 2] = ["hyper_util", "h2"];

/// Filter directives for a configured level.
fn directives(level: &str) -> String {
    let mut out = level.to_ascii_lowercase();
    for target in QUIET_TARGETS {
        out.push_str(&format!(",{target}=warn"));
    }
    out
}

fn rust_log_filter() -> Option<EnvFilter> {
    std::env::var_os(EnvFilter::DEFAULT_ENV)?;
    EnvFilter::try_from_default_env().ok()
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let filter = rust_log_filter().unwrap_or_else(|| EnvFilter::new(directives("info")));
    let (filter_layer, handle) = reload::Layer::new(filter);

    if tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .try_init()
        .is_ok()
    {
        let _ = FILTER_HANDLE.set(handle);
    }
}

/// Switch to the configured level. Returns whether the filter changed.
pub fn apply_logging_level(level: &str) -> bool {
    if rust_log_filter().is_some() {
        tracing::debug!(configured = %level, "RUST_LOG set, keeping it");
        return false;
    }
    let Some(handle) = FILTER_HANDLE.get() else {
        return false;
    };
    let filter = match EnvFilter::try_new(directives(level)) {
        Ok(filter) => filter,
        Err(e) => {
            tracing::warn!(level = %level, error = %e, "Invalid logging level, keeping current filter");
            return false;
        }
    };
    match handle.reload(filter) {
        Ok(()) => {
            tracing::info!(level = %level, "Log level applied");
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to reload log filter");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_quiet_transport_crates() {
        assert_eq!(directives("DEBUG"), "debug,hyper_util=warn,h2=warn");
    }

    #[test]
    fn every_valid_config_level_parses() {
        for level in ["trace", "debug", "info", "warn", "error", "off"] {
            assert!(EnvFilter::try_new(directives(level)).is_ok(), "{level}");
        }
    }
}
