// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Centralized logging utilities for agent-relay
//!
//! Provides standardized tracing initialization so every component logs
//! through the same subscriber. The filter is taken from `LOG_LEVEL`,
//! falling back to `RUST_LOG`, falling back to the level passed by the
//! caller.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Re-export Level for convenience
pub use tracing::Level;

/// Output format for log messages
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable plaintext format
    #[default]
    Plaintext,
    /// Structured JSON format
    Json,
}

/// Build the environment filter for the given default level.
///
/// `LOG_LEVEL` takes precedence over `RUST_LOG` so operators can tune
/// the server without knowing tracing's directive syntax.
fn env_filter(default_level: Level) -> EnvFilter {
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        if let Ok(filter) = EnvFilter::try_new(&level) {
            return filter;
        }
    }
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string().to_lowercase()))
}

/// Initialize logging to stderr.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init(app_name: &str, default_level: Level, format: LogFormat) -> anyhow::Result<()> {
    let filter = env_filter(default_level);

    match format {
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?;
        }
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?;
        }
    }

    tracing::debug!(app = app_name, "logging initialized");
    Ok(())
}

/// Initialize logging for tests; ignores double-install errors so each
/// test can call it unconditionally.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("debug"))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_format_is_plaintext() {
        assert_eq!(LogFormat::default(), LogFormat::Plaintext);
    }

    #[test]
    fn filter_falls_back_to_default_level() {
        std::env::remove_var("LOG_LEVEL");
        std::env::remove_var("RUST_LOG");
        let filter = env_filter(Level::WARN);
        assert_eq!(filter.to_string(), "warn");
    }
}
