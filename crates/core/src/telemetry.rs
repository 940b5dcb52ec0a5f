// Telemetry Module
//
// Structured logging setup shared by every Clusterfacts binary:
// - fmt layer on stdout, or on a log file when running detached
// - EnvFilter taken from RUST_LOG, LOG_LEVEL or the runner config

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// Telemetry Configuration
// ============================================================================

/// Configuration for logging
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name recorded at startup
    pub service_name: String,
    /// Log filter (e.g., "info", "debug", "clusterfacts_core=debug")
    pub log_filter: Option<String>,
    /// Write logs to this file instead of stdout
    pub log_file: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "clusterfacts".to_string(),
            log_filter: None,
            log_file: None,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            ..Default::default()
        }
    }

    /// Use `filter` unless one was already set from the environment
    pub fn or_log_filter(mut self, filter: Option<String>) -> Self {
        if self.log_filter.is_none() {
            self.log_filter = filter;
        }
        self
    }

    /// Send logs to a file
    pub fn with_log_file(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Errors initializing logging
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The log file could not be opened
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A global subscriber was already installed
    #[error("failed to install subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global tracing subscriber
///
/// # Example
///
/// ```ignore
/// use clusterfacts_core::telemetry::{init_telemetry, TelemetryConfig};
///
/// fn main() -> anyhow::Result<()> {
///     init_telemetry(TelemetryConfig::from_env())?;
///     // ... your application code
///     Ok(())
/// }
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = config.filter();

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| TelemetryError::LogFile {
                    path: path.display().to_string(),
                    source,
                })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let console_layer = config
        .log_file
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(service = %config.service_name, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "clusterfacts");
        assert!(config.log_filter.is_none());
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_env_filter_wins_over_config() {
        let config = TelemetryConfig {
            log_filter: Some("debug".to_string()),
            ..Default::default()
        }
        .or_log_filter(Some("warn".to_string()));
        assert_eq!(config.log_filter.as_deref(), Some("debug"));

        let config = TelemetryConfig::default().or_log_filter(Some("warn".to_string()));
        assert_eq!(config.log_filter.as_deref(), Some("warn"));
    }

    #[test]
    fn test_unreadable_log_file_is_reported() {
        let config = TelemetryConfig::default()
            .with_log_file(Some(PathBuf::from("/nonexistent/dir/clusterfacts.log")));
        assert!(matches!(
            init_telemetry(config),
            Err(TelemetryError::LogFile { .. })
        ));
    }
}
