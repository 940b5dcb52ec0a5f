// Runner configuration
// Decision: Optional TOML file, then CLUSTERFACTS_* environment variables on top
// Decision: Every field has a default so the runner works without any file

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_STATE_DIR: &str = "/var/tmp/clusterfacts";

/// Settings of the `run_workflow` binary
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    /// Where tailers keep their position files
    pub state_dir: PathBuf,
    /// Where PID files are created
    pub pid_dir: PathBuf,
    /// Log file; required to see anything once detached
    pub log_file: Option<PathBuf>,
    /// Log filter used when neither RUST_LOG nor LOG_LEVEL is set
    pub log_filter: Option<String>,
    /// Engine liveness poll
    pub poll_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            pid_dir: PathBuf::from(DEFAULT_STATE_DIR),
            log_file: None,
            log_filter: None,
            poll_interval_ms: 100,
        }
    }
}

impl RunnerConfig {
    /// Load the config file (if any) and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.with_env(|key| std::env::var(key).ok())
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `CLUSTERFACTS_*` overrides looked up through `var`
    pub fn with_env(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = var("CLUSTERFACTS_STATE_DIR") {
            self.state_dir = dir.into();
        }
        if let Some(dir) = var("CLUSTERFACTS_PID_DIR") {
            self.pid_dir = dir.into();
        }
        if let Some(file) = var("CLUSTERFACTS_LOG_FILE") {
            self.log_file = Some(file.into());
        }
        if let Some(filter) = var("CLUSTERFACTS_LOG_FILTER") {
            self.log_filter = Some(filter);
        }
        if let Some(ms) = var("CLUSTERFACTS_POLL_INTERVAL_MS") {
            self.poll_interval_ms = ms
                .parse()
                .with_context(|| format!("CLUSTERFACTS_POLL_INTERVAL_MS is not a number: {ms}"))?;
        }
        Ok(self)
    }
}
