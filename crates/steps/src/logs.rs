//! Log producers built on the durable tailers
//!
//! Both steps poll their tailer once on start and then keep polling until
//! `follow_secs` have elapsed. Every poll that delivers lines becomes one
//! [`LogBatch`]; a run that finds nothing new still emits one empty batch
//! so consumers can tell "no news" from a failed producer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use clusterfacts_core::prelude::*;
use clusterfacts_durable::{DirTailer, FileTailer, TailError, TailerConfig};

use crate::data::{LogBatch, LogLine};

/// Directory for position files when neither the step nor the workflow sets one
pub const DEFAULT_STATE_DIR: &str = "/var/tmp/clusterfacts";

/// Timeout hint for a single poll, added on top of any follow window
const POLL_TIMEOUT: Duration = Duration::from_secs(60);

fn follow_timeout(follow_secs: u64) -> Option<Duration> {
    Some(Duration::from_secs(follow_secs) + POLL_TIMEOUT)
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_poll_ms() -> u64 {
    1000
}

/// Position file for a tailed path under `state_dir`
fn position_file(state_dir: &Path, prefix: &str, tailed: &Path) -> PathBuf {
    let name: String = tailed
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    state_dir.join(format!("{prefix}{name}.pos"))
}

fn tail_failed(e: TailError) -> StepError {
    StepError::failed(e.to_string())
}

/// Synchronous tailer driven from a blocking task
trait LinePoller: Send + 'static {
    fn poll_lines(&mut self) -> Result<Vec<LogLine>, TailError>;
}

impl LinePoller for FileTailer {
    fn poll_lines(&mut self) -> Result<Vec<LogLine>, TailError> {
        let file = self.path().display().to_string();
        let mut lines = Vec::new();
        self.poll(|text| {
            lines.push(LogLine {
                file: file.clone(),
                text: text.to_string(),
            })
        })?;
        Ok(lines)
    }
}

impl LinePoller for DirTailer {
    fn poll_lines(&mut self) -> Result<Vec<LogLine>, TailError> {
        let mut lines = Vec::new();
        self.poll(|path, text| {
            lines.push(LogLine {
                file: path.display().to_string(),
                text: text.to_string(),
            })
        })?;
        Ok(lines)
    }
}

async fn follow<P: LinePoller>(
    mut poller: P,
    source: String,
    follow_for: Duration,
    poll_interval: Duration,
    ctx: &mut StepContext,
) -> Result<(), StepError> {
    let deadline = Instant::now() + follow_for;
    let mut emitted = false;

    loop {
        let (returned, polled) = tokio::task::spawn_blocking(move || {
            let polled = poller.poll_lines();
            (poller, polled)
        })
        .await
        .map_err(|e| StepError::failed(format!("tailer task failed: {e}")))?;
        poller = returned;

        let lines = polled.map_err(tail_failed)?;
        if !lines.is_empty() {
            debug!(%source, lines = lines.len(), "Read log lines");
            ctx.emit_data(LogBatch {
                source: source.clone(),
                lines,
            })?;
            emitted = true;
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }

    if !emitted {
        info!(%source, "No new log lines");
        ctx.emit_data(LogBatch {
            source,
            lines: Vec::new(),
        })?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct TailLogParams {
    pub path: PathBuf,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Overrides the position file derived from `state_dir` and `path`
    #[serde(default)]
    pub position_file: Option<PathBuf>,

    #[serde(default)]
    pub follow_secs: u64,

    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

/// Reads new lines of one log file
pub struct TailLog {
    params: TailLogParams,
}

#[async_trait]
impl Step for TailLog {
    const NAME: &'static str = "tail_log";
    type Params = TailLogParams;

    fn spec() -> StepSpec {
        StepSpec::new(Self::NAME)
            .with_description("Read lines appended to a log file since the last run")
            .produces(LogBatch::KIND)
            .with_param(ParamSpec::required("path", "Log file to follow"))
            .with_param(ParamSpec::optional("state_dir", "Directory for position files"))
            .with_param(ParamSpec::optional("position_file", "Explicit position file"))
            .with_param(ParamSpec::optional("follow_secs", "Keep polling for this many seconds"))
            .with_param(ParamSpec::optional("poll_ms", "Poll interval while following"))
            .with_timeout_hint(POLL_TIMEOUT)
    }

    fn new(params: TailLogParams) -> Result<Self, StepError> {
        Ok(Self { params })
    }

    fn timeout_hint(&self) -> Option<Duration> {
        follow_timeout(self.params.follow_secs)
    }

    async fn run(&mut self, ctx: &mut StepContext) -> Result<(), StepError> {
        let params = &self.params;
        let store = params
            .position_file
            .clone()
            .unwrap_or_else(|| position_file(&params.state_dir, "tail_log", &params.path));
        std::fs::create_dir_all(store.parent().unwrap_or(Path::new(".")))?;

        let tailer = FileTailer::open(&params.path, store).map_err(tail_failed)?;
        follow(
            tailer,
            params.path.display().to_string(),
            Duration::from_secs(params.follow_secs),
            Duration::from_millis(params.poll_ms),
            ctx,
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
pub struct TailLogDirParams {
    pub dir: PathBuf,

    /// Regex on file names
    #[serde(default)]
    pub filter: Option<String>,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub position_file: Option<PathBuf>,

    #[serde(default)]
    pub follow_secs: u64,

    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    #[serde(default)]
    pub rescan_secs: Option<u64>,

    #[serde(default)]
    pub idle_close_secs: Option<u64>,
}

/// Reads new lines of every file in a directory
pub struct TailLogDir {
    params: TailLogDirParams,
}

#[async_trait]
impl Step for TailLogDir {
    const NAME: &'static str = "tail_log_dir";
    type Params = TailLogDirParams;

    fn spec() -> StepSpec {
        StepSpec::new(Self::NAME)
            .with_description("Read lines appended to the files of a log directory")
            .produces(LogBatch::KIND)
            .with_param(ParamSpec::required("dir", "Directory to follow"))
            .with_param(ParamSpec::optional("filter", "Regex selecting file names"))
            .with_param(ParamSpec::optional("state_dir", "Directory for position files"))
            .with_param(ParamSpec::optional("position_file", "Explicit position file"))
            .with_param(ParamSpec::optional("follow_secs", "Keep polling for this many seconds"))
            .with_param(ParamSpec::optional("poll_ms", "Poll interval while following"))
            .with_param(ParamSpec::optional("rescan_secs", "Directory rescan interval"))
            .with_param(ParamSpec::optional("idle_close_secs", "Close handles idle this long"))
            .with_timeout_hint(POLL_TIMEOUT)
    }

    fn new(params: TailLogDirParams) -> Result<Self, StepError> {
        if let Some(filter) = &params.filter {
            // Surface a bad pattern at resolution time
            regex::Regex::new(filter).map_err(|e| StepError::InvalidParams(e.to_string()))?;
        }
        Ok(Self { params })
    }

    fn timeout_hint(&self) -> Option<Duration> {
        follow_timeout(self.params.follow_secs)
    }

    async fn run(&mut self, ctx: &mut StepContext) -> Result<(), StepError> {
        let params = &self.params;
        let store = params
            .position_file
            .clone()
            .unwrap_or_else(|| position_file(&params.state_dir, "tail_log_dir", &params.dir));
        std::fs::create_dir_all(store.parent().unwrap_or(Path::new(".")))?;

        let mut config =
            TailerConfig::default().with_poll_interval(Duration::from_millis(params.poll_ms));
        if let Some(secs) = params.rescan_secs {
            config = config.with_rescan_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = params.idle_close_secs {
            config = config.with_idle_close(Duration::from_secs(secs));
        }
        let poll_interval = config.poll_interval;

        let mut tailer = DirTailer::open(&params.dir, store, config).map_err(tail_failed)?;
        if let Some(filter) = &params.filter {
            tailer = tailer.with_filter(filter).map_err(tail_failed)?;
        }

        follow(
            tailer,
            params.dir.display().to_string(),
            Duration::from_secs(params.follow_secs),
            poll_interval,
            ctx,
        )
        .await
    }
}
