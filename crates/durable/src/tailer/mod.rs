//! File and directory tailers

mod dir;
mod file;

pub use dir::DirTailer;
pub use file::FileTailer;

use std::time::Duration;

/// Timing of a tailer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailerConfig {
    /// How often new lines are looked for
    pub poll_interval: Duration,

    /// How often a directory is rescanned for new or vanished files
    pub rescan_interval: Duration,

    /// Close handles of streams without new lines for this long
    pub idle_close: Duration,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            rescan_interval: Duration::from_secs(60),
            idle_close: Duration::from_secs(15 * 60),
        }
    }
}

impl TailerConfig {
    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the directory rescan interval
    pub fn with_rescan_interval(mut self, interval: Duration) -> Self {
        self.rescan_interval = interval;
        self
    }

    /// Set the idle handle timeout
    pub fn with_idle_close(mut self, timeout: Duration) -> Self {
        self.idle_close = timeout;
        self
    }
}
