//! # Durable Log Tailing
//!
//! Incremental, crash-resumable reading of log files.
//!
//! ## Features
//!
//! - **Position store**: byte offsets per stream, rewritten atomically
//! - **File tailer**: one path, following rotation and truncation
//! - **Directory tailer**: every matching file, tracked by device+inode,
//!   with idle handles closed and reopened on demand
//!
//! Offsets are persisted after each delivered line, so a crash between
//! delivery and persistence can deliver a line twice but never skips one.
//!
//! ## Example
//!
//! ```ignore
//! use clusterfacts_durable::FileTailer;
//!
//! let mut tailer = FileTailer::open("/var/log/slurmctld.log", "/var/tmp/clusterfacts/slurmctld.pos")?;
//! tailer.poll(|line| println!("{line}"))?;
//! ```

use std::io;
use std::path::Path;

pub mod position;
mod stream;
pub mod tailer;

pub use position::PositionStore;
pub use stream::StreamId;
pub use tailer::{DirTailer, FileTailer, TailerConfig};

/// Errors from tailing
#[derive(Debug, thiserror::Error)]
pub enum TailError {
    /// Reading a tailed file or directory failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Reading or writing the position store failed
    #[error("position store {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: io::Error,
    },

    /// File name filter is not a valid regex
    #[error("invalid file name pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl TailError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn store(path: &Path, source: io::Error) -> Self {
        Self::Store {
            path: path.display().to_string(),
            source,
        }
    }
}
