//! Durable stream positions
//!
//! One line per tracked stream: `<stream-identity> <byte-offset>\n`. The
//! whole file is rewritten through a temporary file and a rename on every
//! change, so a crash leaves either the old or the new contents.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::TailError;

/// Map of stream identity to byte offset, persisted to a file
#[derive(Debug)]
pub struct PositionStore {
    path: PathBuf,
    positions: BTreeMap<String, u64>,
}

impl PositionStore {
    /// Open a store, loading any positions already persisted
    ///
    /// A missing file is an empty store. Malformed lines are skipped.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TailError> {
        let path = path.into();
        let positions = match fs::read_to_string(&path) {
            Ok(text) => parse(&path, &text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(TailError::store(&path, e)),
        };
        debug!(path = %path.display(), streams = positions.len(), "Opened position store");
        Ok(Self { path, positions })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset recorded for a stream
    pub fn get(&self, identity: &str) -> Option<u64> {
        self.positions.get(identity).copied()
    }

    /// Record an offset and persist it
    pub fn set(&mut self, identity: &str, offset: u64) -> Result<(), TailError> {
        if self.positions.get(identity) == Some(&offset) {
            return Ok(());
        }
        self.positions.insert(identity.to_string(), offset);
        self.persist()
    }

    /// Forget a stream and persist the change
    pub fn remove(&mut self, identity: &str) -> Result<(), TailError> {
        if self.positions.remove(identity).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    /// Identities currently tracked
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.positions.keys().map(String::as_str)
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn persist(&self) -> Result<(), TailError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let write = || -> io::Result<()> {
            fs::create_dir_all(dir)?;
            let mut tmp = NamedTempFile::new_in(dir)?;
            for (identity, offset) in &self.positions {
                writeln!(tmp, "{identity} {offset}")?;
            }
            tmp.as_file().sync_all()?;
            tmp.persist(&self.path).map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|e| TailError::store(&self.path, e))
    }
}

fn parse(path: &Path, text: &str) -> BTreeMap<String, u64> {
    let mut positions = BTreeMap::new();
    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed = line
            .rsplit_once(' ')
            .and_then(|(identity, offset)| Some((identity, offset.parse::<u64>().ok()?)));
        match parsed {
            Some((identity, offset)) if !identity.is_empty() => {
                positions.insert(identity.to_string(), offset);
            }
            _ => warn!(path = %path.display(), line = n + 1, "Skipping malformed position entry"),
        }
    }
    positions
}
