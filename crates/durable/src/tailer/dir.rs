//! Tailing every file in a directory

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use super::TailerConfig;
use crate::position::PositionStore;
use crate::stream::{StreamId, TrackedStream};
use crate::TailError;

/// Follows all (matching) files of a directory
///
/// Files are tracked by device and inode, so a file renamed by log
/// rotation keeps its position under its new name. Files present at the
/// first scan start at their end; files that show up later start at 0.
/// Handles of streams idle for longer than the configured interval are
/// closed and transparently reopened when the file grows again.
#[derive(Debug)]
pub struct DirTailer {
    dir: PathBuf,
    filter: Option<Regex>,
    config: TailerConfig,
    store: PositionStore,
    streams: BTreeMap<StreamId, TrackedStream>,
    last_scan: Option<Instant>,
}

impl DirTailer {
    /// Create a tailer for `dir` keeping positions in `store_path`
    pub fn open(
        dir: impl Into<PathBuf>,
        store_path: impl Into<PathBuf>,
        config: TailerConfig,
    ) -> Result<Self, TailError> {
        Ok(Self {
            dir: dir.into(),
            filter: None,
            config,
            store: PositionStore::open(store_path)?,
            streams: BTreeMap::new(),
            last_scan: None,
        })
    }

    /// Only follow files whose name matches `pattern`
    pub fn with_filter(mut self, pattern: &str) -> Result<Self, TailError> {
        self.filter = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Tailed directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of tracked streams
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Number of streams with an open handle
    pub fn open_handles(&self) -> usize {
        self.streams.values().filter(|s| s.is_open()).count()
    }

    /// Deliver every complete line written since the last call
    ///
    /// The directory is rescanned when the rescan interval has elapsed.
    #[instrument(skip_all, fields(dir = %self.dir.display()))]
    pub fn poll<F>(&mut self, mut on_line: F) -> Result<usize, TailError>
    where
        F: FnMut(&Path, &str),
    {
        let mut delivered = 0;
        let due = self
            .last_scan
            .map_or(true, |at| at.elapsed() >= self.config.rescan_interval);
        if due {
            delivered += self.rescan(&mut on_line)?;
        }

        for stream in self.streams.values_mut() {
            if !stream.is_open() {
                // Reopen only once there is something new to read
                match fs::metadata(&stream.path) {
                    Ok(m) if StreamId::of(&m) == stream.id && m.len() > stream.offset => {}
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(TailError::io(&stream.path, e)),
                }
            } else if stream.handle_len().is_some_and(|len| len < stream.offset) {
                info!(path = %stream.path.display(), "File truncated, restarting from 0");
                stream.close();
                stream.offset = 0;
                self.store.set(&stream.key(), 0)?;
            }

            delivered += stream.read_lines(&mut self.store, &mut on_line)?;

            if stream.last_activity.elapsed() >= self.config.idle_close {
                stream.close();
            }
        }

        Ok(delivered)
    }

    /// Reconcile tracked streams with the directory contents
    fn rescan<F>(&mut self, on_line: &mut F) -> Result<usize, TailError>
    where
        F: FnMut(&Path, &str),
    {
        let initial = self.last_scan.is_none();
        self.last_scan = Some(Instant::now());

        let found = self.list()?;
        let mut delivered = 0;

        for (id, (path, len)) in &found {
            match self.streams.get_mut(id) {
                Some(stream) => {
                    if stream.path != *path {
                        info!(old = %stream.path.display(), new = %path.display(), %id, "Stream renamed");
                        stream.path = path.clone();
                    }
                }
                None => {
                    let key = id.to_string();
                    let offset = match self.store.get(&key) {
                        Some(offset) => offset,
                        None if initial => *len,
                        None => 0,
                    };
                    self.store.set(&key, offset)?;
                    debug!(path = %path.display(), %id, offset, "Tracking new stream");
                    self.streams
                        .insert(*id, TrackedStream::new(path.clone(), *id, offset));
                }
            }
        }

        let vanished: Vec<StreamId> = self
            .streams
            .keys()
            .filter(|id| !found.contains_key(id))
            .copied()
            .collect();
        for id in vanished {
            if let Some(mut stream) = self.streams.remove(&id) {
                if stream.is_open() {
                    delivered += stream.read_lines(&mut self.store, on_line)?;
                }
                info!(path = %stream.path.display(), %id, "Stream vanished");
                self.store.remove(&stream.key())?;
            }
        }

        if initial {
            let stale: Vec<String> = self
                .store
                .ids()
                .filter(|k| !self.streams.values().any(|s| s.key() == *k))
                .map(str::to_string)
                .collect();
            for key in stale {
                self.store.remove(&key)?;
            }
        }

        Ok(delivered)
    }

    fn list(&self) -> Result<HashMap<StreamId, (PathBuf, u64)>, TailError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| TailError::io(&self.dir, e))?;
        let mut found = HashMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| TailError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if self.filter.as_ref().is_some_and(|re| !re.is_match(name)) {
                continue;
            }
            let path = entry.path();
            // The store may live in the tailed directory
            if path == self.store.path() {
                continue;
            }
            match fs::metadata(&path) {
                Ok(m) if m.is_file() => {
                    found.insert(StreamId::of(&m), (path, m.len()));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                }
            }
        }
        Ok(found)
    }
}
