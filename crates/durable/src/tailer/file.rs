//! Tailing a single path

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use crate::position::PositionStore;
use crate::stream::{StreamId, TrackedStream};
use crate::TailError;

/// Follows one path across restarts, rotation and truncation
///
/// On the very first run the tailer starts at the current end of the file
/// and persists that offset, so pre-existing history is never read.
/// Afterwards it resumes from the persisted offset.
#[derive(Debug)]
pub struct FileTailer {
    path: PathBuf,
    store: PositionStore,
    stream: Option<TrackedStream>,
    attached_before: bool,
}

impl FileTailer {
    /// Create a tailer for `path` keeping its position in `store_path`
    pub fn open(path: impl Into<PathBuf>, store_path: impl Into<PathBuf>) -> Result<Self, TailError> {
        Ok(Self {
            path: path.into(),
            store: PositionStore::open(store_path)?,
            stream: None,
            attached_before: false,
        })
    }

    /// Tailed path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the next byte to read, once attached
    pub fn offset(&self) -> Option<u64> {
        self.stream.as_ref().map(|s| s.offset)
    }

    /// Deliver every complete line written since the last call
    ///
    /// Returns the number of lines delivered. A path that does not exist
    /// yet yields nothing.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn poll<F>(&mut self, mut on_line: F) -> Result<usize, TailError>
    where
        F: FnMut(&str),
    {
        let mut forward = |_: &Path, line: &str| on_line(line);

        if self.stream.is_none() && !self.attach()? {
            return Ok(0);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };

        let mut delivered = 0;
        match fs::metadata(&self.path) {
            Ok(metadata) => {
                let current = StreamId::of(&metadata);
                if current != stream.id {
                    // Rotated: finish the old file through its open handle first
                    if stream.is_open() {
                        delivered += stream.read_lines(&mut self.store, &mut forward)?;
                    }
                    info!(old = %stream.id, new = %current, "File rotated");
                    self.store.remove(&stream.key())?;
                    *stream = TrackedStream::new(self.path.clone(), current, 0);
                    self.store.set(&stream.key(), 0)?;
                } else if metadata.len() < stream.offset {
                    info!(offset = stream.offset, len = metadata.len(), "File truncated, restarting from 0");
                    stream.close();
                    stream.offset = 0;
                    self.store.set(&stream.key(), 0)?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Rotated away and not recreated yet: keep draining the old handle
                if !stream.is_open() {
                    return Ok(0);
                }
            }
            Err(e) => return Err(TailError::io(&self.path, e)),
        }

        delivered += stream.read_lines(&mut self.store, &mut forward)?;
        Ok(delivered)
    }

    /// Bind to the file currently at the path
    fn attach(&mut self) -> Result<bool, TailError> {
        let first_attempt = !self.attached_before;
        self.attached_before = true;

        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(TailError::io(&self.path, e)),
        };
        let id = StreamId::of(&metadata);
        let key = id.to_string();

        let offset = match self.store.get(&key) {
            Some(offset) => offset,
            None if self.store.is_empty() && first_attempt => metadata.len(),
            // A different file than last time, or one that appeared while running
            None => 0,
        };

        let stale: Vec<String> = self
            .store
            .ids()
            .filter(|k| *k != key)
            .map(str::to_string)
            .collect();
        for k in stale {
            self.store.remove(&k)?;
        }
        self.store.set(&key, offset)?;

        debug!(%id, offset, "Attached to file");
        self.stream = Some(TrackedStream::new(self.path.clone(), id, offset));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::panic::{self, AssertUnwindSafe};

    fn append(path: &Path, lines: impl IntoIterator<Item = String>) {
        let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    fn collect(tailer: &mut FileTailer) -> Vec<String> {
        let mut lines = Vec::new();
        tailer.poll(|l| lines.push(l.to_string())).unwrap();
        lines
    }

    #[test_log::test]
    fn test_first_run_skips_existing_history() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("sched.log");
        append(&log, ["old 1".to_string(), "old 2".to_string()]);

        let mut tailer = FileTailer::open(&log, dir.path().join("pos")).unwrap();
        assert!(collect(&mut tailer).is_empty());
        assert_eq!(tailer.offset(), Some(12));

        append(&log, ["new".to_string()]);
        assert_eq!(collect(&mut tailer), vec!["new"]);
    }

    #[test_log::test]
    fn test_resume_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("sched.log");
        let pos = dir.path().join("pos");
        fs::write(&log, "").unwrap();

        let mut tailer = FileTailer::open(&log, &pos).unwrap();
        assert!(collect(&mut tailer).is_empty());
        append(&log, (1..=10).map(|n| format!("line {n}")));

        // Crash while handling line 8, after line 7 was persisted
        let mut first = Vec::new();
        let crashed = panic::catch_unwind(AssertUnwindSafe(|| {
            tailer
                .poll(|l| {
                    if l == "line 8" {
                        panic!("crash while handling {l}");
                    }
                    first.push(l.to_string());
                })
                .unwrap();
        }));
        assert!(crashed.is_err());
        assert_eq!(first.len(), 7);
        assert_eq!(first[6], "line 7");
        drop(tailer);

        let mut restarted = FileTailer::open(&log, &pos).unwrap();
        assert_eq!(collect(&mut restarted), vec!["line 8", "line 9", "line 10"]);
    }

    #[test_log::test]
    fn test_partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("sched.log");
        fs::write(&log, "").unwrap();

        let mut tailer = FileTailer::open(&log, dir.path().join("pos")).unwrap();
        collect(&mut tailer);

        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        write!(file, "job 12 sta").unwrap();
        assert!(collect(&mut tailer).is_empty());

        writeln!(file, "rted\r").unwrap();
        assert_eq!(collect(&mut tailer), vec!["job 12 started"]);
    }

    #[test_log::test]
    fn test_rotation_neither_drops_nor_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("sched.log");
        fs::write(&log, "").unwrap();

        let mut tailer = FileTailer::open(&log, dir.path().join("pos")).unwrap();
        collect(&mut tailer);
        append(&log, ["a".to_string(), "b".to_string()]);
        assert_eq!(collect(&mut tailer), vec!["a", "b"]);

        // Written just before rotation, not yet seen
        append(&log, ["c".to_string()]);
        fs::rename(&log, dir.path().join("sched.log.1")).unwrap();
        append(&log, ["d".to_string(), "e".to_string()]);

        assert_eq!(collect(&mut tailer), vec!["c", "d", "e"]);
        append(&log, ["f".to_string()]);
        assert_eq!(collect(&mut tailer), vec!["f"]);
    }

    #[test_log::test]
    fn test_truncation_restarts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("sched.log");
        fs::write(&log, "").unwrap();

        let mut tailer = FileTailer::open(&log, dir.path().join("pos")).unwrap();
        collect(&mut tailer);
        append(&log, ["first".to_string(), "second".to_string()]);
        collect(&mut tailer);

        fs::write(&log, "x\n").unwrap();
        assert_eq!(collect(&mut tailer), vec!["x"]);
    }

    #[test_log::test]
    fn test_missing_file_then_created() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("later.log");

        let mut tailer = FileTailer::open(&log, dir.path().join("pos")).unwrap();
        assert!(collect(&mut tailer).is_empty());
        assert_eq!(tailer.offset(), None);

        append(&log, ["hello".to_string()]);
        assert_eq!(collect(&mut tailer), vec!["hello"]);
    }
}
