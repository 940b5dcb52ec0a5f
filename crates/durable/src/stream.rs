//! One tailed stream: an open handle, its identity and its offset

use std::fmt;
use std::fs::{self, File, Metadata};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::position::PositionStore;
use crate::TailError;

/// Stable identity of a file, independent of its path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    pub dev: u64,
    pub ino: u64,
}

impl StreamId {
    pub fn of(metadata: &Metadata) -> Self {
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    pub fn of_path(path: &Path) -> io::Result<Self> {
        fs::metadata(path).map(|m| Self::of(&m))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

/// A stream whose offset is kept in a [`PositionStore`]
#[derive(Debug)]
pub(crate) struct TrackedStream {
    pub path: PathBuf,
    pub id: StreamId,
    pub offset: u64,
    pub last_activity: Instant,
    /// Handles reopened after a failed read
    pub reopens: u64,
    reader: Option<BufReader<File>>,
}

impl TrackedStream {
    pub fn new(path: PathBuf, id: StreamId, offset: u64) -> Self {
        Self {
            path,
            id,
            offset,
            last_activity: Instant::now(),
            reopens: 0,
            reader: None,
        }
    }

    pub fn key(&self) -> String {
        self.id.to_string()
    }

    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Open the path and position the handle at the current offset
    ///
    /// Fails if the path now names a different file.
    pub fn open(&mut self) -> io::Result<()> {
        let file = File::open(&self.path)?;
        let id = StreamId::of(&file.metadata()?);
        if id != self.id {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is now {id}, expected {}", self.path.display(), self.id),
            ));
        }
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.offset))?;
        self.reader = Some(reader);
        trace!(path = %self.path.display(), id = %self.id, offset = self.offset, "Opened stream");
        Ok(())
    }

    pub fn close(&mut self) {
        if self.reader.take().is_some() {
            debug!(path = %self.path.display(), id = %self.id, "Closed stream");
        }
    }

    /// Size of the file behind the open handle
    pub fn handle_len(&self) -> Option<u64> {
        self.reader
            .as_ref()
            .and_then(|r| r.get_ref().metadata().ok())
            .map(|m| m.len())
    }

    /// Deliver every complete line past the offset
    ///
    /// The offset is persisted after each delivered line. A trailing line
    /// without a newline is left for a later call. An I/O error is retried
    /// once after reopening the handle.
    pub fn read_lines<F>(&mut self, store: &mut PositionStore, on_line: &mut F) -> Result<usize, TailError>
    where
        F: FnMut(&Path, &str),
    {
        if !self.is_open() {
            self.open().map_err(|e| TailError::io(&self.path, e))?;
        }
        match self.read_available(store, on_line) {
            Ok(n) => Ok(n),
            Err(ReadError::Store(e)) => Err(e),
            Err(ReadError::Io(e)) => {
                self.reopens += 1;
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    reopens = self.reopens,
                    "Read failed, reopening"
                );
                self.close();
                self.open().map_err(|e| TailError::io(&self.path, e))?;
                self.read_available(store, on_line).map_err(|e| match e {
                    ReadError::Store(e) => e,
                    ReadError::Io(e) => TailError::io(&self.path, e),
                })
            }
        }
    }

    fn read_available<F>(&mut self, store: &mut PositionStore, on_line: &mut F) -> Result<usize, ReadError>
    where
        F: FnMut(&Path, &str),
    {
        let key = self.key();
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };

        let mut delivered = 0;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).map_err(ReadError::Io)?;
            if read == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                // Incomplete line: rewind so it is read again once finished
                reader
                    .seek(SeekFrom::Start(self.offset))
                    .map_err(ReadError::Io)?;
                break;
            }

            let text = String::from_utf8_lossy(&buf[..buf.len() - 1]);
            let line: &str = &text;
            on_line(&self.path, line.strip_suffix('\r').unwrap_or(line));
            self.offset += read as u64;
            store.set(&key, self.offset).map_err(ReadError::Store)?;
            delivered += 1;
        }

        if delivered > 0 {
            self.last_activity = Instant::now();
        }
        Ok(delivered)
    }
}

enum ReadError {
    Io(io::Error),
    Store(TailError),
}
