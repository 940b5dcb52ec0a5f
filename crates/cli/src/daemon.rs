// Detaching and single-instance guard
//
// `daemonize` must run before any thread is started: the async runtime is
// built only after it returns.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Errors taking the PID file
#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("PID file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("another instance holds {path}{}", pid.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    AlreadyRunning { path: String, pid: Option<u32> },
}

/// Exclusive lock on a PID file, released on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    // Holding the descriptor keeps the flock
    _file: File,
}

impl PidFile {
    /// Lock `path` and write the current PID into it
    ///
    /// Fails immediately if another process holds the lock.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, PidFileError> {
        let path = path.into();
        let io_error = |source| PidFileError::Io {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error)?;

        // SAFETY: the descriptor is owned by `file` and stays open for the call
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(PidFileError::AlreadyRunning {
                    path: path.display().to_string(),
                    pid: read_pid(&mut file),
                });
            }
            return Err(io_error(err));
        }

        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| writeln!(file, "{}", std::process::id()))
            .and_then(|_| file.sync_all())
            .map_err(io_error)?;

        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut text = String::new();
    file.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}

/// Detach from the terminal: fork twice, start a new session, point the
/// standard streams at /dev/null
pub fn daemonize() -> io::Result<()> {
    fork_and_exit_parent()?;

    // SAFETY: plain syscall without pointers
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    // The session leader exits so the daemon can never reacquire a terminal
    fork_and_exit_parent()?;

    std::env::set_current_dir("/")?;
    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid; dup2 replaces `target` atomically
        if unsafe { libc::dup2(null.as_raw_fd(), target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn fork_and_exit_parent() -> io::Result<()> {
    // SAFETY: called before any other thread exists
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(()),
        // SAFETY: the parent leaves without running destructors or atexit handlers
        _ => unsafe { libc::_exit(0) },
    }
}
