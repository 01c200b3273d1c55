use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::BackendError;

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Exclusive advisory lock on a store's `.lock` file (`flock(2)` on Unix).
///
/// One process owns a collection store at a time; the lock is released when
/// this struct is dropped (the underlying file descriptor is closed).
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
}

impl StoreLock {
    /// Acquire the lock, retrying until `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, BackendError> {
        let file = open_lock_file(path)?;
        let deadline = Instant::now() + timeout;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Self { _file: file }),
                Err(err) if is_contended(&err) => {
                    if Instant::now() >= deadline {
                        return Err(BackendError::Locked {
                            path: path.to_path_buf(),
                        });
                    }
                    thread::sleep(RETRY_INTERVAL);
                }
                Err(err) => return Err(BackendError::Io(err)),
            }
        }
    }

    /// Single non-blocking attempt.
    pub fn try_acquire(path: &Path) -> Result<Self, BackendError> {
        Self::acquire(path, Duration::ZERO)
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
