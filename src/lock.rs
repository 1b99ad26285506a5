use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use eups_man_lib::error::EupsError;

/// Ceiling on lock acquisition. Callers must not wait unboundedly.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// An advisory file lock held for the lifetime of the value. Writers take
/// exclusive locks, readers shared ones; both are bounded by a deadline
/// after which the acquisition fails with LockTimeout.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn exclusive(path: &Path, timeout: Duration) -> Result<Self, EupsError> {
        FileLock::acquire(path, timeout, true)
    }

    pub fn shared(path: &Path, timeout: Duration) -> Result<Self, EupsError> {
        FileLock::acquire(path, timeout, false)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn acquire(path: &Path, timeout: Duration, exclusive: bool) -> Result<Self, EupsError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(|err| EupsError::io(path, err))?;

        let deadline = Instant::now() + timeout;
        loop {
            let attempt = if exclusive {
                fs2::FileExt::try_lock_exclusive(&file)
            } else {
                fs2::FileExt::try_lock_shared(&file)
            };

            match attempt {
                Ok(()) => {
                    return Ok(FileLock {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(EupsError::LockTimeout {
                            path: path.to_path_buf(),
                            seconds: timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(err) => return Err(EupsError::io(path, err)),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use assert_fs::TempDir;

    use super::*;

    #[test]
    fn exclusive_lock_is_acquired_and_released() {
        let tmp_dir = TempDir::new().unwrap();
        let lock_path = tmp_dir.path().join(".lock");

        {
            let lock = FileLock::exclusive(&lock_path, DEFAULT_LOCK_TIMEOUT).unwrap();
            assert_eq!(lock.path(), lock_path.as_path());
        }

        // Released on drop, so a second acquisition succeeds immediately.
        FileLock::exclusive(&lock_path, Duration::from_millis(200)).unwrap();

        tmp_dir.close().unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let tmp_dir = TempDir::new().unwrap();
        let lock_path = tmp_dir.path().join(".cache.lock");

        let first = FileLock::shared(&lock_path, DEFAULT_LOCK_TIMEOUT).unwrap();
        let second = FileLock::shared(&lock_path, Duration::from_millis(200)).unwrap();
        drop(first);
        drop(second);

        tmp_dir.close().unwrap();
    }

    #[test]
    fn contended_exclusive_lock_times_out() {
        let tmp_dir = TempDir::new().unwrap();
        let lock_path = tmp_dir.path().join(".lock");

        let holder = FileLock::exclusive(&lock_path, DEFAULT_LOCK_TIMEOUT).unwrap();
        let result = FileLock::exclusive(&lock_path, Duration::from_millis(250));
        assert!(matches!(result, Err(EupsError::LockTimeout { .. })));
        drop(holder);

        tmp_dir.close().unwrap();
    }
}
