//! Exclusive per-tunnel lock shared by every engine process
//!
//! Each CLI invocation builds its own [`Controller`](crate::Controller), so
//! an in-memory mutex alone cannot keep two invocations from starting the
//! same tunnel. The lock is an advisory `flock` on a file in the service
//! directory, released when the guard is dropped or the process exits.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{EngineError, Result};

/// Held lock; dropping it releases the lock
#[derive(Debug)]
pub struct TunnelLock {
    _file: File,
    path: PathBuf,
}

impl TunnelLock {
    /// Wait until the lock at `path` is free, then take it
    pub async fn acquire(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(path))
            .await
            .map_err(|e| EngineError::Process(format!("lock task failed: {}", e)))?
    }

    fn acquire_blocking(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| EngineError::storage(&path, e))?;

        lock_exclusive(&file).map_err(|e| EngineError::storage(&path, e))?;
        debug!("Acquired {:?}", path);

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_holder_waits_for_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("frpc.lock");

        let first = TunnelLock::acquire(&path).await.unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let waiter = tokio::spawn({
            let path = path.clone();
            let acquired = acquired.clone();
            async move {
                let lock = TunnelLock::acquire(&path).await.unwrap();
                acquired.store(true, Ordering::SeqCst);
                lock
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!acquired.load(Ordering::SeqCst));

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(second.path(), path.as_path());
    }
}
