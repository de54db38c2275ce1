//! Host-wide run lock.
//!
//! An advisory `flock` on `<root>/.lock`. The kernel drops it when the
//! process exits, so a crashed run never leaves a stuck lock behind.

use crate::utils::errors::Result;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Held for the duration of a run; released on drop.
#[derive(Debug)]
pub struct RunLock {
    _file: Flock<File>,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without waiting. `Ok(None)` means another run holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => return Ok(None),
            Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
        };

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        locked.set_len(0)?;
        writeln!(locked, "{} {}", std::process::id(), host)?;
        locked.sync_data()?;

        debug!("Acquired run lock {}", path.display());
        Ok(Some(Self {
            _file: locked,
            path: path.to_path_buf(),
        }))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        debug!("Released run lock {}", self.path.display());
    }
}

/// Contents of a lock file: `<pid> <host>`, for the skip message.
pub fn holder(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_refused() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join(".lock");

        let first = RunLock::try_acquire(&path)?;
        assert!(first.is_some());
        assert!(RunLock::try_acquire(&path)?.is_none());

        let holder = holder(&path).unwrap();
        assert!(holder.starts_with(&std::process::id().to_string()));
        Ok(())
    }

    #[test]
    fn test_lock_released_on_drop() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join(".lock");

        drop(RunLock::try_acquire(&path)?);
        assert!(RunLock::try_acquire(&path)?.is_some());
        Ok(())
    }
}
