//! One worker per directory.
//!
//! The lock file holds the PID of the owning worker. A new worker replaces a missing,
//! unreadable or dead lock, waits for concurrent starters to settle, then checks that the
//! file still names it. A running worker re-checks before every iteration.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use sysinfo::{Pid, ProcessesToUpdate};
use tracing::{info, instrument, warn};

const SETTLE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    pid: u32,
    process_name: String,
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn own_process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

/// Whether `pid` is a running process with our executable name. Linux truncates process
/// names, so a prefix match is enough.
fn same_program_alive(pid: u32, process_name: &str) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some_and(|process| {
        let name = process.name().to_string_lossy();
        !name.is_empty() && process_name.starts_with(name.as_ref())
    })
}

impl LockFile {
    pub fn acquire(path: PathBuf) -> anyhow::Result<LockFile> {
        Self::acquire_with(path, SETTLE_DELAY)
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn acquire_with(path: PathBuf, settle: Duration) -> anyhow::Result<LockFile> {
        let lock = LockFile {
            path,
            pid: std::process::id(),
            process_name: own_process_name(),
        };
        if lock.locked_by_others(false) {
            bail!("Another worker is already running in this directory");
        }
        fs::write(&lock.path, format!("{}\n", lock.pid))
            .with_context(|| format!("could not write lock file {}", lock.path.display()))?;
        info!(pid = lock.pid, "Lock file created");
        std::thread::sleep(settle);
        if !lock.held_by_us() {
            bail!("Another worker took the lock file");
        }
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The lock file exists and names this process.
    pub fn held_by_us(&self) -> bool {
        !self.locked_by_others(true)
    }

    /// Before we own the lock, an unreadable file or a dead owner is acceptable. Afterwards,
    /// only our own PID is.
    fn locked_by_others(&self, require_valid: bool) -> bool {
        let Some(pid) = read_pid(&self.path) else {
            if require_valid {
                warn!(pid = self.pid, "Unable to read the lock file");
            }
            return require_valid;
        };
        if pid != self.pid && (require_valid || same_program_alive(pid, &self.process_name)) {
            warn!(pid = self.pid, owner = pid, "Another worker holds the lock file");
            return true;
        }
        false
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let owner = read_pid(&self.path);
        if owner.map_or(true, |pid| pid == self.pid) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Unable to delete lock file: {e}");
            }
        }
    }
}

#[cfg(test)]
mod lock_tests {
    use super::*;

    const NO_SETTLE: Duration = Duration::from_millis(0);

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");
        {
            let lock = LockFile::acquire_with(path.clone(), NO_SETTLE).unwrap();
            assert!(lock.held_by_us());
            assert_eq!(read_pid(&path), Some(std::process::id()));
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_dead_or_garbled_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");
        fs::write(&path, "not a pid").unwrap();
        LockFile::acquire_with(path.clone(), NO_SETTLE).unwrap();

        fs::write(&path, format!("{}\n", u32::MAX - 7)).unwrap();
        let lock = LockFile::acquire_with(path.clone(), NO_SETTLE).unwrap();
        assert!(lock.held_by_us());
    }

    #[test]
    fn test_lock_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");
        let lock = LockFile::acquire_with(path.clone(), NO_SETTLE).unwrap();

        fs::write(&path, "12345\n").unwrap();
        assert!(!lock.held_by_us());
        fs::remove_file(&path).unwrap();
        assert!(!lock.held_by_us());

        fs::write(&path, "12345\n").unwrap();
        drop(lock);
        assert!(path.exists(), "a lock owned by someone else is kept");
    }
}
