// src/system/locks.rs

//! Courtesy wait on toolkit lock files held by this process.
//!
//! Lock files are named `<a>.<b>.<c>.<pid>.<...>.lock`; only locks whose
//! fourth segment is our own process id are waited on.

use crate::constants::{LOCK_FILE_EXT, LOCK_MAX_WAIT_SECS, LOCK_POLL_INTERVAL_SECS};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock file path does not exist!. Quitting... ({0})")]
    MissingFolder(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    Released { waited: Duration },
    TimedOut,
}

pub fn wait_for_lock_release(folder: &Path) -> Result<LockWait, LockError> {
    wait_for_lock_release_with(
        folder,
        std::process::id(),
        Duration::from_secs(LOCK_POLL_INTERVAL_SECS),
        Duration::from_secs(LOCK_MAX_WAIT_SECS),
    )
}

/// Checks once right away, then every `interval` until the locks are gone
/// or more than `max_wait` has passed.
pub fn wait_for_lock_release_with(
    folder: &Path,
    pid: u32,
    interval: Duration,
    max_wait: Duration,
) -> Result<LockWait, LockError> {
    if !folder.exists() {
        return Err(LockError::MissingFolder(folder.to_path_buf()));
    }
    let start = Instant::now();
    let mut waited = Duration::ZERO;
    while has_own_lock(folder, pid) {
        thread::sleep(interval);
        waited += interval;
        if !has_own_lock(folder, pid) {
            break;
        }
        if waited > max_wait {
            log::warn!("lock file release timed out!. Quitting...");
            return Ok(LockWait::TimedOut);
        }
    }
    log::debug!("Lock wait on {} took {:?}", folder.display(), start.elapsed());
    Ok(LockWait::Released { waited })
}

fn has_own_lock(folder: &Path, pid: u32) -> bool {
    WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| name.to_lowercase().ends_with(LOCK_FILE_EXT))
        .any(|name| {
            name.split('.')
                .nth(3)
                .and_then(|segment| segment.parse::<u32>().ok())
                == Some(pid)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const TICK: Duration = Duration::from_millis(10);

    #[test]
    fn test_missing_folder_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.gdb");
        assert!(matches!(
            wait_for_lock_release_with(&missing, 1, TICK, TICK),
            Err(LockError::MissingFolder(_))
        ));
    }

    #[test]
    fn test_foreign_locks_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("_gdb.host.1234.9999.sr.lock"), "").unwrap();
        fs::write(dir.path().join("a.b.c.42.txt"), "").unwrap();
        let outcome = wait_for_lock_release_with(dir.path(), 42, TICK, TICK).unwrap();
        assert_eq!(outcome, LockWait::Released { waited: Duration::ZERO });
    }

    #[test]
    fn test_own_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("_gdb.host.x.42.sr.LOCK"), "").unwrap();
        let outcome = wait_for_lock_release_with(dir.path(), 42, TICK, TICK * 3).unwrap();
        assert_eq!(outcome, LockWait::TimedOut);
    }
}
