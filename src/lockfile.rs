//! Worker singleton lock: a `worker.pid` file in the data directory holding
//! PID and port. A live PID blocks a second worker; a stale one is taken
//! over with a warning.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const LOCK_FILE: &str = "worker.pid";

#[derive(Debug, Serialize, Deserialize)]
pub struct LockContents {
    pub pid: u32,
    pub port: u16,
}

/// Held for the worker's lifetime; the file is removed on drop.
pub struct WorkerLock {
    path: PathBuf,
}

impl WorkerLock {
    /// Acquire the singleton lock, replacing a stale one.
    pub fn acquire(data_dir: &Path, port: u16) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let path = data_dir.join(LOCK_FILE);

        if let Some(existing) = read_lock(&path) {
            if process_alive(existing.pid) {
                anyhow::bail!(
                    "worker already running (pid {}, port {})",
                    existing.pid,
                    existing.port
                );
            }
            warn!(pid = existing.pid, "replacing stale worker lock");
        }

        let contents = LockContents {
            pid: std::process::id(),
            port,
        };
        std::fs::write(&path, serde_json::to_string(&contents)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(pid = contents.pid, port, "worker lock acquired");

        Ok(Self { path })
    }
}

impl Drop for WorkerLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove worker lock");
        }
    }
}

/// Read the lock left by a (possibly dead) worker, if any.
pub fn read_lock(path: &Path) -> Option<LockContents> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without sending anything.
    unsafe { libc_kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Without a cheap probe, assume alive and let the operator remove the file.
    true
}

#[cfg(unix)]
extern "C" {
    #[link_name = "kill"]
    fn libc_kill(pid: i32, sig: i32) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(LOCK_FILE);

        {
            let _lock = WorkerLock::acquire(dir.path(), 37777).unwrap();
            let contents = read_lock(&lock_path).unwrap();
            assert_eq!(contents.pid, std::process::id());
            assert_eq!(contents.port, 37777);
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn second_acquire_by_live_process_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = WorkerLock::acquire(dir.path(), 37777).unwrap();
        // Our own PID is alive, so a second acquire must fail.
        assert!(WorkerLock::acquire(dir.path(), 37778).is_err());
    }

    #[test]
    fn stale_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(LOCK_FILE);
        // Far above any real pid_max, so the probe reports it dead.
        std::fs::write(&lock_path, r#"{"pid": 999999999, "port": 1}"#).unwrap();

        let _lock = WorkerLock::acquire(dir.path(), 37777).unwrap();
        assert_eq!(read_lock(&lock_path).unwrap().port, 37777);
    }
}
