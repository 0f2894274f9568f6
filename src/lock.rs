//! Advisory lock with staleness detection and steal discipline (spec §4.1).
//!
//! The teacher's `RegistryManager::locked_mutate` used a bare `fs2`
//! exclusive flock with no visibility into who held it or for how long.
//! This module keeps that flock as the underlying OS-level mutex but adds
//! a sibling `LockInfo` record written right after acquisition, so a
//! contending holder can tell a genuinely stuck lock (holder pid dead, or
//! timestamp past the staleness threshold) from one that's merely busy,
//! and steal it instead of blocking forever. Reused unchanged by the
//! heartbeat ledger lock (spec §4.5).

use crate::error::{MonitorError, MonitorResult};
use crate::process::ProcessManager;
use fs2::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STALENESS: Duration = Duration::from_secs(30);
const RETRY_BASE_DELAY_MS: u64 = 25;
const RETRY_MAX_DELAY_MS: u64 = 250;

/// Diagnostic record written alongside the flock so a contender can judge
/// whether the current holder is alive and recent (spec §4.1 "LockInfo").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder_instance_id: String,
    pub pid: i32,
    pub operation: String,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

impl LockInfo {
    fn is_stale(&self, staleness: Duration) -> bool {
        if !ProcessManager::is_alive(self.pid) {
            return true;
        }
        let age = chrono::Utc::now().signed_duration_since(self.acquired_at);
        age.to_std().map(|a| a > staleness).unwrap_or(false)
    }
}

/// A held lock; releases the underlying flock and removes the info file
/// when dropped.
pub struct LockGuard {
    file: File,
    info_path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.info_path);
    }
}

/// Acquire `lock_path`'s advisory lock, stealing it if the current holder
/// is dead or stale, retrying with jittered backoff until `timeout`
/// elapses.
pub fn acquire(
    lock_path: &Path,
    info_path: &Path,
    instance_id: &str,
    operation: &str,
) -> MonitorResult<LockGuard> {
    acquire_with(
        lock_path,
        info_path,
        instance_id,
        operation,
        DEFAULT_TIMEOUT,
        DEFAULT_STALENESS,
    )
}

pub fn acquire_with(
    lock_path: &Path,
    info_path: &Path,
    instance_id: &str,
    operation: &str,
    timeout: Duration,
    staleness: Duration,
) -> MonitorResult<LockGuard> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let deadline = Instant::now() + timeout;
    let mut rng = rand::thread_rng();

    loop {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                write_info(info_path, instance_id, operation)?;
                return Ok(LockGuard {
                    file,
                    info_path: info_path.to_path_buf(),
                });
            }
            Err(_) => {
                if let Some(info) = read_info(info_path) {
                    if info.is_stale(staleness) {
                        warn!(
                            holder = %info.holder_instance_id,
                            pid = info.pid,
                            operation = %info.operation,
                            "stealing stale lock"
                        );
                        // A stale holder's flock is tied to its own open
                        // file description and may still be live (a hung
                        // process, not a dead one). Unlinking and
                        // recreating the lock path gives a fresh inode, so
                        // our new handle never contends with the stale
                        // holder's descriptor regardless of whether that
                        // process is still running.
                        drop(file);
                        let _ = fs::remove_file(lock_path);
                        let fresh = OpenOptions::new()
                            .create(true)
                            .write(true)
                            .open(lock_path)?;
                        if fresh.try_lock_exclusive().is_ok() {
                            write_info(info_path, instance_id, operation)?;
                            return Ok(LockGuard {
                                file: fresh,
                                info_path: info_path.to_path_buf(),
                            });
                        }
                    }
                }

                if Instant::now() >= deadline {
                    return Err(MonitorError::LockTimeout);
                }

                let jitter = rng.gen_range(RETRY_BASE_DELAY_MS..=RETRY_MAX_DELAY_MS);
                debug!(lock = %lock_path.display(), jitter_ms = jitter, "lock busy, retrying");
                std::thread::sleep(Duration::from_millis(jitter));
            }
        }
    }
}

fn write_info(info_path: &Path, instance_id: &str, operation: &str) -> MonitorResult<()> {
    let info = LockInfo {
        holder_instance_id: instance_id.to_string(),
        pid: std::process::id() as i32,
        operation: operation.to_string(),
        acquired_at: chrono::Utc::now(),
    };
    let json = serde_json::to_string(&info)?;
    fs::write(info_path, json)?;
    Ok(())
}

fn read_info(info_path: &Path) -> Option<LockInfo> {
    let content = fs::read_to_string(info_path).ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_then_release_allows_next_acquire() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("r.lock");
        let info_path = dir.path().join("r.lock.info");

        {
            let _g = acquire(&lock_path, &info_path, "inst-a", "test").unwrap();
            assert!(info_path.exists());
        }
        assert!(!info_path.exists());

        let _g2 = acquire(&lock_path, &info_path, "inst-b", "test").unwrap();
    }

    #[test]
    fn steals_lock_held_by_dead_pid() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("r.lock");
        let info_path = dir.path().join("r.lock.info");

        // Simulate a stale LockInfo from a pid that can't be alive.
        let stale = LockInfo {
            holder_instance_id: "ghost".to_string(),
            pid: 999_999,
            operation: "ghost-op".to_string(),
            acquired_at: chrono::Utc::now(),
        };
        fs::write(&info_path, serde_json::to_string(&stale).unwrap()).unwrap();

        let guard = acquire_with(
            &lock_path,
            &info_path,
            "inst-a",
            "test",
            Duration::from_millis(500),
            Duration::from_secs(30),
        );
        assert!(guard.is_ok());
    }

    #[test]
    fn steals_lock_genuinely_held_by_stale_holder() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("r.lock");
        let info_path = dir.path().join("r.lock.info");

        // Actually hold the flock (not just a fake LockInfo sidecar),
        // tagged with a dead pid so `is_stale` reports true.
        let held = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .unwrap();
        held.try_lock_exclusive().unwrap();
        let stale = LockInfo {
            holder_instance_id: "ghost".to_string(),
            pid: 999_999,
            operation: "ghost-op".to_string(),
            acquired_at: chrono::Utc::now(),
        };
        fs::write(&info_path, serde_json::to_string(&stale).unwrap()).unwrap();

        let guard = acquire_with(
            &lock_path,
            &info_path,
            "inst-a",
            "test",
            Duration::from_millis(500),
            Duration::from_secs(30),
        );
        assert!(
            guard.is_ok(),
            "steal must break a flock genuinely held by a stale holder"
        );

        drop(held);
    }
}
