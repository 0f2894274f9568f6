//! Registry store (spec §4.1): load/save the JSON document, plus the
//! locked-mutation primitives every other module builds on.

use crate::error::MonitorResult;
use crate::lock;
use crate::types::{ProcessEntry, ProcessState, Registry, RegistryStats};
use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Registry store backed by a JSON file on disk, guarded by an advisory
/// lock with staleness-steal semantics (`lock.rs`).
pub struct RegistryStore {
    registry_path: PathBuf,
    instance_id: String,
    registry: Registry,
}

impl RegistryStore {
    pub fn new<P: AsRef<Path>>(path: P, instance_id: impl Into<String>) -> Self {
        let instance_id = instance_id.into();
        Self {
            registry_path: PathBuf::from(path.as_ref()),
            registry: Registry::new(instance_id.clone()),
            instance_id,
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.registry_path.with_extension("lock")
    }

    fn lock_info_path(&self) -> PathBuf {
        self.registry_path.with_extension("lock.info")
    }

    /// True if a registry document already exists on disk (spec §4.1 `exists`).
    pub fn exists(&self) -> bool {
        self.registry_path.exists()
    }

    /// Load from disk, creating an empty registry document if absent
    /// (spec §4.1 `initialize`/`load`).
    pub fn load(&mut self) -> MonitorResult<()> {
        if !self.registry_path.exists() {
            self.initialize()?;
            return Ok(());
        }

        let content = fs::read_to_string(&self.registry_path)?;
        self.registry = serde_json::from_str(&content)?;
        Ok(())
    }

    /// Create a fresh empty registry document (spec §4.1 `initialize`).
    pub fn initialize(&mut self) -> MonitorResult<()> {
        if let Some(parent) = self.registry_path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.registry = Registry::new(self.instance_id.clone());
        self.save()?;
        info!(path = %self.registry_path.display(), "initialized new registry");
        Ok(())
    }

    /// Atomic write: temp file + rename, then restrict permissions to the
    /// owner (teacher's `RegistryManager::save` pattern).
    pub fn save(&self) -> MonitorResult<()> {
        let json = serde_json::to_string_pretty(&self.registry)?;

        let tmp_path = self.registry_path.with_extension("json.tmp");
        fs::write(&tmp_path, &json)?;
        fs::rename(&tmp_path, &self.registry_path)?;
        fs::set_permissions(&self.registry_path, Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Acquire the registry lock, re-read from disk, run `f`, save, release
    /// (spec §4.1 `withLock`). Never invoke anything that performs a
    /// network call from inside `f` (spec §5).
    pub fn with_lock<F, T>(&mut self, operation: &str, f: F) -> MonitorResult<T>
    where
        F: FnOnce(&mut Registry) -> T,
    {
        if let Some(parent) = self.registry_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let _guard = lock::acquire(
            &self.lock_path(),
            &self.lock_info_path(),
            &self.instance_id,
            operation,
        )?;

        if self.registry_path.exists() {
            let content = fs::read_to_string(&self.registry_path)?;
            self.registry = serde_json::from_str(&content)?;
        }

        let result = f(&mut self.registry);
        self.registry.touch();
        self.save()?;

        Ok(result)
    }

    /// Read-only view under lock, without re-saving (spec §4.1
    /// `withLockReadOnly`): still re-reads from disk to see the latest
    /// state from other instances, but performs no write back.
    pub fn with_lock_read_only<F, T>(&mut self, operation: &str, f: F) -> MonitorResult<T>
    where
        F: FnOnce(&Registry) -> T,
    {
        let _guard = lock::acquire(
            &self.lock_path(),
            &self.lock_info_path(),
            &self.instance_id,
            operation,
        )?;

        if self.registry_path.exists() {
            let content = fs::read_to_string(&self.registry_path)?;
            self.registry = serde_json::from_str(&content)?;
        }

        Ok(f(&self.registry))
    }

    pub fn get(&self, id: &str) -> Option<&ProcessEntry> {
        self.registry.get(id)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn upsert(&mut self, entry: ProcessEntry) -> MonitorResult<()> {
        self.with_lock("upsert", |r| r.insert(entry))
    }

    pub fn remove(&mut self, id: &str) -> MonitorResult<Option<ProcessEntry>> {
        let id = id.to_string();
        self.with_lock("remove", move |r| r.remove(&id))
    }

    /// Aggregate counters for the `stats` CLI command and
    /// `GET /monitor/status` (spec §3's supplemented introspection).
    pub fn stats(&self) -> RegistryStats {
        let processes = self.registry.processes.values();
        let mut stats = RegistryStats {
            total: 0,
            running: 0,
            stopped: 0,
            failed: 0,
            disabled: 0,
        };
        for entry in processes {
            stats.total += 1;
            match entry.state {
                ProcessState::Running => stats.running += 1,
                ProcessState::Stopped => stats.stopped += 1,
                ProcessState::Failed => stats.failed += 1,
                ProcessState::Disabled => stats.disabled += 1,
                ProcessState::Starting | ProcessState::Stopping => {}
            }
        }
        stats
    }

    /// Prune `stopped`/`failed` entries whose `lastStoppedAt` predates the
    /// cutoff (supplemented housekeeping feature, SPEC_FULL.md §3).
    pub fn cleanup(&mut self, days: u64) -> MonitorResult<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(days as i64);
        self.with_lock("cleanup", move |r| {
            let stale: Vec<String> = r
                .processes
                .iter()
                .filter(|(_, e)| {
                    matches!(e.state, ProcessState::Stopped | ProcessState::Failed)
                        && e.last_stopped_at.map_or(false, |t| t < cutoff)
                })
                .map(|(id, _)| id.clone())
                .collect();
            let removed = stale.len();
            for id in &stale {
                r.remove(id);
                debug!(process_id = %id, "removed stale registry entry");
            }
            removed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProcessConfig;
    use std::collections::HashMap;

    fn config(id: &str) -> ProcessConfig {
        ProcessConfig {
            id: id.to_string(),
            name: id.to_string(),
            command: "/bin/true".to_string(),
            args: vec![],
            working_dir: None,
            env: HashMap::new(),
            autostart: false,
            restart_policy: None,
            aliveness_check: None,
        }
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let mut store = RegistryStore::new(&path, "inst-1");
        store.load().unwrap();
        store.upsert(ProcessEntry::new(config("svc-a"))).unwrap();

        let mut reloaded = RegistryStore::new(&path, "inst-1");
        reloaded.load().unwrap();
        assert!(reloaded.get("svc-a").is_some());
    }

    #[test]
    fn concurrent_upsert_keeps_all_entries() {
        use std::sync::Arc;
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("registry.json"));

        let mut init = RegistryStore::new(path.as_path(), "inst-1");
        init.load().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let p = Arc::clone(&path);
                thread::spawn(move || {
                    let mut store = RegistryStore::new(p.as_path(), "inst-1");
                    store.load().unwrap();
                    store
                        .upsert(ProcessEntry::new(config(&format!("svc-{i}"))))
                        .unwrap();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let mut verify = RegistryStore::new(path.as_path(), "inst-1");
        verify.load().unwrap();
        for i in 0..4 {
            assert!(
                verify.get(&format!("svc-{i}")).is_some(),
                "svc-{i} was lost to a concurrent-write race"
            );
        }
    }

    #[test]
    fn stats_counts_by_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let mut store = RegistryStore::new(&path, "inst-1");
        store.load().unwrap();

        let mut running = ProcessEntry::new(config("running"));
        running.state = ProcessState::Running;
        running.pid = Some(1234);
        store.upsert(running).unwrap();
        store.upsert(ProcessEntry::new(config("stopped"))).unwrap();

        let stats = store.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.stopped, 1);
    }
}
