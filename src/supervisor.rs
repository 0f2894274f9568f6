//! Supervision loop (spec §4.3): Observe → Aliveness reset → Decide
//! restart → Act, once per tick for every registry entry. Grounded in the
//! DataDog `ProcessSupervisionService::attempt_restart` state machine
//! (backoff calculation, start-limit check, mark-then-save sequencing)
//! and the teacher's `run_watchdog` tick shape (load → observe → decide →
//! report → sleep).

use crate::process::ProcessManager;
use crate::registry::RegistryStore;
use crate::types::{ProcessEntry, ProcessState};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub struct Supervisor {
    registry_path: PathBuf,
    log_dir: PathBuf,
    instance_id: String,
    tick_interval: Duration,
}

impl Supervisor {
    pub fn new(
        registry_path: PathBuf,
        log_dir: PathBuf,
        instance_id: String,
        tick_interval: Duration,
    ) -> Self {
        Self {
            registry_path,
            log_dir,
            instance_id,
            tick_interval,
        }
    }

    /// Run the supervision loop forever (spec §4.3 "runs continuously").
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(interval_ms = self.tick_interval.as_millis() as u64, "supervisor starting");

        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "supervision tick failed");
            }
            sleep(self.tick_interval).await;
        }
    }

    /// Run one tick over every entry (exposed separately so tests and the
    /// `check`/`rehydrate` CLI paths can force a single pass).
    pub async fn tick(&self) -> anyhow::Result<()> {
        let mut store = RegistryStore::new(&self.registry_path, self.instance_id.clone());
        store.load()?;

        let ids: Vec<String> = store.registry().processes.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.tick_one(&mut store, &id).await {
                warn!(process_id = %id, error = %e, "tick failed for process");
            }
        }
        Ok(())
    }

    async fn tick_one(&self, store: &mut RegistryStore, id: &str) -> anyhow::Result<()> {
        let observed = self.observe(store, id)?;
        if !observed {
            return Ok(());
        }
        self.maybe_reset_failures(store, id)?;
        self.decide_and_act(store, id).await
    }

    /// Observe: cross-check pid liveness + start-time token, nulling `pid`
    /// and marking the state `failed` if the process died underneath us.
    /// Returns `false` if the entry no longer exists.
    fn observe(&self, store: &mut RegistryStore, id: &str) -> anyhow::Result<bool> {
        let id = id.to_string();
        let result = store.with_lock("observe", move |registry| {
            let entry = match registry.get_mut(&id) {
                Some(e) => e,
                None => return false,
            };

            if entry.state != ProcessState::Running {
                return true;
            }

            let still_alive = match entry.pid {
                Some(pid) => {
                    let token_matches = entry
                        .start_time_token
                        .as_deref()
                        .map(|t| ProcessManager::validate_process(pid, t))
                        .unwrap_or(false);
                    token_matches && ProcessManager::is_alive(pid)
                }
                None => false,
            };

            if !still_alive {
                warn!(process_id = %id, "observed process death");
                entry.pid = None;
                entry.state = ProcessState::Failed;
                entry.last_stopped_at = Some(chrono::Utc::now());
                entry.consecutive_failures += 1;
            }

            true
        })?;
        Ok(result)
    }

    /// Reset the backoff counter once the entry has been running stably
    /// for longer than its policy's `resetAfterMs` (spec §4.3 step 2).
    fn maybe_reset_failures(&self, store: &mut RegistryStore, id: &str) -> anyhow::Result<()> {
        let id = id.to_string();
        store.with_lock("reset-check", move |registry| {
            let entry = match registry.get_mut(&id) {
                Some(e) => e,
                None => return,
            };
            if entry.state != ProcessState::Running || entry.restart_attempts == 0 {
                return;
            }
            let Some(policy) = entry.config.restart_policy.as_ref() else {
                return;
            };
            let Some(started) = entry.last_started_at else {
                return;
            };
            let uptime = chrono::Utc::now().signed_duration_since(started);
            if uptime.num_milliseconds() as u64 >= policy.reset_after_ms {
                debug!(process_id = %id, "restart backoff reset after stable uptime");
                entry.restart_attempts = 0;
            }
        })
    }

    /// Decide restart eligibility per policy, then act (spawn or disable).
    async fn decide_and_act(&self, store: &mut RegistryStore, id: &str) -> anyhow::Result<()> {
        let snapshot = store.with_lock_read_only("decide", {
            let id = id.to_string();
            move |registry| registry.get(&id).cloned()
        })?;
        let Some(entry) = snapshot else { return Ok(()) };

        if !entry.enabled || !entry.state.is_terminal_for_restart() || !entry.config.autostart {
            return Ok(());
        }

        let Some(policy) = entry.config.restart_policy.clone() else {
            return Ok(());
        };

        let should_restart = policy.retry_indefinitely || entry.restart_attempts < policy.max_attempts;
        if !should_restart {
            warn!(process_id = %id, attempts = entry.restart_attempts, "restart attempts exhausted, disabling");
            let id_owned = id.to_string();
            store.with_lock("disable-exhausted", move |registry| {
                if let Some(e) = registry.get_mut(&id_owned) {
                    e.state = ProcessState::Disabled;
                    e.enabled = false;
                }
            })?;
            return Ok(());
        }

        let delay = if entry.restart_attempts < policy.max_attempts {
            policy.backoff_for_attempt(entry.restart_attempts)
        } else {
            Duration::from_millis(policy.indefinite_interval_ms)
        };
        info!(process_id = %id, attempt = entry.restart_attempts, delay_ms = delay.as_millis() as u64, "restarting process");
        sleep(delay).await;

        self.spawn_entry(store, id, &entry).await
    }

    async fn spawn_entry(
        &self,
        store: &mut RegistryStore,
        id: &str,
        entry: &ProcessEntry,
    ) -> anyhow::Result<()> {
        let id_owned = id.to_string();
        store.with_lock("mark-starting", {
            let id_owned = id_owned.clone();
            move |registry| {
                if let Some(e) = registry.get_mut(&id_owned) {
                    e.state = ProcessState::Starting;
                }
            }
        })?;

        match ProcessManager::start_process(entry, &self.log_dir) {
            Ok((pid, start_time)) => {
                store.with_lock("mark-running", {
                    let id_owned = id_owned.clone();
                    move |registry| {
                        if let Some(e) = registry.get_mut(&id_owned) {
                            e.pid = Some(pid);
                            e.start_time_token = Some(start_time);
                            e.state = ProcessState::Running;
                            e.last_started_at = Some(chrono::Utc::now());
                            e.restart_attempts += 1;
                            e.startup_completed = false;
                        }
                    }
                })?;
                Ok(())
            }
            Err(e) => {
                warn!(process_id = %id, error = %e, "failed to spawn process");
                store.with_lock("mark-failed", move |registry| {
                    if let Some(e) = registry.get_mut(&id_owned) {
                        e.state = ProcessState::Failed;
                        e.restart_attempts += 1;
                        e.consecutive_failures += 1;
                    }
                })?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProcessConfig, RestartPolicy};
    use std::collections::HashMap;

    fn supervisor(registry_path: PathBuf) -> Supervisor {
        Supervisor::new(
            registry_path,
            std::env::temp_dir().join("procmind-supervisor-test-logs"),
            "inst-1".to_string(),
            Duration::from_millis(50),
        )
    }

    fn config(id: &str) -> ProcessConfig {
        ProcessConfig {
            id: id.to_string(),
            name: id.to_string(),
            command: "/bin/true".to_string(),
            args: vec![],
            working_dir: None,
            env: HashMap::new(),
            autostart: false,
            restart_policy: Some(RestartPolicy {
                max_attempts: 1,
                backoff_intervals_ms: vec![1],
                reset_after_ms: 10,
                retry_indefinitely: false,
                indefinite_interval_ms: 1,
            }),
            aliveness_check: None,
        }
    }

    #[test]
    fn observe_marks_dead_pid_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let sup = supervisor(path.clone());

        let mut store = RegistryStore::new(&path, "inst-1");
        store.load().unwrap();
        let mut entry = ProcessEntry::new(config("dead-one"));
        entry.state = ProcessState::Running;
        entry.pid = Some(999_999);
        entry.start_time_token = Some("bogus".to_string());
        store.upsert(entry).unwrap();

        sup.observe(&mut store, "dead-one").unwrap();

        let reloaded = store.get("dead-one").unwrap();
        assert_eq!(reloaded.state, ProcessState::Failed);
        assert!(reloaded.pid.is_none());
        assert_eq!(reloaded.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn decide_and_act_disables_entry_once_attempts_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let sup = supervisor(path.clone());

        let mut store = RegistryStore::new(&path, "inst-1");
        store.load().unwrap();
        let mut entry = ProcessEntry::new(config("flapping"));
        entry.config.autostart = true;
        entry.state = ProcessState::Failed;
        entry.restart_attempts = 1;
        store.upsert(entry).unwrap();

        sup.decide_and_act(&mut store, "flapping").await.unwrap();

        let reloaded = store.get("flapping").unwrap();
        assert_eq!(reloaded.state, ProcessState::Disabled);
        assert!(!reloaded.enabled);
    }

    #[tokio::test]
    async fn decide_and_act_uses_indefinite_interval_past_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let sup = supervisor(path.clone());

        let mut store = RegistryStore::new(&path, "inst-1");
        store.load().unwrap();
        let mut entry = ProcessEntry::new(config("never-gives-up"));
        entry.config.autostart = true;
        entry.config.restart_policy = Some(RestartPolicy {
            max_attempts: 1,
            backoff_intervals_ms: vec![60_000],
            reset_after_ms: 60_000,
            retry_indefinitely: true,
            indefinite_interval_ms: 1,
        });
        entry.state = ProcessState::Failed;
        entry.restart_attempts = 1;
        store.upsert(entry).unwrap();

        sup.decide_and_act(&mut store, "never-gives-up").await.unwrap();

        let reloaded = store.get("never-gives-up").unwrap();
        assert_eq!(reloaded.state, ProcessState::Running, "a 60s backoff interval would have timed out this test");
    }

    #[test]
    fn maybe_reset_failures_zeroes_attempts_after_stable_uptime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let sup = supervisor(path.clone());

        let mut store = RegistryStore::new(&path, "inst-1");
        store.load().unwrap();
        let mut entry = ProcessEntry::new(config("stable"));
        entry.state = ProcessState::Running;
        entry.restart_attempts = 2;
        entry.last_started_at = Some(chrono::Utc::now() - chrono::Duration::milliseconds(100));
        store.upsert(entry).unwrap();

        sup.maybe_reset_failures(&mut store, "stable").unwrap();

        let reloaded = store.get("stable").unwrap();
        assert_eq!(reloaded.restart_attempts, 0);
    }
}
