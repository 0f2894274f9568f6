//! Liveness/startup HTTP probing (spec §4.4). New relative to the teacher,
//! which has no probing concept; HTTP client usage follows the pattern
//! the `ferrex-*` crates use `reqwest` for outbound calls.

use crate::registry::RegistryStore;
use crate::types::{FailAction, ProcessState};
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

pub struct Prober {
    registry_path: PathBuf,
    instance_id: String,
    client: Client,
}

impl Prober {
    pub fn new(registry_path: PathBuf, instance_id: String) -> Self {
        Self {
            registry_path,
            instance_id,
            client: Client::new(),
        }
    }

    /// One probing pass over every entry with an enabled aliveness check
    /// (spec §4.4). Startup-gated entries run their bounded probe phase;
    /// steady-state entries accumulate `consecutiveFailures`.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let mut store = RegistryStore::new(&self.registry_path, self.instance_id.clone());
        store.load()?;

        let targets: Vec<_> = store
            .registry()
            .processes
            .iter()
            .filter(|(_, e)| {
                e.state == ProcessState::Running
                    && e.config
                        .aliveness_check
                        .as_ref()
                        .map(|c| c.enabled)
                        .unwrap_or(false)
            })
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();

        for (id, entry) in targets {
            let check = entry.config.aliveness_check.as_ref().unwrap();
            let Some(url) = &check.url else { continue };

            let ok = self.probe_once(url, Duration::from_millis(check.timeout_ms)).await;
            debug!(process_id = %id, ok, "aliveness probe result");

            if ok {
                self.on_success(&mut store, &id).await?;
            } else {
                self.on_failure(&mut store, &id).await?;
            }
        }

        Ok(())
    }

    async fn probe_once(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(url, error = %e, "probe request failed");
                false
            }
        }
    }

    async fn on_success(&self, store: &mut RegistryStore, id: &str) -> anyhow::Result<()> {
        let id = id.to_string();
        store.with_lock("probe-success", move |registry| {
            if let Some(e) = registry.get_mut(&id) {
                e.consecutive_failures = 0;
                e.startup_completed = true;
            }
        })?;
        Ok(())
    }

    /// Apply the startup-gate or steady-state failure policy (spec §4.4):
    /// a bounded-attempt `failAction` during the entry's startup phase,
    /// else the permanent `consecutiveFailuresRequired` threshold once
    /// `startup_completed` is set (i.e. the entry has seen a first success
    /// since its last start).
    async fn on_failure(&self, store: &mut RegistryStore, id: &str) -> anyhow::Result<()> {
        let id_owned = id.to_string();
        let outcome = store.with_lock("probe-failure", move |registry| {
            let Some(entry) = registry.get_mut(&id_owned) else {
                return None;
            };
            entry.consecutive_failures += 1;

            let Some(check) = entry.config.aliveness_check.clone() else {
                return None;
            };

            if !entry.startup_completed {
                if let Some(startup) = &check.startup_check {
                    if startup.enabled && entry.consecutive_failures >= startup.max_attempts {
                        return Some((startup.fail_action, entry.consecutive_failures));
                    }
                    if startup.enabled {
                        return None;
                    }
                }
            }

            if entry.consecutive_failures >= check.consecutive_failures_required {
                return Some((FailAction::Restart, entry.consecutive_failures));
            }
            None
        })?;

        let Some((action, failures)) = outcome else {
            return Ok(());
        };

        match action {
            FailAction::Restart => {
                warn!(process_id = %id, failures, "aliveness check failed, marking for restart");
                let id_owned = id.to_string();
                store.with_lock("probe-mark-failed", move |registry| {
                    if let Some(e) = registry.get_mut(&id_owned) {
                        e.state = ProcessState::Failed;
                        e.consecutive_failures = 0;
                    }
                })?;
            }
            FailAction::Disable => {
                warn!(process_id = %id, failures, "aliveness check failed, disabling");
                let id_owned = id.to_string();
                store.with_lock("probe-disable", move |registry| {
                    if let Some(e) = registry.get_mut(&id_owned) {
                        e.state = ProcessState::Disabled;
                        e.enabled = false;
                    }
                })?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlivenessCheck, FailAction, ProcessConfig, ProcessEntry, StartupCheck};
    use std::collections::HashMap;

    #[tokio::test]
    async fn probe_once_returns_false_on_connection_refused() {
        let prober = Prober::new(PathBuf::from("/tmp/does-not-matter.json"), "inst".into());
        let ok = prober
            .probe_once("http://127.0.0.1:1", Duration::from_millis(200))
            .await;
        assert!(!ok);
    }

    fn entry_with_check() -> ProcessEntry {
        let config = ProcessConfig {
            id: "svc".to_string(),
            name: "svc".to_string(),
            command: "/bin/true".to_string(),
            args: vec![],
            working_dir: None,
            env: HashMap::new(),
            autostart: false,
            restart_policy: None,
            aliveness_check: Some(AlivenessCheck {
                enabled: true,
                url: Some("http://127.0.0.1:1/health".to_string()),
                status_url: None,
                interval_ms: 1000,
                timeout_ms: 200,
                consecutive_failures_required: 5,
                startup_check: Some(StartupCheck {
                    enabled: true,
                    initial_delay_ms: 0,
                    check_interval_ms: 100,
                    max_attempts: 2,
                    fail_action: FailAction::Disable,
                }),
            }),
        };
        let mut entry = ProcessEntry::new(config);
        entry.state = ProcessState::Running;
        entry
    }

    #[tokio::test]
    async fn on_failure_applies_startup_fail_action_before_first_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let prober = Prober::new(path.clone(), "inst-1".to_string());

        let mut store = RegistryStore::new(&path, "inst-1");
        store.load().unwrap();
        store.upsert(entry_with_check()).unwrap();

        prober.on_failure(&mut store, "svc").await.unwrap();
        prober.on_failure(&mut store, "svc").await.unwrap();

        let reloaded = store.get("svc").unwrap();
        assert_eq!(reloaded.state, ProcessState::Disabled, "startup_check.maxAttempts reached should disable");
    }

    #[tokio::test]
    async fn on_failure_ignores_startup_check_once_completed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let prober = Prober::new(path.clone(), "inst-1".to_string());

        let mut store = RegistryStore::new(&path, "inst-1");
        store.load().unwrap();
        let mut entry = entry_with_check();
        entry.startup_completed = true;
        store.upsert(entry).unwrap();

        // Two failures would have tripped startup_check.max_attempts=2,
        // but startup_completed=true means only consecutiveFailuresRequired
        // (5) governs now.
        prober.on_failure(&mut store, "svc").await.unwrap();
        prober.on_failure(&mut store, "svc").await.unwrap();

        let reloaded = store.get("svc").unwrap();
        assert_eq!(reloaded.state, ProcessState::Running);
        assert_eq!(reloaded.consecutive_failures, 2);
    }
}
