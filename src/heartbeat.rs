//! Heartbeat & crash detection engine (spec §4.5): an append-only ledger
//! file per operation, participants stamping their own liveness and
//! call-frame stack, reads/writes serialized by a sibling ledger-lock
//! file reusing `lock.rs`'s LockInfo/steal primitive. The detection tick
//! loop's `sleep`-vs-`stop` shape is grounded in
//! `deadlytoah-heartbeat2`'s `Heartbeat::timer_loop`, generalized from a
//! single req/rep exchange to this ledger-file multi-participant model.

use crate::error::{MonitorError, MonitorResult};
use crate::lock;
use crate::types::{CallFrame, FailureDetection, FailureKind, HeartbeatResult, Ledger};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const DEFAULT_STALENESS_MS: i64 = 15_000;

/// Handle onto one operation's ledger file, shared by every participant
/// that knows the operation id and ledger directory.
pub struct LedgerHandle {
    ledger_path: PathBuf,
    lock_path: PathBuf,
    lock_info_path: PathBuf,
    instance_id: String,
}

impl LedgerHandle {
    pub fn new(ledger_dir: &Path, operation_id: &str, instance_id: impl Into<String>) -> Self {
        let ledger_path = ledger_dir.join(format!("{operation_id}.ledger.json"));
        Self {
            lock_path: ledger_path.with_extension("ledger.lock"),
            lock_info_path: ledger_path.with_extension("ledger.lock.info"),
            ledger_path,
            instance_id: instance_id.into(),
        }
    }

    fn with_lock<F, T>(&self, operation: &str, f: F) -> MonitorResult<T>
    where
        F: FnOnce(&mut Ledger) -> T,
    {
        if let Some(parent) = self.ledger_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _guard = lock::acquire(&self.lock_path, &self.lock_info_path, &self.instance_id, operation)?;

        let mut ledger = self.read()?;
        let result = f(&mut ledger);
        let json = serde_json::to_string_pretty(&ledger)?;
        fs::write(&self.ledger_path, json)?;
        Ok(result)
    }

    fn read(&self) -> MonitorResult<Ledger> {
        if !self.ledger_path.exists() {
            return Err(MonitorError::LedgerIoError(format!(
                "ledger {} does not exist",
                self.ledger_path.display()
            )));
        }
        let content = fs::read_to_string(&self.ledger_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// `createOperation` (spec §4.5): the initiator creates the ledger
    /// and registers itself as the first participant.
    pub fn create_operation(&self, operation_id: &str) -> MonitorResult<()> {
        if let Some(parent) = self.ledger_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let ledger = Ledger::new(operation_id, &self.instance_id);
        let json = serde_json::to_string_pretty(&ledger)?;
        fs::write(&self.ledger_path, json)?;
        Ok(())
    }

    /// `joinOperation`: register a new participant in an existing ledger.
    pub fn join_operation(&self, participant_id: &str) -> MonitorResult<()> {
        let participant_id = participant_id.to_string();
        self.with_lock("join", move |ledger| {
            ledger.participants.insert(
                participant_id.clone(),
                crate::types::ParticipantRecord {
                    participant_id,
                    last_heartbeat: chrono::Utc::now(),
                    call_frames: Vec::new(),
                },
            );
        })
    }

    pub fn create_call_frame(&self, participant_id: &str, call_id: &str) -> MonitorResult<()> {
        let participant_id = participant_id.to_string();
        let call_id = call_id.to_string();
        self.with_lock("push-frame", move |ledger| {
            if let Some(p) = ledger.participants.get_mut(&participant_id) {
                p.call_frames.push(CallFrame { call_id });
            }
        })
    }

    pub fn delete_call_frame(&self, participant_id: &str, call_id: &str) -> MonitorResult<()> {
        let participant_id = participant_id.to_string();
        let call_id = call_id.to_string();
        self.with_lock("pop-frame", move |ledger| {
            if let Some(p) = ledger.participants.get_mut(&participant_id) {
                p.call_frames.retain(|f| f.call_id != call_id);
            }
        })
    }

    /// `heartbeat`: stamp the participant's liveness timestamp, returning
    /// the result the caller should inspect for abort/staleness.
    pub fn heartbeat(&self, participant_id: &str) -> MonitorResult<HeartbeatResult> {
        let participant_id = participant_id.to_string();
        self.with_lock("heartbeat", move |ledger| {
            if let Some(p) = ledger.participants.get_mut(&participant_id) {
                p.last_heartbeat = chrono::Utc::now();
            }
            let own_age_ms = ledger
                .participants
                .get(&participant_id)
                .map(|_| 0)
                .unwrap_or(0);
            let stale = stale_participants(ledger, DEFAULT_STALENESS_MS);
            HeartbeatResult {
                call_frame_count: ledger.total_call_frames(),
                own_age_ms,
                abort_flag: ledger.abort_flag,
                stale_participants: stale,
            }
        })
    }

    pub fn set_abort_flag(&self) -> MonitorResult<()> {
        self.with_lock("abort", |ledger| {
            ledger.abort_flag = true;
        })
    }

    /// `complete`: tear down the ledger and its lock-info sibling.
    pub fn complete(&self) -> MonitorResult<()> {
        let _ = fs::remove_file(&self.lock_info_path);
        fs::remove_file(&self.ledger_path).or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(())
            } else {
                Err(e)
            }
        })?;
        Ok(())
    }

    /// Detection algorithm (spec §4.5): first match wins, in order
    /// abortRequested > staleHeartbeat > childDisappeared > healthy.
    /// `childDisappeared` compares the ledger's total call-frame count
    /// against `expected_call_frames`, not participant membership — a
    /// participant can be present and heartbeating while one of its call
    /// frames has unwound unexpectedly.
    pub fn detect(&self, expected_call_frames: usize) -> MonitorResult<Option<FailureDetection>> {
        let ledger = self.read()?;

        if ledger.abort_flag {
            return Ok(Some(FailureDetection {
                participant: ledger.initiator.clone(),
                kind: FailureKind::AbortRequested,
                message: "abort flag set on ledger".to_string(),
            }));
        }

        let stale = stale_participants(&ledger, DEFAULT_STALENESS_MS);
        if !stale.is_empty() {
            return Ok(Some(FailureDetection {
                participant: stale[0].clone(),
                kind: FailureKind::StaleHeartbeat {
                    stale_participants: stale.clone(),
                },
                message: format!("{} participant(s) past staleness threshold", stale.len()),
            }));
        }

        let observed = ledger.total_call_frames();
        if observed < expected_call_frames {
            return Ok(Some(FailureDetection {
                participant: ledger.initiator.clone(),
                kind: FailureKind::ChildDisappeared {
                    observed,
                    expected: expected_call_frames,
                },
                message: format!("expected {expected_call_frames} call frames, observed {observed}"),
            }));
        }

        Ok(None)
    }

    /// Detection tick loop: sleep until the next tick or a stop signal,
    /// then run `detect` and invoke `on_failure` if anything surfaces.
    /// Shape grounded in `deadlytoah-heartbeat2`'s timer loop
    /// (`tokio::select!` between a sleep and a stop channel).
    pub async fn run_detection_loop(
        &self,
        tick_interval: Duration,
        expected_call_frames: usize,
        mut stop: tokio::sync::oneshot::Receiver<()>,
        mut on_failure: impl FnMut(FailureDetection) + Send,
    ) {
        loop {
            tokio::select! {
                _ = sleep(with_jitter(tick_interval)) => {}
                _ = &mut stop => {
                    debug!("detection loop received stop signal");
                    break;
                }
            }

            match self.detect(expected_call_frames) {
                Ok(Some(failure)) => on_failure(failure),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "detection tick failed to read ledger"),
            }
        }
    }
}

fn stale_participants(ledger: &Ledger, staleness_ms: i64) -> Vec<String> {
    let now = chrono::Utc::now();
    ledger
        .participants
        .values()
        .filter(|p| now.signed_duration_since(p.last_heartbeat).num_milliseconds() > staleness_ms)
        .map(|p| p.participant_id.clone())
        .collect()
}

fn with_jitter(base: Duration) -> Duration {
    use rand::Rng;
    let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 10).max(1));
    base + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_join_and_heartbeat_roundtrip() {
        let dir = tempdir().unwrap();
        let handle = LedgerHandle::new(dir.path(), "op-1", "inst-a");
        handle.create_operation("op-1").unwrap();
        handle.join_operation("participant-b").unwrap();

        let result = handle.heartbeat("participant-b").unwrap();
        assert!(!result.abort_flag);
        assert!(result.stale_participants.is_empty());
    }

    #[test]
    fn abort_flag_is_detected_first() {
        let dir = tempdir().unwrap();
        let handle = LedgerHandle::new(dir.path(), "op-2", "inst-a");
        handle.create_operation("op-2").unwrap();
        handle.set_abort_flag().unwrap();

        let failure = handle.detect(1).unwrap().unwrap();
        assert!(matches!(failure.kind, FailureKind::AbortRequested));
    }

    #[test]
    fn call_frame_shortfall_detected_as_child_disappeared() {
        let dir = tempdir().unwrap();
        let handle = LedgerHandle::new(dir.path(), "op-3", "inst-a");
        handle.create_operation("op-3").unwrap();
        handle.create_call_frame("inst-a", "frame-1").unwrap();

        let failure = handle.detect(3).unwrap().unwrap();
        match failure.kind {
            FailureKind::ChildDisappeared { observed, expected } => {
                assert_eq!(observed, 1);
                assert_eq!(expected, 3);
            }
            other => panic!("expected ChildDisappeared, got {other:?}"),
        }
    }

    #[test]
    fn sufficient_call_frames_report_no_failure() {
        let dir = tempdir().unwrap();
        let handle = LedgerHandle::new(dir.path(), "op-3b", "inst-a");
        handle.create_operation("op-3b").unwrap();
        handle.create_call_frame("inst-a", "frame-1").unwrap();
        handle.create_call_frame("inst-a", "frame-2").unwrap();

        assert!(handle.detect(2).unwrap().is_none());
    }

    #[test]
    fn complete_removes_ledger_file() {
        let dir = tempdir().unwrap();
        let handle = LedgerHandle::new(dir.path(), "op-4", "inst-a");
        handle.create_operation("op-4").unwrap();
        handle.complete().unwrap();
        assert!(handle.read().is_err());
    }
}
