//! Data model for the registry document (spec §3): `ProcessConfig`,
//! `ProcessEntry`, `RestartPolicy`, `AlivenessCheck`/`StartupCheck`,
//! `RemoteAccessConfig`, `PartnerDiscoveryConfig`, and the root
//! `Registry` document itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state of a managed process entry.
///
/// Invariant (spec §3): `state == Running ⇒ pid.is_some() && enabled`;
/// `state == Disabled ⇒ !enabled`. A restart may only move
/// stopped/failed → starting → running, never skipping `Starting`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
    Disabled,
}

impl ProcessState {
    pub fn is_terminal_for_restart(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }
}

/// Ordered restart backoff and retry-forever policy (spec §3 `RestartPolicy`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartPolicy {
    pub max_attempts: u32,
    /// Milliseconds; last value is reused for every attempt beyond its length.
    pub backoff_intervals_ms: Vec<u64>,
    /// Uptime after which `restart_attempts` is zeroed.
    pub reset_after_ms: u64,
    pub retry_indefinitely: bool,
    pub indefinite_interval_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_intervals_ms: vec![500, 1_000, 5_000, 15_000, 30_000],
            reset_after_ms: 60_000,
            retry_indefinitely: false,
            indefinite_interval_ms: 30_000,
        }
    }
}

impl RestartPolicy {
    /// Backoff delay for the (0-indexed) `attempt`th restart, per spec
    /// §4.3 step 3: `backoffIntervals[min(restartAttempts, len-1)]`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        if self.backoff_intervals_ms.is_empty() {
            return std::time::Duration::from_millis(self.indefinite_interval_ms);
        }
        let idx = (attempt as usize).min(self.backoff_intervals_ms.len() - 1);
        std::time::Duration::from_millis(self.backoff_intervals_ms[idx])
    }
}

/// Bounded probing phase right after spawn (spec §3 `StartupCheck`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupCheck {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub check_interval_ms: u64,
    pub max_attempts: u32,
    pub fail_action: FailAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailAction {
    Restart,
    Disable,
}

/// Periodic HTTP liveness/status probing configuration (spec §3 `AlivenessCheck`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlivenessCheck {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_url: Option<String>,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub consecutive_failures_required: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_check: Option<StartupCheck>,
}

/// Immutable process definition supplied at registration time
/// (spec §3 `ProcessConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub autostart: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliveness_check: Option<AlivenessCheck>,
}

/// Persisted, mutable process entry (spec §3 `ProcessEntry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEntry {
    #[serde(flatten)]
    pub config: ProcessConfig,

    pub enabled: bool,
    pub is_remote: bool,
    pub registered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stopped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub state: ProcessState,
    pub restart_attempts: u32,
    pub consecutive_failures: u32,

    /// Set once the aliveness check's bounded startup phase has seen a
    /// first success; gates `AlivenessCheck::startup_check` vs. the
    /// permanent `consecutiveFailuresRequired` steady-state threshold
    /// (spec §4.4). Reset to `false` on every fresh start.
    #[serde(default)]
    pub startup_completed: bool,

    /// Process start-time string (from `ps -o lstart=`), cross-checked
    /// against `pid` to guard against PID recycling (spec §4.2 "Platform").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time_token: Option<String>,
}

impl ProcessEntry {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            enabled: true,
            is_remote: false,
            registered_at: Utc::now(),
            last_started_at: None,
            last_stopped_at: None,
            pid: None,
            state: ProcessState::Stopped,
            restart_attempts: 0,
            consecutive_failures: 0,
            startup_completed: false,
            start_time_token: None,
            config,
        }
    }

    /// `state=running ⇒ pid≠null ∧ enabled=true` (spec §3 invariant).
    pub fn invariant_holds(&self) -> bool {
        match self.state {
            ProcessState::Running => self.pid.is_some() && self.enabled,
            ProcessState::Disabled => !self.enabled,
            _ => true,
        }
    }
}

/// Trusted-host / permission-bit / executable-list gate configuration
/// (spec §3 `RemoteAccessConfig`, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAccessConfig {
    pub enabled: bool,
    pub listen_port: u16,
    #[serde(default)]
    pub trusted_hosts: Vec<String>,
    pub allow_register: bool,
    pub allow_deregister: bool,
    pub allow_start: bool,
    pub allow_stop: bool,
    pub allow_disable: bool,
    pub allow_autostart: bool,
    pub allow_monitor_restart: bool,
    #[serde(default)]
    pub executable_whitelist: Vec<String>,
    #[serde(default)]
    pub executable_blacklist: Vec<String>,
}

impl Default for RemoteAccessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_port: 19881,
            trusted_hosts: Vec::new(),
            allow_register: false,
            allow_deregister: false,
            allow_start: false,
            allow_stop: false,
            allow_disable: false,
            allow_autostart: false,
            allow_monitor_restart: false,
            executable_whitelist: Vec::new(),
            executable_blacklist: Vec::new(),
        }
    }
}

/// The operation a remote control request is attempting (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOperation {
    Register,
    Deregister,
    Start,
    Stop,
    Disable,
    Autostart,
    MonitorRestart,
}

impl RemoteAccessConfig {
    pub fn allows(&self, op: RemoteOperation) -> bool {
        match op {
            RemoteOperation::Register => self.allow_register,
            RemoteOperation::Deregister => self.allow_deregister,
            RemoteOperation::Start => self.allow_start,
            RemoteOperation::Stop => self.allow_stop,
            RemoteOperation::Disable => self.allow_disable,
            RemoteOperation::Autostart => self.allow_autostart,
            RemoteOperation::MonitorRestart => self.allow_monitor_restart,
        }
    }
}

/// Partner-pairing configuration (spec §3/§4.7).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PartnerDiscoveryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_liveness_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_status_url: Option<String>,
    #[serde(default)]
    pub discover_on_startup: bool,
}

/// The external watcher that started this monitor, if any (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherInfo {
    pub watcher_id: String,
    pub watcher_pid: i32,
}

/// Embedded liveness server config (port the monitor itself answers
/// partner liveness probes on; spec §4.7, default port 19883).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlivenessServerConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for AlivenessServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 19883,
        }
    }
}

/// Root persisted document (spec §3 `Registry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub version: u32,
    pub last_modified: DateTime<Utc>,
    pub instance_id: String,
    pub monitor_interval_ms: u64,
    #[serde(default)]
    pub standalone_mode: bool,
    #[serde(default)]
    pub partner_discovery: PartnerDiscoveryConfig,
    #[serde(default)]
    pub remote_access: RemoteAccessConfig,
    #[serde(default)]
    pub aliveness_server: AlivenessServerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watcher_info: Option<WatcherInfo>,
    #[serde(default)]
    pub processes: HashMap<String, ProcessEntry>,
}

impl Registry {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            version: 1,
            last_modified: Utc::now(),
            instance_id: instance_id.into(),
            monitor_interval_ms: 2_000,
            standalone_mode: false,
            partner_discovery: PartnerDiscoveryConfig::default(),
            remote_access: RemoteAccessConfig::default(),
            aliveness_server: AlivenessServerConfig::default(),
            watcher_info: None,
            processes: HashMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }

    pub fn get(&self, id: &str) -> Option<&ProcessEntry> {
        self.processes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ProcessEntry> {
        self.processes.get_mut(id)
    }

    pub fn insert(&mut self, entry: ProcessEntry) {
        self.processes.insert(entry.config.id.clone(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<ProcessEntry> {
        self.processes.remove(id)
    }

    pub fn running(&self) -> impl Iterator<Item = (&String, &ProcessEntry)> {
        self.processes
            .iter()
            .filter(|(_, e)| e.state == ProcessState::Running)
    }
}

/// Resource usage snapshot for a live pid (cpu%/memory; teacher's
/// `ResourceUsage`, kept for `/processes/{id}` enrichment).
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_kb: u64,
}

/// Aggregate counters for the `stats`/`GET /monitor/status` surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub failed: usize,
    pub disabled: usize,
}

// ---------------------------------------------------------------------
// Heartbeat / crash detection domain (spec §3 "Heartbeat domain", §4.5)
// ---------------------------------------------------------------------

/// One append-only frame on a participant's logical call stack within
/// an operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallFrame {
    pub call_id: String,
}

/// A single participant's view as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub participant_id: String,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub call_frames: Vec<CallFrame>,
}

/// The ledger document backing one Operation (spec §6 "Ledger file").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub operation_id: String,
    pub initiator: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub abort_flag: bool,
    #[serde(default)]
    pub participants: HashMap<String, ParticipantRecord>,
}

impl Ledger {
    pub fn new(operation_id: impl Into<String>, initiator: impl Into<String>) -> Self {
        let initiator = initiator.into();
        let mut participants = HashMap::new();
        participants.insert(
            initiator.clone(),
            ParticipantRecord {
                participant_id: initiator.clone(),
                last_heartbeat: Utc::now(),
                call_frames: Vec::new(),
            },
        );
        Self {
            operation_id: operation_id.into(),
            initiator,
            created_at: Utc::now(),
            abort_flag: false,
            participants,
        }
    }

    pub fn total_call_frames(&self) -> usize {
        self.participants.values().map(|p| p.call_frames.len()).sum()
    }
}

/// The kind of failure the heartbeat engine can detect (spec §4.5).
/// Ordering here doubles as the first-match-wins precedence: abort >
/// staleness > frame-shape > healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureKind {
    AbortRequested,
    StaleHeartbeat { stale_participants: Vec<String> },
    ChildDisappeared { observed: usize, expected: usize },
    HeartbeatError { message: String },
    UserAbort,
}

/// Outcome of one heartbeat tick (spec §3 `HeartbeatResult`).
#[derive(Debug, Clone)]
pub struct HeartbeatResult {
    pub call_frame_count: usize,
    pub own_age_ms: i64,
    pub abort_flag: bool,
    pub stale_participants: Vec<String>,
}

/// A failure surfaced by the detection algorithm to a participant's
/// caller (spec §4.5 "FailureDetection").
#[derive(Debug, Clone, Serialize)]
pub struct FailureDetection {
    pub participant: String,
    pub kind: FailureKind,
    pub message: String,
}
