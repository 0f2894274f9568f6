//! Library-level error kinds for the registry, gate, heartbeat, and
//! supervision surfaces. The CLI boundary still works in terms of
//! `anyhow::Result`; this enum exists so the Control API can map a
//! failure to the right HTTP status code (spec §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("lock could not be acquired within the configured timeout")]
    LockTimeout,

    #[error("no process entry with id `{0}`")]
    ProcessNotFound(String),

    #[error("process entry `{0}` is disabled")]
    ProcessDisabled(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("ledger I/O error: {0}")]
    LedgerIoError(String),

    #[error("probe exceeded its timeout")]
    ExternalTimeout,

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for MonitorError {
    fn from(e: std::io::Error) -> Self {
        MonitorError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(e: serde_json::Error) -> Self {
        MonitorError::Internal(e.to_string())
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;
