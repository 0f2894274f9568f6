//! Environment/CLI bootstrap: registry location, log directory, and the
//! instance id this process identifies itself with in `LockInfo` and
//! remote requests (spec §6 "Environment").

use std::path::PathBuf;

/// Shared bootstrap flags every subcommand accepts, layered CLI-flag over
/// environment-variable over built-in default (teacher's `#[arg(long,
/// default_value = ...)]` style, extended with `env` fallback).
#[derive(Debug, Clone, clap::Args)]
pub struct GlobalArgs {
    /// Directory holding registry.json and its lock files.
    #[arg(long, env = "PROCMIND_REGISTRY_DIR")]
    pub registry_dir: Option<PathBuf>,

    /// Directory where per-process stdout/stderr logs are written.
    #[arg(long, env = "PROCMIND_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Stable identity for this monitor instance (defaults to hostname-pid).
    #[arg(long, env = "PROCMIND_INSTANCE_ID")]
    pub instance_id: Option<String>,
}

impl GlobalArgs {
    fn base_dir() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local/share/procmind-monitor")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.registry_dir.clone().unwrap_or_else(Self::base_dir)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.registry_dir().join("registry.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| Self::base_dir().join("logs"))
    }

    pub fn resolved_instance_id(&self) -> String {
        self.instance_id.clone().unwrap_or_else(|| {
            format!("{}-{}", hostname_best_effort(), std::process::id())
        })
    }
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::process::Command::new("hostname")
                .output()
                .ok()
                .and_then(|o| String::from_utf8(o.stdout).ok())
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "unknown-host".to_string())
}
