//! OS process control (spec §4.2): spawn, liveness check, graceful/forceful
//! stop, and resource-usage sampling. Keeps the teacher's `nix`-based signal
//! handling and PID-recycling guard; generalizes single-process-group task
//! killing into `ProcessEntry`-driven spawn with args/cwd/env and per-process
//! log redirection.

use crate::types::{ProcessEntry, ResourceUsage};
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

const GRACEFUL_WAIT: std::time::Duration = std::time::Duration::from_secs(2);

pub struct ProcessManager;

impl ProcessManager {
    /// Signal-0 existence check (spec §4.2 `is_process_alive`).
    #[cfg(unix)]
    pub fn is_alive(pid: i32) -> bool {
        kill(Pid::from_raw(pid), None).is_ok()
    }

    #[cfg(windows)]
    pub fn is_alive(pid: i32) -> bool {
        if let Ok(output) = Command::new("tasklist")
            .args(&["/FI", &format!("PID eq {}", pid)])
            .output()
        {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return stdout.contains(&pid.to_string());
        }
        false
    }

    /// Process start-time token, used to guard against PID recycling
    /// (spec §4.2 "Platform").
    #[cfg(unix)]
    pub fn get_start_time(pid: i32) -> Result<String> {
        let output = Command::new("ps")
            .args(&["-p", &pid.to_string(), "-o", "lstart="])
            .output()
            .context("failed to execute ps")?;

        if !output.status.success() {
            anyhow::bail!("process {} not found", pid);
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    #[cfg(windows)]
    pub fn get_start_time(pid: i32) -> Result<String> {
        let output = Command::new("wmic")
            .args(&[
                "process",
                "where",
                &format!("ProcessId={}", pid),
                "get",
                "CreationDate",
            ])
            .output()
            .context("failed to execute wmic")?;

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// True only if `pid` is both alive and still the same process we
    /// started (`expected_start` matches its current start-time token).
    pub fn validate_process(pid: i32, expected_start: &str) -> bool {
        if let Ok(actual_start) = Self::get_start_time(pid) {
            return actual_start == expected_start;
        }
        false
    }

    /// Spawn a `ProcessEntry`'s command, redirecting stdout/stderr to
    /// `<log_dir>/<id>.{out,err}.log` (spec §4.2 "Start"). Returns the pid
    /// and a start-time token for later PID-recycling checks.
    pub fn start_process(entry: &ProcessEntry, log_dir: &Path) -> Result<(i32, String)> {
        std::fs::create_dir_all(log_dir).context("failed to create log directory")?;

        let stdout_path = log_dir.join(format!("{}.out.log", entry.config.id));
        let stderr_path = log_dir.join(format!("{}.err.log", entry.config.id));
        let stdout_file = open_append(&stdout_path)?;
        let stderr_file = open_append(&stderr_path)?;

        let mut cmd = Command::new(&entry.config.command);
        cmd.args(&entry.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file));

        if let Some(dir) = &entry.config.working_dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &entry.config.env {
            cmd.env(k, v);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New session/process group so a later stop can target the
            // whole tree without affecting the monitor itself.
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn process `{}`", entry.config.id))?;
        let pid = child.id() as i32;
        // Don't wait on the child; the supervisor observes liveness by pid.
        std::mem::forget(child);

        // Give the OS a moment to populate process accounting before we
        // read its start time back.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let start_time = Self::get_start_time(pid)
            .with_context(|| format!("failed to read start time for pid {pid}"))?;

        info!(process_id = %entry.config.id, pid, "process started");
        Ok((pid, start_time))
    }

    /// Graceful-then-forceful stop: SIGTERM, wait, SIGKILL if still alive
    /// (spec §4.2 `stop_process`).
    #[cfg(unix)]
    pub fn stop_process(pid: i32) -> Result<()> {
        if kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok() {
            debug!(pid, "sent SIGTERM");
            std::thread::sleep(GRACEFUL_WAIT);

            if Self::is_alive(pid) {
                kill(Pid::from_raw(pid), Signal::SIGKILL).context("failed to send SIGKILL")?;
                warn!(pid, "sent SIGKILL after SIGTERM timeout");
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    pub fn stop_process(pid: i32) -> Result<()> {
        Command::new("taskkill")
            .args(&["/PID", &pid.to_string(), "/F"])
            .output()
            .context("failed to kill process")?;
        Ok(())
    }

    /// SIGTERM only, no escalation (spec §4.2 `stop_process_gracefully`);
    /// the caller is responsible for a follow-up `stop_process` if needed.
    #[cfg(unix)]
    pub fn stop_process_gracefully(pid: i32) -> Result<()> {
        kill(Pid::from_raw(pid), Signal::SIGTERM).context("failed to send SIGTERM")?;
        Ok(())
    }

    #[cfg(windows)]
    pub fn stop_process_gracefully(pid: i32) -> Result<()> {
        Self::stop_process(pid)
    }

    pub fn get_resource_usage(pid: i32) -> Option<ResourceUsage> {
        use sysinfo::{Pid as SysPid, System};

        let mut sys = System::new_all();
        sys.refresh_all();

        let sys_pid = SysPid::from_u32(pid as u32);
        sys.process(sys_pid).map(|process| ResourceUsage {
            cpu_percent: process.cpu_usage(),
            memory_kb: process.memory(),
        })
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_alive_reflects_current_process() {
        let pid = std::process::id() as i32;
        assert!(ProcessManager::is_alive(pid));
        assert!(!ProcessManager::is_alive(999_999));
    }

    #[test]
    fn get_start_time_succeeds_for_self() {
        let pid = std::process::id() as i32;
        assert!(ProcessManager::get_start_time(pid).is_ok());
    }

    #[test]
    fn validate_process_rejects_wrong_start_time() {
        let pid = std::process::id() as i32;
        assert!(!ProcessManager::validate_process(pid, "definitely not a real timestamp"));
    }
}
