use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod error;
mod gate;
mod heartbeat;
mod lock;
mod partner;
mod process;
mod prober;
mod registry;
mod supervisor;
mod types;

use config::GlobalArgs;
use process::ProcessManager;
use registry::RegistryStore;
use types::{ProcessConfig, ProcessEntry, ProcessState};

#[derive(Parser)]
#[command(name = "procmind-monitor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Distributed process monitor with restart policies, liveness probing, and a remote control surface", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervision + liveness-probing daemon (runs continuously)
    Run {
        /// Supervision tick interval in milliseconds
        #[arg(long, default_value = "2000")]
        interval_ms: u64,

        /// Also serve the Control API on this port (spec §6)
        #[arg(long)]
        api_port: Option<u16>,
    },

    /// Check status of a specific process entry
    Check { id: String },

    /// Stop a running process entry (graceful, then forceful)
    Stop { id: String },

    /// Rehydrate context: show what's currently running
    Rehydrate,

    /// Show resource usage for every running process
    Report,

    /// Show registry statistics
    Stats,

    /// Remove stopped/failed entries older than the given number of days
    Cleanup {
        #[arg(long, default_value = "7")]
        days: u64,
    },

    /// Register a new process entry
    Register {
        id: String,

        #[arg(short, long)]
        command: String,

        #[arg(long)]
        args: Vec<String>,

        #[arg(long)]
        working_dir: Option<String>,

        /// Environment variables as KEY=VALUE pairs
        #[arg(long)]
        env: Vec<String>,

        #[arg(long)]
        autostart: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let registry_path = validate_registry_path(&cli.global.registry_path())?;
    let log_dir = cli.global.log_dir();
    let instance_id = cli.global.resolved_instance_id();

    match cli.command {
        Commands::Run { interval_ms, api_port } => {
            run_daemon(registry_path, log_dir, instance_id, interval_ms, api_port).await
        }
        Commands::Check { id } => check_process(&registry_path, &instance_id, &id),
        Commands::Stop { id } => stop_process(&registry_path, &instance_id, &id),
        Commands::Rehydrate => rehydrate(&registry_path, &instance_id),
        Commands::Report => show_report(&registry_path, &instance_id),
        Commands::Stats => show_stats(&registry_path, &instance_id),
        Commands::Cleanup { days } => cleanup(&registry_path, &instance_id, days),
        Commands::Register {
            id,
            command,
            args,
            working_dir,
            env,
            autostart,
        } => register(&registry_path, &instance_id, id, command, args, working_dir, env, autostart),
    }
}

/// Validate registry path to prevent path traversal attacks.
///
/// 1. Path must not contain parent directory references (..)
/// 2. Canonicalized path must not point to sensitive system directories
fn validate_registry_path(path: &std::path::Path) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if path_str.contains("..") {
        bail!("registry path cannot contain parent directory references (..)");
    }

    let absolute_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let canonical = match absolute_path.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            let parent = absolute_path
                .parent()
                .ok_or_else(|| anyhow::anyhow!("invalid registry path: no parent directory"))?;
            std::fs::create_dir_all(parent).context("failed to create registry directory")?;
            absolute_path
        }
    };

    let canonical_str = canonical.to_string_lossy();
    let forbidden_prefixes = ["/etc", "/sys", "/proc", "/boot", "/dev"];
    for prefix in &forbidden_prefixes {
        if canonical_str.starts_with(prefix) {
            bail!("registry path cannot be in system directory: {}", prefix);
        }
    }

    Ok(canonical)
}

async fn run_daemon(
    registry_path: PathBuf,
    log_dir: PathBuf,
    instance_id: String,
    interval_ms: u64,
    api_port: Option<u16>,
) -> Result<()> {
    info!(instance_id, "procmind-monitor starting");

    let mut store = RegistryStore::new(&registry_path, instance_id.clone());
    store.load()?;

    let sup = supervisor::Supervisor::new(
        registry_path.clone(),
        log_dir.clone(),
        instance_id.clone(),
        std::time::Duration::from_millis(interval_ms),
    );
    let prober_handle = {
        let prober = prober::Prober::new(registry_path.clone(), instance_id.clone());
        tokio::spawn(async move {
            loop {
                if let Err(e) = prober.tick().await {
                    tracing::warn!(error = %e, "aliveness probe tick failed");
                }
                tokio::time::sleep(std::time::Duration::from_millis(1000)).await;
            }
        })
    };

    if let Some(port) = api_port {
        let state = api::ApiState::new(registry_path.clone(), log_dir.clone(), instance_id.clone());
        let app = api::router(state);
        let addr: std::net::SocketAddr = format!("0.0.0.0:{port}").parse()?;
        info!(%addr, "control API listening");
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr).await.expect("bind control API port");
            axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
                .await
                .expect("control API server crashed");
        });
    }

    let result = sup.run().await;
    prober_handle.abort();
    result
}

fn check_process(registry_path: &std::path::Path, instance_id: &str, id: &str) -> Result<()> {
    let mut store = RegistryStore::new(registry_path, instance_id);
    store.load()?;

    match store.get(id) {
        Some(entry) => {
            println!("process: {id}");
            println!("  command: {}", entry.config.command);
            println!("  state: {:?}", entry.state);
            println!("  enabled: {}", entry.enabled);
            if let Some(pid) = entry.pid {
                let alive = ProcessManager::is_alive(pid);
                println!("  pid: {pid} ({})", if alive { "alive" } else { "dead" });
                if alive {
                    if let Some(usage) = ProcessManager::get_resource_usage(pid) {
                        println!("  cpu: {:.1}%", usage.cpu_percent);
                        println!("  memory: {}MB", usage.memory_kb / 1024);
                    }
                }
            }
        }
        None => println!("process {id} not found"),
    }

    Ok(())
}

fn stop_process(registry_path: &std::path::Path, instance_id: &str, id: &str) -> Result<()> {
    let mut store = RegistryStore::new(registry_path, instance_id);
    store.load()?;

    let Some(entry) = store.get(id).cloned() else {
        println!("process {id} not found");
        return Ok(());
    };

    if let Some(pid) = entry.pid {
        ProcessManager::stop_process(pid)?;
        println!("stopped pid {pid}");
    }

    let id_owned = id.to_string();
    store.with_lock("cli-stop", move |registry| {
        if let Some(e) = registry.get_mut(&id_owned) {
            e.pid = None;
            e.state = ProcessState::Stopped;
            e.last_stopped_at = Some(chrono::Utc::now());
        }
    })?;

    Ok(())
}

fn rehydrate(registry_path: &std::path::Path, instance_id: &str) -> Result<()> {
    let mut store = RegistryStore::new(registry_path, instance_id);
    store.load()?;

    let running: Vec<_> = store.registry().running().collect();
    if running.is_empty() {
        println!("no processes currently running");
    } else {
        println!("active processes ({}):\n", running.len());
        for (id, entry) in running {
            let alive = entry.pid.map(ProcessManager::is_alive).unwrap_or(false);
            println!("{id}");
            println!("  command: {}", entry.config.command);
            println!("  started: {}", entry.last_started_at.map(|t| t.to_rfc3339()).unwrap_or_default());
            println!("  status: {}", if alive { "running" } else { "DEAD (unreconciled)" });
            println!();
        }
    }

    let stats = store.stats();
    println!("summary: running={} stopped={} failed={} disabled={}", stats.running, stats.stopped, stats.failed, stats.disabled);
    println!("registry: {}", registry_path.display());

    Ok(())
}

fn show_report(registry_path: &std::path::Path, instance_id: &str) -> Result<()> {
    let mut store = RegistryStore::new(registry_path, instance_id);
    store.load()?;

    for (id, entry) in store.registry().running() {
        println!("{id}");
        if let Some(pid) = entry.pid {
            match ProcessManager::get_resource_usage(pid) {
                Some(usage) => {
                    println!("  cpu: {:.1}%", usage.cpu_percent);
                    println!("  memory: {}MB", usage.memory_kb / 1024);
                }
                None => println!("  process not found"),
            }
        }
        println!();
    }

    Ok(())
}

fn show_stats(registry_path: &std::path::Path, instance_id: &str) -> Result<()> {
    let mut store = RegistryStore::new(registry_path, instance_id);
    store.load()?;

    let stats = store.stats();
    println!("total: {}", stats.total);
    println!("running: {}", stats.running);
    println!("stopped: {}", stats.stopped);
    println!("failed: {}", stats.failed);
    println!("disabled: {}", stats.disabled);

    Ok(())
}

fn cleanup(registry_path: &std::path::Path, instance_id: &str, days: u64) -> Result<()> {
    let mut store = RegistryStore::new(registry_path, instance_id);
    store.load()?;

    let removed = store.cleanup(days)?;
    println!("removed {removed} stale entries older than {days} days");

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn register(
    registry_path: &std::path::Path,
    instance_id: &str,
    id: String,
    command: String,
    args: Vec<String>,
    working_dir: Option<String>,
    env: Vec<String>,
    autostart: bool,
) -> Result<()> {
    let mut store = RegistryStore::new(registry_path, instance_id);
    store.load()?;

    let mut env_map = HashMap::new();
    for pair in env {
        if let Some((k, v)) = pair.split_once('=') {
            env_map.insert(k.to_string(), v.to_string());
        }
    }

    let config = ProcessConfig {
        id: id.clone(),
        name: id.clone(),
        command,
        args,
        working_dir,
        env: env_map,
        autostart,
        restart_policy: Some(types::RestartPolicy::default()),
        aliveness_check: None,
    };

    store.upsert(ProcessEntry::new(config))?;
    println!("registered process {id}");

    Ok(())
}
