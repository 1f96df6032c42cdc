use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use toolhost_pool::{OnDemandPool, PoolCollaborators, ToolhostConfig, WorkerStatus};
use toolhost_resources::ResourceSupervisor;
use toolhost_singleton::SingletonLock;

/// Toolhost Supervisor - on-demand pool of tool worker processes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pool until SIGINT/SIGTERM
    Run {
        /// Worker to start up front (repeatable)
        #[arg(long, value_name = "NAME")]
        warm: Vec<String>,

        /// Run duration in seconds (for testing)
        #[arg(long)]
        run_duration: Option<u64>,
    },

    /// Print the current worker process census as JSON
    Scan,

    /// Kill worker processes now; without flags applies the budget policy
    Cleanup {
        /// Kill duplicate instances of each worker type
        #[arg(long)]
        duplicates: bool,

        /// Kill the largest workers by memory
        #[arg(long)]
        emergency: bool,
    },

    /// Report the singleton lock holder
    LockStatus,

    /// Remove the singleton lock file regardless of its holder
    ForceUnlock,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    initialize_logging(args.debug)?;

    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Run { warm, run_duration } => run(config, warm, run_duration).await,
        Command::Scan => {
            let supervisor = build_supervisor(&config);
            let snapshot = supervisor.scan().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Command::Cleanup {
            duplicates,
            emergency,
        } => {
            let supervisor = build_supervisor(&config);
            let report = match (duplicates, emergency) {
                (false, false) => supervisor.cleanup().await?,
                (true, false) => supervisor.kill_duplicates().await?,
                (false, true) => supervisor.emergency_cleanup().await?,
                (true, true) => {
                    let mut report = supervisor.kill_duplicates().await?;
                    let emergency = supervisor.emergency_cleanup().await?;
                    report.killed.extend(emergency.killed);
                    report.failed.extend(emergency.failed);
                    report
                }
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::LockStatus => {
            let status = SingletonLock::status(config.lock_path()).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::ForceUnlock => {
            let path = config.lock_path();
            let removed = SingletonLock::force_release(&path).await?;
            if removed {
                println!("Removed lock file {}", path.display());
            } else {
                println!("No lock file at {}", path.display());
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ToolhostConfig> {
    let mut config = match path {
        Some(path) => {
            info!("Config file: {}", path.display());
            ToolhostConfig::load_from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => ToolhostConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn build_supervisor(config: &ToolhostConfig) -> Arc<ResourceSupervisor> {
    Arc::new(ResourceSupervisor::new(
        config.resources.clone(),
        config.build_census(),
    ))
}

async fn run(config: ToolhostConfig, warm: Vec<String>, run_duration: Option<u64>) -> Result<()> {
    info!("Starting Toolhost Supervisor");

    let lock = SingletonLock::new(config.lock_path());
    if !lock
        .acquire()
        .await
        .with_context(|| format!("Failed to acquire lock {}", lock.path().display()))?
    {
        let holder = SingletonLock::status(lock.path()).await?;
        match holder.pid {
            Some(pid) => bail!("Another supervisor is running (PID: {})", pid),
            None => bail!("Another supervisor holds {}", lock.path().display()),
        }
    }

    // Listen for SIGTERM/SIGINT from here on so the lock is always released.
    let mut signals = ShutdownSignal::install()?;
    let shutdown = async move {
        match run_duration {
            Some(duration) => {
                info!("Running for {} seconds (test mode)", duration);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(duration)) => {}
                    _ = signals.recv() => {}
                }
            }
            None => signals.recv().await,
        }
    };

    for status in serve(config, &lock, warm, shutdown).await? {
        info!(
            "Worker {}: {} (generation {}, {} requests)",
            status.name, status.state, status.generation, status.use_count
        );
    }
    info!("Toolhost Supervisor shut down");
    Ok(())
}

/// Run the pool under a held lock until `shutdown` resolves, then stop every
/// worker and release the lock. Returns the final pool status.
async fn serve<F>(
    config: ToolhostConfig,
    lock: &SingletonLock,
    warm: Vec<String>,
    shutdown: F,
) -> Result<Vec<WorkerStatus>>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    info!("Loaded catalog of {} workers", config.workers.len());

    let supervisor = build_supervisor(&config);
    supervisor.start_periodic_cleanup();
    let pool = OnDemandPool::new(
        config.pool.clone(),
        Arc::clone(&supervisor),
        PoolCollaborators::from_config(&config),
    );

    let interrupted = tokio::select! {
        _ = warm_workers(&pool, &warm) => false,
        _ = &mut shutdown => true,
    };
    if interrupted {
        info!("Shutdown requested during warm-up");
    } else {
        shutdown.await;
    }

    info!("Shutting down...");
    if let Err(e) = pool.stop_all().await {
        error!("Failed to stop all workers: {}", e);
    }
    supervisor.shutdown().await;
    lock.release().await?;
    Ok(pool.get_status())
}

async fn warm_workers(pool: &OnDemandPool, names: &[String]) {
    for name in names {
        match pool.get_server(name.as_str()).await {
            Ok(handle) => info!("Warmed worker {} (PID: {})", handle.name, handle.pid),
            Err(e) => warn!("Failed to warm worker {}: {}", name, e),
        }
    }
}

fn initialize_logging(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

/// Termination signals, registered as soon as the lock is held.
struct ShutdownSignal {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    fn install() -> Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                sigterm: signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?,
                sigint: signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.sigterm.recv() => info!("Received SIGTERM signal"),
                _ = self.sigint.recv() => info!("Received SIGINT signal"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C signal");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;
    use toolhost_worker_state::WorkerState;

    fn test_config(dir: &Path) -> ToolhostConfig {
        let yaml = format!(
            r#"
pool:
  stop_timeout: 2s
resources:
  worker_markers: ["toolhost-supervisor-test-no-match"]
lock:
  path: {}
workers:
  - name: sleeper
    executable: sh
    args: ["-c", "sleep 30"]
"#,
            dir.join("supervisor.lock").display()
        );
        ToolhostConfig::load_from_string(&yaml).unwrap()
    }

    fn assert_all_stopped(statuses: &[WorkerStatus]) {
        for status in statuses {
            assert_eq!(status.state, WorkerState::Stopped, "{:?}", status);
            assert_eq!(status.pid, None);
        }
    }

    #[tokio::test]
    async fn test_shutdown_releases_lock_and_stops_workers() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let lock_path = config.lock_path();
        let lock = SingletonLock::new(&lock_path);
        assert!(lock.acquire().await.unwrap());

        let shutdown = tokio::time::sleep(Duration::from_millis(200));
        let statuses = serve(config, &lock, vec!["sleeper".to_string()], shutdown)
            .await
            .unwrap();

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].generation, 1);
        assert_all_stopped(&statuses);
        assert!(!lock.is_acquired());
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_shutdown_during_warm_up_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let lock_path = config.lock_path();
        let lock = SingletonLock::new(&lock_path);
        assert!(lock.acquire().await.unwrap());

        let warm = vec!["sleeper".to_string(), "unknown".to_string()];
        let statuses = serve(config, &lock, warm, async {}).await.unwrap();

        assert_all_stopped(&statuses);
        assert!(!lock_path.exists());

        // The next supervisor can start.
        let next = SingletonLock::new(&lock_path);
        assert!(next.acquire().await.unwrap());
        next.release().await.unwrap();
    }
}
