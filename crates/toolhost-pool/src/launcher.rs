//! Spawning worker processes.
//!
//! A [`WorkerLauncher`] turns a resolved [`WorkerCommand`] into a running
//! [`WorkerProcess`]. The pool moves every process into an exit-monitor task
//! that owns it exclusively and reaps it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use toolhost_common::{SupervisorError, SupervisorResult, WorkerName};
use tracing::{debug, info};

/// Everything needed to start one worker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: HashMap<String, String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerExit {
    pub code: Option<i32>,
    /// Terminating signal number, Unix only.
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// What `get_server` hands out: identifies one spawn of one worker.
///
/// Callers served by the same spawn receive equal handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHandle {
    pub name: WorkerName,
    pub pid: u32,
    /// Incremented on every start of this name.
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

/// A spawned worker, owned by its exit monitor.
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> u32;

    /// Wait for the process to exit and reap it. Must be cancel-safe.
    async fn wait(&mut self) -> SupervisorResult<WorkerExit>;

    /// Ask the process to exit.
    fn terminate(&mut self) -> SupervisorResult<()>;

    fn force_kill(&mut self) -> SupervisorResult<()>;
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        name: &WorkerName,
        command: &WorkerCommand,
        credentials: &HashMap<String, String>,
    ) -> SupervisorResult<Box<dyn WorkerProcess>>;
}

/// Launches workers as Tokio child processes.
///
/// stdin and stdout are detached; stderr is inherited so worker diagnostics
/// land in the supervisor's log stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(
        &self,
        name: &WorkerName,
        command: &WorkerCommand,
        credentials: &HashMap<String, String>,
    ) -> SupervisorResult<Box<dyn WorkerProcess>> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args);
        if let Some(ref dir) = command.working_directory {
            cmd.current_dir(dir);
        }
        cmd.envs(&command.environment);
        cmd.envs(credentials);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            SupervisorError::spawn_failed(
                name.as_str(),
                format!("{}: {}", command.program.display(), e),
            )
        })?;
        let pid = child.id().ok_or_else(|| {
            SupervisorError::spawn_failed(name.as_str(), "process exited before reporting a pid")
        })?;

        info!(
            "Spawned worker {} (PID: {}): {}",
            name,
            pid,
            command.program.display()
        );
        Ok(Box::new(ChildWorker { child, pid }))
    }
}

struct ChildWorker {
    child: tokio::process::Child,
    pid: u32,
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> SupervisorResult<WorkerExit> {
        self.child
            .wait()
            .await
            .map(WorkerExit::from)
            .map_err(|e| SupervisorError::signal(self.pid, format!("wait failed: {}", e)))
    }

    fn terminate(&mut self) -> SupervisorResult<()> {
        debug!("Terminating worker PID {}", self.pid);
        #[cfg(unix)]
        {
            toolhost_process::terminate_gracefully(self.pid)
        }
        #[cfg(not(unix))]
        {
            self.force_kill()
        }
    }

    fn force_kill(&mut self) -> SupervisorResult<()> {
        debug!("Force killing worker PID {}", self.pid);
        self.child
            .start_kill()
            .map_err(|e| SupervisorError::signal(self.pid, format!("kill failed: {}", e)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_launch_and_wait() {
        let command = WorkerCommand::new("sh").arg("-c").arg("exit 3");
        let mut process = CommandLauncher
            .launch(&WorkerName::from("short"), &command, &HashMap::new())
            .await
            .unwrap();
        assert!(process.pid() > 0);
        let exit = process.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_credentials_reach_the_worker() {
        let mut command = WorkerCommand::new("sh")
            .arg("-c")
            .arg("test \"$TOKEN\" = from-bridge && test \"$SITE\" = catalog");
        command
            .environment
            .insert("SITE".to_string(), "catalog".to_string());
        let credentials: HashMap<String, String> =
            [("TOKEN".to_string(), "from-bridge".to_string())].into_iter().collect();

        let mut process = CommandLauncher
            .launch(&WorkerName::from("env"), &command, &credentials)
            .await
            .unwrap();
        assert!(process.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_terminate_reports_signal() {
        let command = WorkerCommand::new("sleep").arg("30");
        let mut process = CommandLauncher
            .launch(&WorkerName::from("sleeper"), &command, &HashMap::new())
            .await
            .unwrap();
        process.terminate().unwrap();
        let exit = process.wait().await.unwrap();
        assert_eq!(exit.signal, Some(15));
        assert_eq!(exit.to_string(), "signal 15");
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_failure() {
        let command = WorkerCommand::new("/definitely/not/a/real/binary");
        let err = CommandLauncher
            .launch(&WorkerName::from("ghost"), &command, &HashMap::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
    }
}
