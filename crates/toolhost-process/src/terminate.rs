//! Process termination primitives.
//!
//! [`terminate_gracefully`] and [`force_kill`] deliver a single signal.
//! [`graceful_kill`] combines them into the escalation used everywhere a
//! worker has to go away: ask politely, poll for exit, then insist.

use crate::check::process_exists;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use toolhost_common::{SupervisorError, SupervisorResult};
use tracing::{debug, info, warn};

/// Escalation timing for [`graceful_kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillOptions {
    /// How long to wait for a voluntary exit after the terminate signal.
    pub timeout: Duration,

    /// Liveness poll cadence while waiting.
    pub poll_interval: Duration,

    /// How long to wait for the process to vanish after the force kill.
    pub confirm_timeout: Duration,
}

impl Default for KillOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            confirm_timeout: Duration::from_secs(2),
        }
    }
}

/// Terminate a process gracefully (SIGTERM on Unix).
pub fn terminate_gracefully(pid: u32) -> SupervisorResult<()> {
    #[cfg(unix)]
    {
        send_unix_signal(pid, nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(not(unix))]
    {
        send_sysinfo_signal(pid, sysinfo::Signal::Term)
    }
}

/// Force kill a process (SIGKILL on Unix).
pub fn force_kill(pid: u32) -> SupervisorResult<()> {
    #[cfg(unix)]
    {
        send_unix_signal(pid, nix::sys::signal::Signal::SIGKILL)
    }

    #[cfg(not(unix))]
    {
        send_sysinfo_signal(pid, sysinfo::Signal::Kill)
    }
}

#[cfg(unix)]
fn send_unix_signal(pid: u32, signal: nix::sys::signal::Signal) -> SupervisorResult<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .ok_or_else(|| SupervisorError::signal(pid, "pid out of range"))?;

    kill(Pid::from_raw(raw), signal)
        .map_err(|e| SupervisorError::signal(pid, format!("{:?}: {}", signal, e)))
}

#[cfg(not(unix))]
fn send_sysinfo_signal(pid: u32, signal: sysinfo::Signal) -> SupervisorResult<()> {
    use sysinfo::{Pid, System};

    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    if !system.refresh_process(sys_pid) {
        return Err(SupervisorError::signal(pid, "no such process"));
    }
    match system.process(sys_pid).and_then(|p| p.kill_with(signal)) {
        Some(true) => Ok(()),
        _ => Err(SupervisorError::signal(pid, format!("{:?} not delivered", signal))),
    }
}

/// Terminate `pid`, escalating to a force kill if it outlives the timeout.
///
/// Returns `Ok(true)` once the process is confirmed gone, including when it
/// was already gone before the call. Returns `Ok(false)` if it still appears
/// alive after the force kill confirmation window.
///
/// Liveness probe errors while polling are treated as "still alive".
pub async fn graceful_kill(pid: u32, options: &KillOptions) -> SupervisorResult<bool> {
    if !process_exists(pid).unwrap_or(true) {
        debug!("PID {} already gone, nothing to kill", pid);
        return Ok(true);
    }

    info!("Sending terminate signal to PID {}", pid);
    if let Err(e) = terminate_gracefully(pid) {
        if !process_exists(pid).unwrap_or(true) {
            return Ok(true);
        }
        warn!("Terminate signal to PID {} failed: {}", pid, e);
    }

    if wait_for_exit(pid, options.timeout, options.poll_interval).await {
        info!("PID {} exited after terminate signal", pid);
        return Ok(true);
    }

    warn!(
        "PID {} still alive after {:?}, force killing",
        pid, options.timeout
    );
    if let Err(e) = force_kill(pid) {
        if !process_exists(pid).unwrap_or(true) {
            return Ok(true);
        }
        warn!("Force kill of PID {} failed: {}", pid, e);
    }

    let gone = wait_for_exit(pid, options.confirm_timeout, options.poll_interval).await;
    if !gone {
        warn!("PID {} survived force kill", pid);
    }
    Ok(gone)
}

/// Poll until `pid` disappears or `timeout` elapses. Returns whether it exited.
async fn wait_for_exit(pid: u32, timeout: Duration, poll_interval: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !process_exists(pid).unwrap_or(true) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(poll_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_graceful_kill_dead_pid_is_success() {
        let killed = graceful_kill(99_999_999, &KillOptions::default()).await.unwrap();
        assert!(killed);
    }

    #[test]
    fn test_signal_to_missing_process_fails() {
        assert!(terminate_gracefully(99_999_999).is_err());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_graceful_kill_terminates_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("child pid");

        // Reap concurrently so the exited child does not linger as a zombie
        let reaper = tokio::spawn(async move { child.wait().await });

        let options = KillOptions {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            confirm_timeout: Duration::from_secs(2),
        };
        assert!(graceful_kill(pid, &options).await.unwrap());

        let status = reaper.await.unwrap().unwrap();
        assert!(!status.success());
    }
}
