//! Process existence checking.

use toolhost_common::SupervisorResult;

/// Check if a process with the given PID exists and is running.
///
/// On Unix this sends the null signal (`kill(pid, 0)`), which performs the
/// permission and existence checks without delivering anything. A process we
/// are not allowed to signal still exists, so `EPERM` counts as alive.
///
/// # Returns
///
/// * `Ok(true)` - Process exists
/// * `Ok(false)` - No such process
/// * `Err(_)` - The probe itself failed; callers decide whether to fail
///   open or closed
pub fn process_exists(pid: u32) -> SupervisorResult<bool> {
    #[cfg(unix)]
    {
        process_exists_unix(pid)
    }

    #[cfg(not(unix))]
    {
        process_exists_sysinfo(pid)
    }
}

#[cfg(unix)]
fn process_exists_unix(pid: u32) -> SupervisorResult<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // pid 0 and anything above i32::MAX would address process groups
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Ok(false),
    };

    match kill(Pid::from_raw(raw), None) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(Errno::EPERM) => Ok(true),
        Err(e) => Err(toolhost_common::SupervisorError::signal(
            pid,
            format!("liveness probe failed: {}", e),
        )),
    }
}

#[cfg(not(unix))]
fn process_exists_sysinfo(pid: u32) -> SupervisorResult<bool> {
    use sysinfo::{Pid, System};

    let mut system = System::new();
    Ok(system.refresh_process(Pid::from_u32(pid)))
}
