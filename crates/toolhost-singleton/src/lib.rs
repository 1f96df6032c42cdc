//! # Toolhost Singleton
//!
//! Cross-process mutual exclusion for the supervisor.
//!
//! The lock is a plain file whose entire contents are the holder's PID.
//! There is no advisory OS lock: a holder that crashed leaves the file
//! behind, and the next `acquire` reclaims it after probing that the
//! recorded PID is gone.
//!
//! Contention is reported as `Ok(false)`, never as an error.
//!
//! A held lock is removed by [`SingletonLock::release`], on drop, and by a
//! panic hook. Termination signals belong to the owning binary, which must
//! listen for them as soon as `acquire` succeeds and release on that path.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use tokio::io::AsyncWriteExt;
use toolhost_common::{SupervisorError, SupervisorResult};
use toolhost_process::process_exists;
use tracing::{debug, info, warn};

/// Directory name used under the runtime or data directory.
pub const LOCK_DIR_NAME: &str = "toolhost";

/// File name of the supervisor lock.
pub const LOCK_FILE_NAME: &str = "supervisor.lock";

lazy_static! {
    /// Lock files held by this process, removed by the panic hook.
    static ref HELD_LOCKS: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

static INSTALL_PANIC_HOOK: Once = Once::new();

/// Default lock location: `$XDG_RUNTIME_DIR/toolhost/supervisor.lock`, falling
/// back to the platform local-data directory.
pub fn default_lock_path() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir);
    base.join(LOCK_DIR_NAME).join(LOCK_FILE_NAME)
}

/// What is currently recorded at a lock path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub path: PathBuf,
    pub exists: bool,
    /// `None` when the file is missing or does not contain a PID.
    pub pid: Option<u32>,
    pub holder_alive: bool,
}

/// PID-stamped lock file.
pub struct SingletonLock {
    path: PathBuf,
    pid: u32,
    acquired: AtomicBool,
    // Serializes the read-probe-write sequence within this process.
    section: tokio::sync::Mutex<()>,
}

impl SingletonLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pid: std::process::id(),
            acquired: AtomicBool::new(false),
            section: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_default_path() -> Self {
        Self::new(default_lock_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Local state only, no I/O.
    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Try to become the single supervisor.
    ///
    /// Returns `Ok(false)` if a live process holds the lock, or if its
    /// liveness cannot be determined. A lock left by a dead process, or one
    /// whose contents cannot be parsed, is removed and acquisition proceeds.
    pub async fn acquire(&self) -> SupervisorResult<bool> {
        let _section = self.section.lock().await;

        if self.is_acquired() {
            debug!("Lock {} already held by this instance", self.path.display());
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.lock_error(format!("failed to create {}: {}", parent.display(), e)))?;
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => match contents.trim().parse::<u32>() {
                Ok(holder) => match process_exists(holder) {
                    Ok(true) => {
                        warn!(
                            "Supervisor lock {} is held by live process {}",
                            self.path.display(),
                            holder
                        );
                        return Ok(false);
                    }
                    Ok(false) => {
                        info!(
                            "Reclaiming stale supervisor lock {} (pid {} is gone)",
                            self.path.display(),
                            holder
                        );
                        self.remove_stale().await?;
                    }
                    Err(e) => {
                        warn!(
                            "Cannot determine whether lock holder {} is alive, refusing: {}",
                            holder, e
                        );
                        return Ok(false);
                    }
                },
                Err(_) => {
                    warn!(
                        "Supervisor lock {} has corrupt contents, treating as stale",
                        self.path.display()
                    );
                    self.remove_stale().await?;
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    "Supervisor lock {} is unreadable ({}), treating as stale",
                    self.path.display(),
                    e
                );
                self.remove_stale().await?;
            }
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(
                    "Supervisor lock {} was created concurrently by another process",
                    self.path.display()
                );
                return Ok(false);
            }
            Err(e) => return Err(self.lock_error(format!("failed to create lock file: {}", e))),
        };

        let written = async {
            file.write_all(self.pid.to_string().as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&self.path).await;
            return Err(self.lock_error(format!("failed to write pid: {}", e)));
        }

        self.acquired.store(true, Ordering::SeqCst);
        register_held(&self.path);
        info!("Acquired supervisor lock {} (pid {})", self.path.display(), self.pid);
        Ok(true)
    }

    /// Delete the lock file if this instance holds it. Idempotent.
    pub async fn release(&self) -> SupervisorResult<()> {
        let _section = self.section.lock().await;

        if !self.acquired.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        unregister_held(&self.path);

        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim() == self.pid.to_string() => {
                match tokio::fs::remove_file(&self.path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(self.lock_error(format!("failed to remove: {}", e))),
                }
                info!("Released supervisor lock {}", self.path.display());
            }
            Ok(_) => {
                warn!(
                    "Supervisor lock {} no longer records our pid, leaving it alone",
                    self.path.display()
                );
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Supervisor lock {} already removed", self.path.display());
            }
            Err(e) => return Err(self.lock_error(format!("failed to read: {}", e))),
        }
        Ok(())
    }

    /// Remove the lock file regardless of who holds it.
    ///
    /// Returns whether a file was present.
    pub async fn force_release(path: impl AsRef<Path>) -> SupervisorResult<bool> {
        let path = path.as_ref();
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                warn!("Force-released supervisor lock {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SupervisorError::lock(
                path.display().to_string(),
                format!("failed to remove: {}", e),
            )),
        }
    }

    /// Inspect the lock file without touching it.
    pub async fn status(path: impl AsRef<Path>) -> SupervisorResult<LockStatus> {
        let path = path.as_ref();
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(LockStatus {
                    path: path.to_path_buf(),
                    exists: false,
                    pid: None,
                    holder_alive: false,
                })
            }
            Err(e) => {
                return Err(SupervisorError::lock(
                    path.display().to_string(),
                    format!("failed to read: {}", e),
                ))
            }
        };

        let pid = contents.trim().parse::<u32>().ok();
        let holder_alive = match pid {
            Some(pid) => process_exists(pid)?,
            None => false,
        };
        Ok(LockStatus {
            path: path.to_path_buf(),
            exists: true,
            pid,
            holder_alive,
        })
    }

    async fn remove_stale(&self) -> SupervisorResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.lock_error(format!("failed to remove stale lock: {}", e))),
        }
    }

    fn lock_error(&self, reason: String) -> SupervisorError {
        SupervisorError::lock(self.path.display().to_string(), reason)
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        if self.acquired.swap(false, Ordering::SeqCst) {
            unregister_held(&self.path);
            remove_if_ours(&self.path, self.pid);
        }
    }
}

fn remove_if_ours(path: &Path, pid: u32) {
    if let Ok(contents) = std::fs::read_to_string(path) {
        if contents.trim() == pid.to_string() {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn register_held(path: &Path) {
    INSTALL_PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let pid = std::process::id();
            for path in HELD_LOCKS.lock().iter() {
                remove_if_ours(path, pid);
            }
            previous(info);
        }));
    });
    HELD_LOCKS.lock().insert(path.to_path_buf());
}

fn unregister_held(path: &Path) {
    HELD_LOCKS.lock().remove(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_in(dir: &TempDir) -> SingletonLock {
        SingletonLock::new(dir.path().join("nested").join(LOCK_FILE_NAME))
    }

    #[tokio::test]
    async fn test_acquire_twice_then_release() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);

        assert!(lock.acquire().await.unwrap());
        assert!(lock.is_acquired());
        assert!(!lock.acquire().await.unwrap());

        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());

        lock.release().await.unwrap();
        assert!(!lock.is_acquired());
        assert!(!lock.path().exists());
        lock.release().await.unwrap();

        assert!(lock.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_second_instance_sees_live_holder() {
        let dir = TempDir::new().unwrap();
        let first = lock_in(&dir);
        let second = lock_in(&dir);

        assert!(first.acquire().await.unwrap());
        assert!(!second.acquire().await.unwrap());
        assert!(!second.is_acquired());

        // Releasing an instance that never acquired must not delete the file.
        second.release().await.unwrap();
        assert!(first.path().exists());
    }

    #[tokio::test]
    async fn test_force_release() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);

        assert!(!SingletonLock::force_release(lock.path()).await.unwrap());

        assert!(lock.acquire().await.unwrap());
        assert!(SingletonLock::force_release(lock.path()).await.unwrap());

        let fresh = lock_in(&dir);
        assert!(fresh.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        std::fs::create_dir_all(lock.path().parent().unwrap()).unwrap();
        std::fs::write(lock.path(), "99999999").unwrap();

        assert!(lock.acquire().await.unwrap());
        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[tokio::test]
    async fn test_corrupt_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        std::fs::create_dir_all(lock.path().parent().unwrap()).unwrap();
        std::fs::write(lock.path(), "not a pid\n").unwrap();

        assert!(lock.acquire().await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_live_foreign_holder_blocks() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        std::fs::create_dir_all(lock.path().parent().unwrap()).unwrap();
        std::fs::write(lock.path(), "1").unwrap();

        assert!(!lock.acquire().await.unwrap());
        assert_eq!(std::fs::read_to_string(lock.path()).unwrap(), "1");
    }

    #[tokio::test]
    async fn test_status_reports_holder() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);

        let status = SingletonLock::status(lock.path()).await.unwrap();
        assert!(!status.exists);

        assert!(lock.acquire().await.unwrap());
        let status = SingletonLock::status(lock.path()).await.unwrap();
        assert!(status.exists);
        assert_eq!(status.pid, Some(std::process::id()));
        assert!(status.holder_alive);
    }

    #[tokio::test]
    async fn test_drop_removes_held_lock() {
        let dir = TempDir::new().unwrap();
        let path = {
            let lock = lock_in(&dir);
            assert!(lock.acquire().await.unwrap());
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_default_path_shape() {
        let path = default_lock_path();
        assert!(path.ends_with(Path::new(LOCK_DIR_NAME).join(LOCK_FILE_NAME)));
    }
}
