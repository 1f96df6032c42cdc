//! Error types for the toolhost supervisor.
//!
//! Every fallible operation in the library crates returns
//! [`SupervisorResult`]. The variants mirror the failure classes a caller of
//! the pool has to tell apart: an unknown worker is permanent, a spawn failure
//! or start timeout is worth retrying later, and resource exhaustion means the
//! host is saturated.
//!
//! Lock contention is deliberately *not* represented here: failing to acquire
//! the singleton lock is an ordinary `Ok(false)`.

use std::time::Duration;
use thiserror::Error;

/// Supervisor error type.
///
/// `Clone` so that a single start failure can be handed to every caller that
/// was waiting on the same worker.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SupervisorError {
    #[error("Unknown worker: {name}")]
    UnknownWorker { name: String },

    #[error("Worker spawn failed: {name} - {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("Worker start failed: {name} - {reason}")]
    StartFailed { name: String, reason: String },

    #[error("Worker start timed out: {name} - waited {waited:?}")]
    StartTimeout { name: String, waited: Duration },

    #[error(
        "Resources exhausted starting {name}: {process_count}/{max_processes} processes, \
         {memory_mb}/{max_memory_mb} MB"
    )]
    ResourceExhausted {
        name: String,
        process_count: usize,
        max_processes: usize,
        memory_mb: u64,
        max_memory_mb: u64,
    },

    #[error("Worker stop failed: {id} - {reason}")]
    StopFailed { id: String, reason: String },

    #[error("Worker state error: {id} - cannot move from {actual} to {expected}")]
    InvalidState {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {id} - {reason}")]
    Configuration { id: String, reason: String },

    #[error("Process census failed: {reason}")]
    Census { reason: String },

    #[error("Lock file error: {path} - {reason}")]
    Lock { path: String, reason: String },

    #[error("Signal delivery failed: pid {pid} - {reason}")]
    Signal { pid: u32, reason: String },

    #[error("Task panicked for '{id}': {message}")]
    TaskPanic { id: String, message: String },
}

impl SupervisorError {
    pub fn unknown_worker(name: impl Into<String>) -> Self {
        Self::UnknownWorker { name: name.into() }
    }

    pub fn spawn_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn start_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StartFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn start_timeout(name: impl Into<String>, waited: Duration) -> Self {
        Self::StartTimeout {
            name: name.into(),
            waited,
        }
    }

    pub fn stop_failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StopFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_state(
        id: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            id: id.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn configuration(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn census(reason: impl Into<String>) -> Self {
        Self::Census {
            reason: reason.into(),
        }
    }

    pub fn lock(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Lock {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn signal(pid: u32, reason: impl Into<String>) -> Self {
        Self::Signal {
            pid,
            reason: reason.into(),
        }
    }

    pub fn task_panic(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskPanic {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailed { .. }
                | Self::StartFailed { .. }
                | Self::StartTimeout { .. }
                | Self::ResourceExhausted { .. }
        )
    }
}

/// Result type for supervisor operations.
pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
