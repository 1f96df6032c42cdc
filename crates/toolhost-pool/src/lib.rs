//! # Toolhost Pool
//!
//! On-demand supervision of named, long-lived worker processes.
//!
//! [`OnDemandPool::get_server`] hides whether a worker was already running,
//! is being started by another caller, or has to be spawned now. Idle workers
//! are retired by a background sweep, and when the host is over budget the
//! least-recently-used worker is evicted to make room.
//!
//! The pool never looks at what a worker says on its standard streams. What
//! to run comes from a [`WorkerResolver`], extra environment from a
//! [`CredentialBridge`], and the process itself from a [`WorkerLauncher`].

pub mod config;
pub mod launcher;
pub mod pool;
pub mod resolver;

pub use config::{CensusKind, CredentialsConfig, LockConfig, PoolConfig, ToolhostConfig, WorkerConfig};
pub use launcher::{
    CommandLauncher, WorkerCommand, WorkerExit, WorkerHandle, WorkerLauncher, WorkerProcess,
};
pub use pool::{OnDemandPool, PoolCollaborators, WorkerStatus};
pub use resolver::{CatalogResolver, CredentialBridge, EnvCredentialBridge, NoCredentials, WorkerResolver};
