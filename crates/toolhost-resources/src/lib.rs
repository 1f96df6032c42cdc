//! # Toolhost Resources
//!
//! Resource accounting and enforcement for toolhost workers.
//!
//! This crate provides:
//! - A two-tier budget policy (advisory soft budget, blocking hard ceiling)
//! - Identification and type-tagging of worker processes in the process table
//! - [`ResourceSupervisor`]: admission checks, duplicate and emergency cleanup,
//!   and an opt-in periodic cleanup timer

pub mod config;
pub mod matcher;
pub mod policy;
pub mod supervisor;

pub use config::ResourceConfig;
pub use matcher::WorkerMatcher;
pub use policy::{BudgetTier, ResourceBudget, HARD_CEILING_FACTOR, RUNAWAY_FACTOR};
pub use supervisor::{
    Admission, CleanupReport, ProcessTerminator, ResourceSnapshot, ResourceSupervisor,
    SignalTerminator,
};
