//! # Toolhost Common
//!
//! Common types shared across the toolhost supervisor crates.
//!
//! This crate provides the foundational pieces every other crate builds on:
//! the error taxonomy, the worker identity type, and the duration format
//! used by all configuration files.

pub mod duration_serde;
pub mod errors;
pub mod types;

// Re-export commonly used items
pub use errors::{SupervisorError, SupervisorResult};
pub use types::WorkerName;
