//! # Toolhost Process
//!
//! Low-level process operations for the toolhost supervisor.
//!
//! This crate provides cross-platform primitives for:
//! - Process existence verification (zero-signal probe)
//! - Graceful termination and force kill
//! - Escalating graceful-then-forced kill with liveness polling
//! - Process census: snapshots of the OS process table

pub mod census;
pub mod check;
pub mod terminate;

// Re-export main types
pub use census::*;
pub use check::*;
pub use terminate::*;
