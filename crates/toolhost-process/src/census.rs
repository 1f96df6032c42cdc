//! Process census: point-in-time snapshots of the OS process table.
//!
//! The supervisor never talks to the platform directly when it needs to know
//! what is running; it asks a [`ProcessCensus`]. Two implementations ship:
//! [`PsCensus`] shells out to `ps` and parses its columns defensively, and
//! [`SysinfoCensus`] reads the table through `sysinfo`.
//!
//! Snapshots are produced fresh on every call and are never cached.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sysinfo::System;
use toolhost_common::{SupervisorError, SupervisorResult};
use tracing::debug;

/// Default cap on the length of a recorded command line, in characters.
pub const DEFAULT_MAX_COMMAND_LEN: usize = 512;

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub resident_memory_bytes: u64,
    pub command_line: String,
}

impl ProcessRecord {
    pub fn new(pid: u32, resident_memory_bytes: u64, command_line: impl Into<String>) -> Self {
        Self {
            pid,
            resident_memory_bytes,
            command_line: command_line.into(),
        }
    }

    /// Resident memory in whole megabytes.
    pub fn memory_mb(&self) -> u64 {
        self.resident_memory_bytes / (1024 * 1024)
    }
}

/// Source of process table snapshots.
#[async_trait]
pub trait ProcessCensus: Send + Sync {
    /// List every process currently visible to this host.
    async fn list_processes(&self) -> SupervisorResult<Vec<ProcessRecord>>;
}

/// Census backed by `ps -axo pid=,rss=,command=`.
#[derive(Debug, Clone)]
pub struct PsCensus {
    max_command_len: usize,
}

impl PsCensus {
    pub fn new(max_command_len: usize) -> Self {
        Self { max_command_len }
    }
}

impl Default for PsCensus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COMMAND_LEN)
    }
}

#[async_trait]
impl ProcessCensus for PsCensus {
    async fn list_processes(&self) -> SupervisorResult<Vec<ProcessRecord>> {
        let output = tokio::process::Command::new("ps")
            .args(["-axo", "pid=,rss=,command="])
            .output()
            .await
            .map_err(|e| SupervisorError::census(format!("failed to run ps: {}", e)))?;

        if !output.status.success() {
            return Err(SupervisorError::census(format!(
                "ps exited with {:?}",
                output.status.code()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut skipped = 0usize;
        let records: Vec<ProcessRecord> = stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let record = parse_ps_line(line, self.max_command_len);
                if record.is_none() {
                    skipped += 1;
                }
                record
            })
            .collect();

        if skipped > 0 {
            debug!("ps census skipped {} malformed rows", skipped);
        }
        Ok(records)
    }
}

/// Parse one `pid rss command...` row. RSS is reported by `ps` in KiB.
///
/// Rows with a non-numeric pid or rss, or without a command, yield `None`.
pub fn parse_ps_line(line: &str, max_command_len: usize) -> Option<ProcessRecord> {
    let mut parts = line.split_whitespace();
    let pid = parts.next()?.parse::<u32>().ok()?;
    let rss_kib = parts.next()?.parse::<u64>().ok()?;
    let command_line = parts.collect::<Vec<_>>().join(" ");
    if command_line.is_empty() {
        return None;
    }
    Some(ProcessRecord {
        pid,
        resident_memory_bytes: rss_kib.saturating_mul(1024),
        command_line: truncate_command(&command_line, max_command_len),
    })
}

/// Truncate to at most `max_len` characters on a char boundary.
pub fn truncate_command(command: &str, max_len: usize) -> String {
    match command.char_indices().nth(max_len) {
        Some((idx, _)) => command[..idx].to_string(),
        None => command.to_string(),
    }
}

/// Census backed by the `sysinfo` crate.
pub struct SysinfoCensus {
    system: Arc<Mutex<System>>,
    max_command_len: usize,
}

impl SysinfoCensus {
    pub fn new(max_command_len: usize) -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            max_command_len,
        }
    }
}

impl Default for SysinfoCensus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COMMAND_LEN)
    }
}

#[async_trait]
impl ProcessCensus for SysinfoCensus {
    async fn list_processes(&self) -> SupervisorResult<Vec<ProcessRecord>> {
        let system = Arc::clone(&self.system);
        let max_len = self.max_command_len;

        // Refreshing walks /proc (or the platform equivalent); keep it off the
        // async worker threads.
        tokio::task::spawn_blocking(move || {
            let mut system = system.lock();
            system.refresh_processes();
            system
                .processes()
                .iter()
                .map(|(pid, process)| {
                    let command_line = if process.cmd().is_empty() {
                        process.name().to_string()
                    } else {
                        process.cmd().join(" ")
                    };
                    ProcessRecord {
                        pid: pid.as_u32(),
                        resident_memory_bytes: process.memory(),
                        command_line: truncate_command(&command_line, max_len),
                    }
                })
                .collect()
        })
        .await
        .map_err(|e| SupervisorError::census(format!("sysinfo refresh task failed: {}", e)))
    }
}
