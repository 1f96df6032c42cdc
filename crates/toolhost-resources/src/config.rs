use crate::policy::ResourceBudget;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use toolhost_common::duration_serde;
use toolhost_process::{KillOptions, DEFAULT_MAX_COMMAND_LEN};

/// Resource supervisor configuration (the `resources` section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Soft budget on the number of worker processes.
    pub max_processes: usize,

    /// Soft budget on aggregate worker resident memory.
    pub max_memory_mb: u64,

    /// Gates every destructive action not explicitly requested by an operator.
    pub auto_cleanup: bool,

    #[serde(with = "duration_serde")]
    pub cleanup_interval: Duration,

    /// Grace period between the terminate signal and the force kill.
    #[serde(with = "duration_serde")]
    pub kill_timeout: Duration,

    #[serde(with = "duration_serde")]
    pub kill_poll_interval: Duration,

    pub emergency_kill_count: usize,

    #[serde(with = "duration_serde")]
    pub emergency_kill_gap: Duration,

    #[serde(with = "duration_serde")]
    pub duplicate_kill_gap: Duration,

    /// Instances of one worker type left alive by duplicate cleanup.
    pub duplicates_kept: usize,

    /// Substrings identifying a worker process by its command line.
    pub worker_markers: Vec<String>,

    pub max_scan_rows: usize,

    pub max_command_len: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_processes: 30,
            max_memory_mb: 3000,
            auto_cleanup: false,
            cleanup_interval: Duration::from_secs(300),
            kill_timeout: Duration::from_secs(5),
            kill_poll_interval: Duration::from_millis(500),
            emergency_kill_count: 3,
            emergency_kill_gap: Duration::from_secs(2),
            duplicate_kill_gap: Duration::from_secs(1),
            duplicates_kept: 2,
            worker_markers: vec!["-mcp".to_string()],
            max_scan_rows: 100,
            max_command_len: DEFAULT_MAX_COMMAND_LEN,
        }
    }
}

impl ResourceConfig {
    pub fn budget(&self) -> ResourceBudget {
        ResourceBudget::new(self.max_processes, self.max_memory_mb)
    }

    pub fn kill_options(&self) -> KillOptions {
        KillOptions {
            timeout: self.kill_timeout,
            poll_interval: self.kill_poll_interval,
            ..KillOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ResourceConfig::default();
        assert_eq!(config.max_processes, 30);
        assert_eq!(config.max_memory_mb, 3000);
        assert!(!config.auto_cleanup);
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.kill_options().timeout, Duration::from_secs(5));
        assert_eq!(config.kill_options().poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: ResourceConfig =
            serde_yaml::from_str("max_processes: 4\nkill_timeout: 750ms\n").unwrap();
        assert_eq!(config.max_processes, 4);
        assert_eq!(config.kill_timeout, Duration::from_millis(750));
        assert_eq!(config.max_memory_mb, 3000);
        assert_eq!(config.worker_markers, vec!["-mcp".to_string()]);
    }
}
