//! Supervisor configuration file.
//!
//! One YAML document with sections `pool`, `resources`, `lock`, `census`,
//! `credentials` and `workers`. Every field has a default, so an empty
//! document is a valid configuration. A handful of settings can be
//! overridden from `TOOLHOST_*` environment variables after loading.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use toolhost_common::duration_serde::{self, parse_duration_or_secs};
use toolhost_common::WorkerName;
use toolhost_process::{ProcessCensus, PsCensus, SysinfoCensus};
use toolhost_resources::ResourceConfig;
use tracing::debug;

pub mod validation;

pub const ENV_MAX_PROCESSES: &str = "TOOLHOST_MAX_PROCESSES";
pub const ENV_MAX_MEMORY_MB: &str = "TOOLHOST_MAX_MEMORY_MB";
pub const ENV_AUTO_CLEANUP: &str = "TOOLHOST_AUTO_CLEANUP";
pub const ENV_CLEANUP_INTERVAL: &str = "TOOLHOST_CLEANUP_INTERVAL";
pub const ENV_INACTIVITY_TIMEOUT: &str = "TOOLHOST_INACTIVITY_TIMEOUT";
pub const ENV_LOCK_PATH: &str = "TOOLHOST_LOCK_PATH";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolhostConfig {
    pub pool: PoolConfig,
    pub resources: ResourceConfig,
    pub lock: LockConfig,
    pub census: CensusKind,
    pub credentials: CredentialsConfig,
    pub workers: Vec<WorkerConfig>,
}

/// Pool timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Running workers idle for longer than this are stopped by the sweep.
    #[serde(with = "duration_serde")]
    pub inactivity_timeout: Duration,

    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// Bound on how long a `get_server` caller waits for a start.
    #[serde(with = "duration_serde")]
    pub start_timeout: Duration,

    /// Grace period after the terminate signal before force killing.
    #[serde(with = "duration_serde")]
    pub stop_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// How the process table is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CensusKind {
    /// Parse `ps` output
    Ps,
    /// Read through the `sysinfo` crate
    Sysinfo,
}

impl Default for CensusKind {
    fn default() -> Self {
        if cfg!(unix) {
            CensusKind::Ps
        } else {
            CensusKind::Sysinfo
        }
    }
}

/// Environment handed to every worker on top of its catalog entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Host environment variables copied when present.
    pub passthrough: Vec<String>,
    /// Literal values.
    pub fixed: HashMap<String, String>,
}

/// Catalog entry for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: WorkerName,
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl ToolhostConfig {
    /// Load configuration from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::load_from_string(&content)
    }

    /// Load configuration from a YAML string
    pub fn load_from_string(content: &str) -> Result<Self> {
        // serde_yaml rejects an empty document; treat it as all defaults.
        let config: ToolhostConfig = if content.trim().is_empty() {
            ToolhostConfig::default()
        } else {
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }

    /// Apply `TOOLHOST_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply `TOOLHOST_*` overrides from an arbitrary lookup.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_PROCESSES) {
            self.resources.max_processes = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_MAX_PROCESSES, value))?;
            debug!("{} override: {}", ENV_MAX_PROCESSES, self.resources.max_processes);
        }
        if let Some(value) = lookup(ENV_MAX_MEMORY_MB) {
            self.resources.max_memory_mb = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_MAX_MEMORY_MB, value))?;
            debug!("{} override: {}", ENV_MAX_MEMORY_MB, self.resources.max_memory_mb);
        }
        if let Some(value) = lookup(ENV_AUTO_CLEANUP) {
            self.resources.auto_cleanup = parse_flag(&value)
                .ok_or_else(|| anyhow!("Invalid {}: {}", ENV_AUTO_CLEANUP, value))?;
            debug!("{} override: {}", ENV_AUTO_CLEANUP, self.resources.auto_cleanup);
        }
        if let Some(value) = lookup(ENV_CLEANUP_INTERVAL) {
            self.resources.cleanup_interval = parse_duration_or_secs(&value)
                .map_err(|e| anyhow!("Invalid {}: {}", ENV_CLEANUP_INTERVAL, e))?;
        }
        if let Some(value) = lookup(ENV_INACTIVITY_TIMEOUT) {
            self.pool.inactivity_timeout = parse_duration_or_secs(&value)
                .map_err(|e| anyhow!("Invalid {}: {}", ENV_INACTIVITY_TIMEOUT, e))?;
        }
        if let Some(value) = lookup(ENV_LOCK_PATH) {
            if !value.trim().is_empty() {
                self.lock.path = Some(PathBuf::from(value.trim()));
            }
        }
        Ok(())
    }

    /// Configured lock path, or the platform default.
    pub fn lock_path(&self) -> PathBuf {
        self.lock
            .path
            .clone()
            .unwrap_or_else(toolhost_singleton::default_lock_path)
    }

    /// Build the configured process census.
    pub fn build_census(&self) -> Arc<dyn ProcessCensus> {
        let max_len = self.resources.max_command_len;
        match self.census {
            CensusKind::Ps => Arc::new(PsCensus::new(max_len)),
            CensusKind::Sysinfo => Arc::new(SysinfoCensus::new(max_len)),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
pool:
  inactivity_timeout: 10m
  start_timeout: 45s
resources:
  max_processes: 8
  auto_cleanup: true
  worker_markers: ["-mcp", "-server"]
lock:
  path: /tmp/toolhost-test/supervisor.lock
census: sysinfo
credentials:
  passthrough: [GITHUB_TOKEN]
  fixed:
    REGION: eu-west-1
workers:
  - name: github
    executable: /usr/local/bin/github-mcp
    args: ["--stdio"]
  - name: jira
    executable: node
    args: ["/opt/tools/jira-mcp.js"]
    working_directory: /opt/tools
    environment:
      JIRA_SITE: example
"#;

    #[test]
    fn test_shipped_example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/toolhost.example.yaml");
        let config = ToolhostConfig::load_from_file(&path).unwrap();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.resources, ResourceConfig::default());
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[1].name.as_str(), "search");
        assert!(config.workers[0].working_directory.is_none());
    }

    #[test]
    fn test_empty_document_is_all_defaults() {
        let config = ToolhostConfig::load_from_string("").unwrap();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.resources.max_processes, 30);
        assert!(config.workers.is_empty());
        assert!(config.lock.path.is_none());
    }

    #[test]
    fn test_load_sample() {
        let config = ToolhostConfig::load_from_string(SAMPLE).unwrap();
        assert_eq!(config.pool.inactivity_timeout, Duration::from_secs(600));
        assert_eq!(config.pool.start_timeout, Duration::from_secs(45));
        assert_eq!(config.pool.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.resources.max_processes, 8);
        assert_eq!(config.resources.max_memory_mb, 3000);
        assert!(config.resources.auto_cleanup);
        assert_eq!(config.census, CensusKind::Sysinfo);
        assert_eq!(config.credentials.passthrough, vec!["GITHUB_TOKEN".to_string()]);
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[1].working_directory, Some(PathBuf::from("/opt/tools")));
        assert_eq!(
            config.lock_path(),
            PathBuf::from("/tmp/toolhost-test/supervisor.lock")
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ToolhostConfig::default();
        let env: HashMap<&str, &str> = [
            (ENV_MAX_PROCESSES, "12"),
            (ENV_MAX_MEMORY_MB, "2048"),
            (ENV_AUTO_CLEANUP, "true"),
            (ENV_CLEANUP_INTERVAL, "120"),
            (ENV_INACTIVITY_TIMEOUT, "90s"),
            (ENV_LOCK_PATH, "/run/user/1000/custom.lock"),
        ]
        .into_iter()
        .collect();

        config
            .apply_env_overrides_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.resources.max_processes, 12);
        assert_eq!(config.resources.max_memory_mb, 2048);
        assert!(config.resources.auto_cleanup);
        assert_eq!(config.resources.cleanup_interval, Duration::from_secs(120));
        assert_eq!(config.pool.inactivity_timeout, Duration::from_secs(90));
        assert_eq!(config.lock_path(), PathBuf::from("/run/user/1000/custom.lock"));
    }

    #[test]
    fn test_bad_env_override_is_rejected() {
        let mut config = ToolhostConfig::default();
        let result = config.apply_env_overrides_from(|key| {
            (key == ENV_AUTO_CLEANUP).then(|| "maybe".to_string())
        });
        assert!(result.is_err());

        let result = config.apply_env_overrides_from(|key| {
            (key == ENV_MAX_PROCESSES).then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolhost.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = ToolhostConfig::load_from_file(&path).unwrap();
        assert_eq!(config.workers[0].name.as_str(), "github");

        assert!(ToolhostConfig::load_from_file(dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_durations_round_trip_through_yaml() {
        let config = ToolhostConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("inactivity_timeout: 5m"));
        assert!(yaml.contains("kill_poll_interval: 500ms"));
        let parsed = ToolhostConfig::load_from_string(&yaml).unwrap();
        assert_eq!(parsed.pool, config.pool);
    }
}
