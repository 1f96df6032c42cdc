//! Collaborators that decide *what* a worker is.
//!
//! The pool treats both as opaque lookups: a [`WorkerResolver`] maps a name
//! to a command, and a [`CredentialBridge`] supplies environment variables
//! that are passed through to the worker unmodified.

use crate::config::{CredentialsConfig, WorkerConfig};
use crate::launcher::WorkerCommand;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use toolhost_common::{SupervisorError, SupervisorResult, WorkerName};
use tracing::debug;

/// Maps a worker name to the command that runs it.
pub trait WorkerResolver: Send + Sync {
    /// Fails with [`SupervisorError::UnknownWorker`] when no mapping exists.
    fn resolve(&self, name: &WorkerName) -> SupervisorResult<WorkerCommand>;
}

/// Resolver over the `workers` catalog of the configuration file.
#[derive(Debug, Clone, Default)]
pub struct CatalogResolver {
    entries: HashMap<WorkerName, WorkerCommand>,
}

impl CatalogResolver {
    pub fn new(workers: &[WorkerConfig]) -> Self {
        let entries = workers
            .iter()
            .map(|w| {
                let command = WorkerCommand {
                    program: PathBuf::from(&w.executable),
                    args: w.args.clone(),
                    working_directory: w.working_directory.clone(),
                    environment: w.environment.clone(),
                };
                (w.name.clone(), command)
            })
            .collect();
        Self { entries }
    }

    pub fn names(&self) -> Vec<WorkerName> {
        let mut names: Vec<_> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

impl WorkerResolver for CatalogResolver {
    fn resolve(&self, name: &WorkerName) -> SupervisorResult<WorkerCommand> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::unknown_worker(name.as_str()))
    }
}

/// Supplies environment variables injected into a spawned worker.
#[async_trait]
pub trait CredentialBridge: Send + Sync {
    /// Missing credentials are not an error; the worker deals with its own
    /// authentication failures.
    async fn credentials_for(&self, name: &WorkerName) -> HashMap<String, String>;
}

/// Supplies nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialBridge for NoCredentials {
    async fn credentials_for(&self, _name: &WorkerName) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// Copies selected host variables and adds fixed values.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialBridge {
    config: CredentialsConfig,
}

impl EnvCredentialBridge {
    pub fn new(config: CredentialsConfig) -> Self {
        Self { config }
    }

    fn collect<F>(&self, lookup: F) -> HashMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut vars: HashMap<String, String> = self
            .config
            .passthrough
            .iter()
            .filter_map(|key| lookup(key).map(|value| (key.clone(), value)))
            .collect();
        vars.extend(self.config.fixed.clone());
        vars
    }
}

#[async_trait]
impl CredentialBridge for EnvCredentialBridge {
    async fn credentials_for(&self, name: &WorkerName) -> HashMap<String, String> {
        let vars = self.collect(|key| std::env::var(key).ok());
        debug!("Supplying {} credential variables to {}", vars.len(), name);
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> CatalogResolver {
        CatalogResolver::new(&[WorkerConfig {
            name: WorkerName::from("jira"),
            executable: "node".to_string(),
            args: vec!["/opt/tools/jira-mcp.js".to_string()],
            working_directory: Some(PathBuf::from("/opt/tools")),
            environment: [("JIRA_SITE".to_string(), "example".to_string())]
                .into_iter()
                .collect(),
        }])
    }

    #[test]
    fn test_catalog_resolves_known_worker() {
        let command = catalog().resolve(&WorkerName::from("jira")).unwrap();
        assert_eq!(command.program, PathBuf::from("node"));
        assert_eq!(command.args, vec!["/opt/tools/jira-mcp.js".to_string()]);
        assert_eq!(command.environment.get("JIRA_SITE").map(String::as_str), Some("example"));
    }

    #[test]
    fn test_catalog_unknown_worker() {
        let err = catalog().resolve(&WorkerName::from("nope")).unwrap_err();
        assert_eq!(err, SupervisorError::unknown_worker("nope"));
    }

    #[test]
    fn test_env_bridge_passthrough_and_fixed() {
        let bridge = EnvCredentialBridge::new(CredentialsConfig {
            passthrough: vec!["PRESENT".to_string(), "ABSENT".to_string()],
            fixed: [("REGION".to_string(), "eu".to_string())].into_iter().collect(),
        });
        let vars = bridge.collect(|key| (key == "PRESENT").then(|| "secret".to_string()));
        assert_eq!(vars.len(), 2);
        assert_eq!(vars.get("PRESENT").map(String::as_str), Some("secret"));
        assert_eq!(vars.get("REGION").map(String::as_str), Some("eu"));
        assert!(!vars.contains_key("ABSENT"));
    }

    #[tokio::test]
    async fn test_no_credentials_is_empty() {
        assert!(NoCredentials
            .credentials_for(&WorkerName::from("jira"))
            .await
            .is_empty());
    }
}
