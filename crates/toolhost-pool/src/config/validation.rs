use super::*;
use anyhow::{anyhow, Result};
use std::collections::HashSet;

/// Validate the complete configuration
pub fn validate_config(config: &ToolhostConfig) -> Result<()> {
    validate_pool_config(&config.pool)?;
    validate_resource_config(&config.resources)?;
    validate_workers(&config.workers)?;
    Ok(())
}

fn validate_pool_config(pool: &PoolConfig) -> Result<()> {
    for (field, value) in [
        ("pool.inactivity_timeout", pool.inactivity_timeout),
        ("pool.sweep_interval", pool.sweep_interval),
        ("pool.start_timeout", pool.start_timeout),
        ("pool.stop_timeout", pool.stop_timeout),
    ] {
        if value.is_zero() {
            return Err(anyhow!("{} must be greater than 0", field));
        }
    }
    Ok(())
}

fn validate_resource_config(resources: &ResourceConfig) -> Result<()> {
    if resources.max_processes == 0 {
        return Err(anyhow!("resources.max_processes must be greater than 0"));
    }
    if resources.max_memory_mb == 0 {
        return Err(anyhow!("resources.max_memory_mb must be greater than 0"));
    }
    for (field, value) in [
        ("resources.cleanup_interval", resources.cleanup_interval),
        ("resources.kill_timeout", resources.kill_timeout),
        ("resources.kill_poll_interval", resources.kill_poll_interval),
    ] {
        if value.is_zero() {
            return Err(anyhow!("{} must be greater than 0", field));
        }
    }
    if resources.max_scan_rows == 0 {
        return Err(anyhow!("resources.max_scan_rows must be greater than 0"));
    }
    if resources.worker_markers.iter().all(|m| m.trim().is_empty()) {
        return Err(anyhow!(
            "resources.worker_markers must contain at least one non-empty marker"
        ));
    }
    Ok(())
}

fn validate_workers(workers: &[WorkerConfig]) -> Result<()> {
    let mut names = HashSet::new();
    for worker in workers {
        if !worker.name.is_valid() {
            return Err(anyhow!(
                "Worker name must be 1-64 characters of alphanumerics, hyphens and underscores: {:?}",
                worker.name.as_str()
            ));
        }
        if !names.insert(worker.name.as_str()) {
            return Err(anyhow!("Duplicate worker name: {}", worker.name));
        }
        if worker.executable.trim().is_empty() {
            return Err(anyhow!("Worker {} has an empty executable", worker.name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str, executable: &str) -> WorkerConfig {
        WorkerConfig {
            name: WorkerName::from(name),
            executable: executable.to_string(),
            args: Vec::new(),
            working_directory: None,
            environment: HashMap::new(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&ToolhostConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_budgets_rejected() {
        let mut config = ToolhostConfig::default();
        config.resources.max_processes = 0;
        assert!(validate_config(&config).is_err());

        let mut config = ToolhostConfig::default();
        config.resources.max_memory_mb = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = ToolhostConfig::default();
        config.pool.sweep_interval = Duration::ZERO;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("pool.sweep_interval"));

        let mut config = ToolhostConfig::default();
        config.resources.kill_timeout = Duration::ZERO;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_worker_names_checked() {
        let mut config = ToolhostConfig::default();
        config.workers = vec![worker("github", "/bin/gh"), worker("github", "/bin/gh2")];
        assert!(validate_config(&config)
            .unwrap_err()
            .to_string()
            .contains("Duplicate"));

        config.workers = vec![worker("bad name!", "/bin/x")];
        assert!(validate_config(&config).is_err());

        config.workers = vec![worker("", "/bin/x")];
        assert!(validate_config(&config).is_err());

        config.workers = vec![worker("ok", "  ")];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_empty_markers_rejected() {
        let mut config = ToolhostConfig::default();
        config.resources.worker_markers = vec![String::new()];
        assert!(validate_config(&config).is_err());
    }
}
