//! The resource supervisor.
//!
//! Every decision starts from a fresh census snapshot; nothing is cached
//! between calls. Admission is gated on the hard ceiling only. Destructive
//! cleanup runs when an operator asks for it, or from the periodic timer when
//! `auto_cleanup` is enabled and usage has run away.

use crate::config::ResourceConfig;
use crate::matcher::WorkerMatcher;
use crate::policy::{BudgetTier, ResourceBudget};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use toolhost_common::SupervisorResult;
use toolhost_process::{graceful_kill, KillOptions, ProcessCensus, ProcessRecord};
use tracing::{debug, error, info, warn};

/// Terminates a single process, escalating as needed.
///
/// Returns whether the process is confirmed gone.
#[async_trait]
pub trait ProcessTerminator: Send + Sync {
    async fn terminate(&self, pid: u32) -> SupervisorResult<bool>;
}

/// Signal-based terminator: TERM, poll, then KILL.
#[derive(Debug, Clone, Default)]
pub struct SignalTerminator {
    options: KillOptions,
}

impl SignalTerminator {
    pub fn new(options: KillOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ProcessTerminator for SignalTerminator {
    async fn terminate(&self, pid: u32) -> SupervisorResult<bool> {
        graceful_kill(pid, &self.options).await
    }
}

/// Aggregate worker usage at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub process_count: usize,
    pub memory_usage_mb: u64,
    pub processes: Vec<ProcessRecord>,
    pub taken_at: DateTime<Utc>,
}

/// Outcome of an admission check.
#[derive(Debug, Clone)]
pub struct Admission {
    pub allowed: bool,
    pub tier: BudgetTier,
    /// `None` when the census failed and admission was granted blind.
    pub snapshot: Option<ResourceSnapshot>,
}

/// What a cleanup pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub killed: Vec<u32>,
    pub failed: Vec<u32>,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.killed.extend(other.killed);
        self.failed.extend(other.failed);
    }

    pub fn is_empty(&self) -> bool {
        self.killed.is_empty() && self.failed.is_empty()
    }
}

pub struct ResourceSupervisor {
    config: ResourceConfig,
    budget: ResourceBudget,
    matcher: WorkerMatcher,
    census: Arc<dyn ProcessCensus>,
    terminator: Arc<dyn ProcessTerminator>,
    cancel: CancellationToken,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceSupervisor {
    pub fn new(config: ResourceConfig, census: Arc<dyn ProcessCensus>) -> Self {
        let terminator = Arc::new(SignalTerminator::new(config.kill_options()));
        Self::with_terminator(config, census, terminator)
    }

    pub fn with_terminator(
        config: ResourceConfig,
        census: Arc<dyn ProcessCensus>,
        terminator: Arc<dyn ProcessTerminator>,
    ) -> Self {
        Self {
            budget: config.budget(),
            matcher: WorkerMatcher::new(config.worker_markers.clone()),
            config,
            census,
            terminator,
            cancel: CancellationToken::new(),
            cleanup_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn budget(&self) -> ResourceBudget {
        self.budget
    }

    /// Snapshot the worker processes currently on the host.
    pub async fn scan(&self) -> SupervisorResult<ResourceSnapshot> {
        let own_pid = std::process::id();
        let processes: Vec<ProcessRecord> = self
            .census
            .list_processes()
            .await?
            .into_iter()
            .filter(|p| p.pid != own_pid && self.matcher.matches(&p.command_line))
            .take(self.config.max_scan_rows)
            .collect();

        let memory_bytes: u64 = processes.iter().map(|p| p.resident_memory_bytes).sum();
        let snapshot = ResourceSnapshot {
            process_count: processes.len(),
            memory_usage_mb: memory_bytes / (1024 * 1024),
            processes,
            taken_at: Utc::now(),
        };
        debug!(
            "Scan: {} worker processes, {} MB",
            snapshot.process_count, snapshot.memory_usage_mb
        );
        Ok(snapshot)
    }

    /// Admission decision on current usage, with the snapshot it was based on.
    ///
    /// A census failure admits: refusing every spawn because `ps` hiccuped
    /// would take the whole pool down.
    pub async fn admission(&self) -> Admission {
        self.admission_with(0).await
    }

    /// Admission decision for one more worker: the process dimension is
    /// classified as if the new worker were already running.
    pub async fn spawn_admission(&self) -> Admission {
        self.admission_with(1).await
    }

    async fn admission_with(&self, incoming: usize) -> Admission {
        let snapshot = match self.scan().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Resource scan failed, admitting without a budget check: {}", e);
                return Admission {
                    allowed: true,
                    tier: BudgetTier::WithinBudget,
                    snapshot: None,
                };
            }
        };

        let tier = self
            .budget
            .classify(snapshot.process_count + incoming, snapshot.memory_usage_mb);
        match tier {
            BudgetTier::WithinBudget => {}
            BudgetTier::OverSoftBudget => warn!(
                "Worker usage over soft budget: {}/{} processes, {}/{} MB",
                snapshot.process_count,
                self.budget.max_processes,
                snapshot.memory_usage_mb,
                self.budget.max_memory_mb
            ),
            BudgetTier::OverHardCeiling | BudgetTier::Runaway => warn!(
                "Refusing spawn, worker usage {}: {}/{} processes, {}/{} MB",
                tier,
                snapshot.process_count,
                self.budget.max_processes,
                snapshot.memory_usage_mb,
                self.budget.max_memory_mb
            ),
        }

        Admission {
            allowed: tier.admits(),
            tier,
            snapshot: Some(snapshot),
        }
    }

    pub async fn can_spawn(&self) -> bool {
        self.admission().await.allowed
    }

    /// Terminate `pid`, escalating to a force kill after `kill_timeout`.
    pub async fn graceful_kill(&self, pid: u32) -> SupervisorResult<bool> {
        self.terminator.terminate(pid).await
    }

    /// Trim every worker type to at most `duplicates_kept` instances, keeping
    /// the lowest-memory ones.
    pub async fn kill_duplicates(&self) -> SupervisorResult<CleanupReport> {
        let snapshot = self.scan().await?;

        let mut groups: BTreeMap<String, Vec<ProcessRecord>> = BTreeMap::new();
        for process in snapshot.processes {
            if let Some(tag) = self.matcher.type_tag(&process.command_line) {
                groups.entry(tag).or_default().push(process);
            }
        }

        let mut victims = Vec::new();
        for (tag, mut group) in groups {
            if group.len() <= self.config.duplicates_kept {
                continue;
            }
            group.sort_by(|a, b| b.resident_memory_bytes.cmp(&a.resident_memory_bytes));
            let excess = group.len() - self.config.duplicates_kept;
            info!(
                "Worker type {} has {} instances, terminating {}",
                tag,
                group.len(),
                excess
            );
            victims.extend(group.into_iter().take(excess));
        }

        Ok(self
            .terminate_all(&victims, self.config.duplicate_kill_gap)
            .await)
    }

    /// Terminate the `emergency_kill_count` largest workers by memory.
    pub async fn emergency_cleanup(&self) -> SupervisorResult<CleanupReport> {
        let mut processes = self.scan().await?.processes;
        processes.sort_by(|a, b| b.resident_memory_bytes.cmp(&a.resident_memory_bytes));
        processes.truncate(self.config.emergency_kill_count);

        warn!(
            "Emergency cleanup: terminating {} largest workers",
            processes.len()
        );
        let report = self
            .terminate_all(&processes, self.config.emergency_kill_gap)
            .await;

        match self.scan().await {
            Ok(after) => info!(
                "After emergency cleanup: {} worker processes, {} MB",
                after.process_count, after.memory_usage_mb
            ),
            Err(e) => warn!("Post-cleanup scan failed: {}", e),
        }
        Ok(report)
    }

    /// Budget-driven cleanup; does nothing unless `auto_cleanup` is enabled.
    pub async fn cleanup(&self) -> SupervisorResult<CleanupReport> {
        let mut report = CleanupReport::default();
        if !self.config.auto_cleanup {
            debug!("Automatic cleanup disabled, skipping");
            return Ok(report);
        }

        let snapshot = self.scan().await?;
        if !self.budget.process_tier(snapshot.process_count).admits() {
            report.merge(self.kill_duplicates().await?);
        }
        if !self.budget.memory_tier(snapshot.memory_usage_mb).admits() {
            report.merge(self.emergency_cleanup().await?);
        }
        Ok(report)
    }

    /// Start the periodic cleanup timer if `auto_cleanup` is enabled.
    ///
    /// The task holds only a weak reference and stops on [`shutdown`](Self::shutdown)
    /// or when the supervisor is dropped.
    pub fn start_periodic_cleanup(self: &Arc<Self>) {
        if !self.config.auto_cleanup {
            info!("Periodic resource cleanup disabled");
            return;
        }

        let mut slot = self.cleanup_task.lock();
        if slot.is_some() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.config.cleanup_interval;
        info!("Periodic resource cleanup every {:?}", interval);

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(supervisor) = weak.upgrade() else { break };
                supervisor.periodic_pass().await;
            }
            debug!("Periodic resource cleanup stopped");
        }));
    }

    async fn periodic_pass(&self) {
        let snapshot = match self.scan().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Periodic resource scan failed: {}", e);
                return;
            }
        };
        let tier = self
            .budget
            .classify(snapshot.process_count, snapshot.memory_usage_mb);
        if tier != BudgetTier::Runaway {
            return;
        }

        warn!(
            "Worker usage runaway: {} processes, {} MB",
            snapshot.process_count, snapshot.memory_usage_mb
        );
        match self.cleanup().await {
            Ok(report) => info!(
                "Periodic cleanup terminated {} processes ({} failed)",
                report.killed.len(),
                report.failed.len()
            ),
            Err(e) => error!("Periodic cleanup failed: {}", e),
        }
    }

    /// Stop the periodic timer and wait for it to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.cleanup_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn terminate_all(&self, victims: &[ProcessRecord], gap: Duration) -> CleanupReport {
        let mut report = CleanupReport::default();
        for (i, victim) in victims.iter().enumerate() {
            if i > 0 && !gap.is_zero() {
                tokio::time::sleep(gap).await;
            }
            match self.terminator.terminate(victim.pid).await {
                Ok(true) => {
                    info!(
                        "Terminated PID {} ({} MB): {}",
                        victim.pid,
                        victim.memory_mb(),
                        victim.command_line
                    );
                    report.killed.push(victim.pid);
                }
                Ok(false) => {
                    warn!("PID {} survived termination", victim.pid);
                    report.failed.push(victim.pid);
                }
                Err(e) => {
                    warn!("Failed to terminate PID {}: {}", victim.pid, e);
                    report.failed.push(victim.pid);
                }
            }
        }
        report
    }
}

impl Drop for ResourceSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
