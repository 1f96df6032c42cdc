//! The on-demand worker pool.
//!
//! ## State machine
//!
//! Every worker name cycles `Stopped -> Starting -> Running -> Stopping ->
//! Stopped`. The move out of `Stopped` happens inside the slot's critical
//! section, so of any number of concurrent `get_server` calls for a stopped
//! name exactly one spawns; the others wait for the outcome.
//!
//! ## Starts outlive their callers
//!
//! The spawn runs in its own task. A caller that times out (or is dropped)
//! stops waiting but does not cancel the start; the next request finds the
//! worker running.
//!
//! ## Budget pressure
//!
//! Before spawning, the resource supervisor is asked whether one more worker
//! fits under the hard ceiling. If it refuses, the single least-recently-used running worker is stopped and the
//! check is repeated once. A second refusal fails the request with
//! [`SupervisorError::ResourceExhausted`]; there is no cascading eviction.
//!
//! ## Background sweep
//!
//! A sweep task started with the pool stops workers idle for longer than the
//! inactivity timeout. It holds only a weak reference to the pool.

mod instance;
mod monitor;


pub use instance::WorkerStatus;

use crate::config::{PoolConfig, ToolhostConfig};
use crate::launcher::{CommandLauncher, WorkerExit, WorkerHandle, WorkerLauncher};
use crate::resolver::{CatalogResolver, CredentialBridge, EnvCredentialBridge, WorkerResolver};
use chrono::Utc;
use futures::future::join_all;
use instance::WorkerSlot;
use monitor::ControlSignal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use toolhost_common::{SupervisorError, SupervisorResult, WorkerName};
use toolhost_resources::ResourceSupervisor;
use toolhost_worker_state::WorkerState;
use tracing::{debug, info, warn};

/// How long to wait for a force-killed worker to be reaped.
const FORCE_KILL_CONFIRM: Duration = Duration::from_secs(3);

/// The pool's external collaborators.
#[derive(Clone)]
pub struct PoolCollaborators {
    pub resolver: Arc<dyn WorkerResolver>,
    pub credentials: Arc<dyn CredentialBridge>,
    pub launcher: Arc<dyn WorkerLauncher>,
}

impl PoolCollaborators {
    /// Catalog resolver, environment credential bridge and real processes.
    pub fn from_config(config: &ToolhostConfig) -> Self {
        Self {
            resolver: Arc::new(CatalogResolver::new(&config.workers)),
            credentials: Arc::new(EnvCredentialBridge::new(config.credentials.clone())),
            launcher: Arc::new(CommandLauncher),
        }
    }
}

enum Step {
    Start(u64),
    Wait(WorkerState),
}

/// Cloneable handle to the pool.
#[derive(Clone)]
pub struct OnDemandPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    supervisor: Arc<ResourceSupervisor>,
    collaborators: PoolCollaborators,
    slots: Mutex<HashMap<WorkerName, Arc<WorkerSlot>>>,
    cancel: CancellationToken,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl OnDemandPool {
    /// Create the pool and start its inactivity sweep.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: PoolConfig,
        supervisor: Arc<ResourceSupervisor>,
        collaborators: PoolCollaborators,
    ) -> Self {
        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                supervisor,
                collaborators,
                slots: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                sweep_task: Mutex::new(None),
            }),
        };
        pool.spawn_sweep();
        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn supervisor(&self) -> &Arc<ResourceSupervisor> {
        &self.inner.supervisor
    }

    /// Return a running worker, starting it if needed.
    ///
    /// Counts the request (last use and use count) before anything else.
    pub async fn get_server(&self, name: impl Into<WorkerName>) -> SupervisorResult<WorkerHandle> {
        let name = name.into();
        let slot = self.inner.tracked_slot(&name)?;
        slot.touch();

        let start_timeout = self.inner.config.start_timeout;
        let deadline = Instant::now() + start_timeout;

        loop {
            let step = {
                let mut instance = slot.lock();
                match instance.state() {
                    WorkerState::Running => {
                        return instance.handle.clone().ok_or_else(|| {
                            SupervisorError::invalid_state(name.as_str(), "running", "running without a process")
                        });
                    }
                    WorkerState::Starting => Step::Wait(WorkerState::Starting),
                    WorkerState::Stopping => Step::Wait(WorkerState::Stopping),
                    WorkerState::Stopped => {
                        instance.machine.begin_start()?;
                        instance.generation += 1;
                        instance.last_error = None;
                        slot.publish(WorkerState::Starting);
                        Step::Start(instance.generation)
                    }
                }
            };

            match step {
                Step::Start(generation) => {
                    info!("Starting worker {} (generation {})", name, generation);
                    let task = tokio::spawn(start_worker(
                        Arc::clone(&self.inner),
                        Arc::clone(&slot),
                        generation,
                    ));
                    return match tokio::time::timeout_at(deadline, task).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(e)) => Err(SupervisorError::task_panic(name.as_str(), e.to_string())),
                        Err(_) => {
                            warn!(
                                "Worker {} not ready after {:?}; start continues in background",
                                name, start_timeout
                            );
                            Err(SupervisorError::start_timeout(name.as_str(), start_timeout))
                        }
                    };
                }
                Step::Wait(observed) => {
                    debug!("Worker {} is {}, waiting", name, observed);
                    let mut rx = slot.subscribe();
                    let changed = tokio::time::timeout_at(deadline, rx.wait_for(|s| *s != observed))
                        .await
                        .map(|r| r.map(|state| *state));
                    match changed {
                        Err(_) => {
                            return Err(SupervisorError::start_timeout(name.as_str(), start_timeout))
                        }
                        Ok(Err(_)) => {
                            return Err(SupervisorError::start_failed(name.as_str(), "worker slot closed"))
                        }
                        Ok(Ok(WorkerState::Stopped)) if observed == WorkerState::Starting => {
                            let reason = slot
                                .lock()
                                .last_error
                                .as_ref()
                                .map(|e| e.to_string())
                                .unwrap_or_else(|| "worker stopped before becoming ready".to_string());
                            return Err(SupervisorError::start_failed(name.as_str(), reason));
                        }
                        Ok(Ok(_)) => continue,
                    }
                }
            }
        }
    }

    /// Stop a running worker: terminate, wait `stop_timeout`, then force kill.
    ///
    /// A no-op for workers that are not running.
    pub async fn stop_server(&self, name: impl Into<WorkerName>) -> SupervisorResult<()> {
        self.inner.stop_worker(&name.into()).await
    }

    /// Stop every running worker idle for longer than the inactivity timeout.
    pub async fn evict_idle(&self) -> Vec<WorkerName> {
        self.inner.evict_idle().await
    }

    /// Disable the sweep and stop every worker concurrently.
    pub async fn stop_all(&self) -> SupervisorResult<()> {
        self.inner.cancel.cancel();
        let sweep = self.inner.sweep_task.lock().take();
        if let Some(task) = sweep {
            let _ = task.await;
        }

        let slots = self.inner.all_slots();
        info!("Stopping {} tracked workers", slots.len());
        let results = join_all(slots.iter().map(|slot| self.inner.settle_and_stop(slot))).await;

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(Result::err)
            .map(|e| e.to_string())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::stop_failed("pool", failures.join("; ")))
        }
    }

    /// Read-only snapshot of every tracked worker, sorted by name.
    pub fn get_status(&self) -> Vec<WorkerStatus> {
        let now = Instant::now();
        let mut statuses: Vec<WorkerStatus> = self
            .inner
            .all_slots()
            .iter()
            .map(|slot| slot.status(now))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    fn spawn_sweep(&self) {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let interval = self.inner.config.sweep_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                let evicted = inner.evict_idle().await;
                if !evicted.is_empty() {
                    debug!("Inactivity sweep stopped {} workers", evicted.len());
                }
            }
            debug!("Inactivity sweep stopped");
        });
        *self.inner.sweep_task.lock() = Some(task);
    }
}

impl PoolInner {
    fn slot(&self, name: &WorkerName) -> Arc<WorkerSlot> {
        let mut slots = self.slots.lock();
        Arc::clone(
            slots
                .entry(name.clone())
                .or_insert_with(|| Arc::new(WorkerSlot::new(name.clone()))),
        )
    }

    /// The slot for `name`, creating it only for names the resolver knows.
    fn tracked_slot(&self, name: &WorkerName) -> SupervisorResult<Arc<WorkerSlot>> {
        if let Some(slot) = self.existing_slot(name) {
            return Ok(slot);
        }
        if !name.is_valid() {
            return Err(SupervisorError::unknown_worker(name.as_str()));
        }
        self.collaborators.resolver.resolve(name)?;
        Ok(self.slot(name))
    }

    fn existing_slot(&self, name: &WorkerName) -> Option<Arc<WorkerSlot>> {
        self.slots.lock().get(name).cloned()
    }

    fn all_slots(&self) -> Vec<Arc<WorkerSlot>> {
        self.slots.lock().values().cloned().collect()
    }

    async fn launch_worker(
        &self,
        slot: &Arc<WorkerSlot>,
        generation: u64,
    ) -> SupervisorResult<WorkerHandle> {
        let name = slot.name().clone();
        let command = self.collaborators.resolver.resolve(&name)?;
        self.admit(&name).await?;

        let credentials = self.collaborators.credentials.credentials_for(&name).await;
        let process = self
            .collaborators
            .launcher
            .launch(&name, &command, &credentials)
            .await?;
        let pid = process.pid();

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        monitor::spawn_exit_monitor(Arc::clone(slot), generation, process, control_rx, exit_tx);

        let handle = WorkerHandle {
            name: name.clone(),
            pid,
            generation,
            started_at: Utc::now(),
        };
        slot.complete_start(generation, handle.clone(), control_tx, exit_rx)?;
        info!("Worker {} running (PID: {})", name, pid);
        Ok(handle)
    }

    /// Admission with one least-recently-used eviction on refusal.
    async fn admit(&self, name: &WorkerName) -> SupervisorResult<()> {
        if self.supervisor.spawn_admission().await.allowed {
            return Ok(());
        }

        match self.least_recently_used(name) {
            Some(victim) => {
                warn!(
                    "Over budget starting {}, evicting least recently used worker {}",
                    name, victim
                );
                if let Err(e) = self.stop_worker(&victim).await {
                    warn!("Eviction of {} failed: {}", victim, e);
                }
            }
            None => warn!("Over budget starting {} and no running worker to evict", name),
        }

        let admission = self.supervisor.spawn_admission().await;
        if admission.allowed {
            return Ok(());
        }

        let budget = self.supervisor.budget();
        let (process_count, memory_mb) = admission
            .snapshot
            .map(|s| (s.process_count, s.memory_usage_mb))
            .unwrap_or_default();
        Err(SupervisorError::ResourceExhausted {
            name: name.to_string(),
            process_count,
            max_processes: budget.max_processes,
            memory_mb,
            max_memory_mb: budget.max_memory_mb,
        })
    }

    fn least_recently_used(&self, exclude: &WorkerName) -> Option<WorkerName> {
        self.all_slots()
            .iter()
            .filter(|slot| slot.name() != exclude)
            .filter_map(|slot| slot.last_used_if_running().map(|t| (t, slot.name().clone())))
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
            .map(|(_, name)| name)
    }

    async fn stop_worker(&self, name: &WorkerName) -> SupervisorResult<()> {
        let Some(slot) = self.existing_slot(name) else {
            return Ok(());
        };
        let Some(ticket) = slot.begin_stop()? else {
            debug!("Worker {} is not running, nothing to stop", name);
            return Ok(());
        };

        info!("Stopping worker {} (PID: {:?})", name, ticket.pid);
        let send = |signal| {
            if let Some(ref control) = ticket.control {
                let _ = control.send(signal);
            }
        };

        send(ControlSignal::Terminate);
        let mut confirmed = wait_for_exit(ticket.exit_rx.clone(), self.config.stop_timeout).await;
        if !confirmed {
            warn!(
                "Worker {} (PID: {:?}) still running after {:?}, force killing",
                name, ticket.pid, self.config.stop_timeout
            );
            send(ControlSignal::Kill);
            confirmed = wait_for_exit(ticket.exit_rx.clone(), FORCE_KILL_CONFIRM).await;
        }

        slot.finish_stop(ticket.generation);
        if confirmed {
            info!("Worker {} stopped", name);
            Ok(())
        } else {
            Err(SupervisorError::stop_failed(
                name.as_str(),
                format!("PID {:?} did not exit after force kill", ticket.pid),
            ))
        }
    }

    /// Let an in-flight start or stop finish, then stop.
    async fn settle_and_stop(&self, slot: &Arc<WorkerSlot>) -> SupervisorResult<()> {
        let mut rx = slot.subscribe();
        let settled = tokio::time::timeout(
            self.config.start_timeout,
            rx.wait_for(|s| !s.is_transitional()),
        )
        .await;
        if settled.is_err() {
            warn!(
                "Worker {} still {} after {:?}",
                slot.name(),
                slot.state(),
                self.config.start_timeout
            );
        }
        self.stop_worker(slot.name()).await
    }

    async fn evict_idle(&self) -> Vec<WorkerName> {
        let now = Instant::now();
        let timeout = self.config.inactivity_timeout;
        let idle: Vec<WorkerName> = self
            .all_slots()
            .iter()
            .filter(|slot| slot.is_idle(now, timeout))
            .map(|slot| slot.name().clone())
            .collect();

        for name in &idle {
            info!("Worker {} idle for more than {:?}, stopping", name, timeout);
        }
        let results = join_all(idle.iter().map(|name| self.stop_worker(name))).await;
        for (name, result) in idle.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to stop idle worker {}: {}", name, e);
            }
        }
        idle
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs detached from the requesting caller.
async fn start_worker(
    inner: Arc<PoolInner>,
    slot: Arc<WorkerSlot>,
    generation: u64,
) -> SupervisorResult<WorkerHandle> {
    let mut guard = StartGuard {
        slot: Arc::clone(&slot),
        generation,
        armed: true,
    };
    let result = inner.launch_worker(&slot, generation).await;
    if let Err(ref e) = result {
        warn!("Failed to start worker {}: {}", slot.name(), e);
        slot.abandon_start(generation, e);
    }
    guard.armed = false;
    result
}

/// Returns the slot to `Stopped` if a start task is torn down mid-flight.
struct StartGuard {
    slot: Arc<WorkerSlot>,
    generation: u64,
    armed: bool,
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if self.armed {
            let error =
                SupervisorError::start_failed(self.slot.name().as_str(), "start task aborted");
            self.slot.abandon_start(self.generation, &error);
        }
    }
}

/// Whether the exit was observed within `limit`. A closed channel means the
/// monitor is gone, which only happens after the process was reaped.
async fn wait_for_exit(rx: Option<watch::Receiver<Option<WorkerExit>>>, limit: Duration) -> bool {
    let Some(mut rx) = rx else {
        return true;
    };
    let result = tokio::time::timeout(limit, rx.wait_for(|exit| exit.is_some())).await;
    result.is_ok()
}
