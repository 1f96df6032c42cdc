//! Per-name bookkeeping.
//!
//! Each worker name owns one [`WorkerSlot`] for the lifetime of the pool. The
//! slot's mutex is the critical section in which the state is checked and
//! changed; it is never held across an `.await`. Every state change is also
//! published on a watch channel so waiters can sleep until it moves.

use super::monitor::ControlSignal;
use crate::launcher::{WorkerExit, WorkerHandle};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use toolhost_common::{SupervisorError, SupervisorResult, WorkerName};
use toolhost_worker_state::{WorkerState, WorkerStateMachine};
use tracing::{debug, info, warn};

/// Diagnostic snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub name: WorkerName,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub generation: u64,
    pub use_count: u64,
    pub idle_for: Duration,
    /// `None` unless running.
    pub uptime: Option<Duration>,
}

pub(crate) struct WorkerInstance {
    pub(crate) machine: WorkerStateMachine,
    pub(crate) handle: Option<WorkerHandle>,
    pub(crate) control: Option<mpsc::UnboundedSender<ControlSignal>>,
    pub(crate) exit_rx: Option<watch::Receiver<Option<WorkerExit>>>,
    pub(crate) last_used_at: Instant,
    pub(crate) started_at: Option<Instant>,
    pub(crate) use_count: u64,
    pub(crate) generation: u64,
    /// Why the most recent start failed, for callers that waited on it.
    pub(crate) last_error: Option<SupervisorError>,
}

impl WorkerInstance {
    pub(crate) fn state(&self) -> WorkerState {
        self.machine.current_state()
    }

    fn clear_process(&mut self) {
        self.handle = None;
        self.control = None;
        self.exit_rx = None;
        self.started_at = None;
    }
}

/// Everything `stop_server` needs once the slot is in `Stopping`.
pub(crate) struct StopTicket {
    pub(crate) generation: u64,
    pub(crate) pid: Option<u32>,
    pub(crate) control: Option<mpsc::UnboundedSender<ControlSignal>>,
    pub(crate) exit_rx: Option<watch::Receiver<Option<WorkerExit>>>,
}

pub(crate) struct WorkerSlot {
    name: WorkerName,
    instance: Mutex<WorkerInstance>,
    state_tx: watch::Sender<WorkerState>,
}

impl WorkerSlot {
    pub(crate) fn new(name: WorkerName) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Stopped);
        Self {
            instance: Mutex::new(WorkerInstance {
                machine: WorkerStateMachine::new(name.as_str()),
                handle: None,
                control: None,
                exit_rx: None,
                last_used_at: Instant::now(),
                started_at: None,
                use_count: 0,
                generation: 0,
                last_error: None,
            }),
            name,
            state_tx,
        }
    }

    pub(crate) fn name(&self) -> &WorkerName {
        &self.name
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, WorkerInstance> {
        self.instance.lock()
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.lock().state()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// Must be called with the instance lock held so publications stay in
    /// transition order.
    pub(crate) fn publish(&self, state: WorkerState) {
        self.state_tx.send_replace(state);
    }

    /// Record a request for this worker.
    pub(crate) fn touch(&self) {
        let mut instance = self.lock();
        instance.last_used_at = Instant::now();
        instance.use_count += 1;
    }

    pub(crate) fn complete_start(
        &self,
        generation: u64,
        handle: WorkerHandle,
        control: mpsc::UnboundedSender<ControlSignal>,
        exit_rx: watch::Receiver<Option<WorkerExit>>,
    ) -> SupervisorResult<()> {
        let mut instance = self.lock();
        if instance.generation != generation || instance.state() != WorkerState::Starting {
            // Dropping `control` here makes the monitor kill the process.
            return Err(SupervisorError::start_failed(
                self.name.as_str(),
                "worker exited during startup",
            ));
        }
        instance.machine.complete_start()?;
        instance.handle = Some(handle);
        instance.control = Some(control);
        instance.exit_rx = Some(exit_rx);
        instance.started_at = Some(Instant::now());
        instance.last_error = None;
        self.publish(WorkerState::Running);
        Ok(())
    }

    pub(crate) fn abandon_start(&self, generation: u64, error: &SupervisorError) {
        let mut instance = self.lock();
        if instance.generation != generation || instance.state() != WorkerState::Starting {
            return;
        }
        if let Err(e) = instance.machine.abandon_start(error.to_string()) {
            warn!("Worker {}: {}", self.name, e);
            return;
        }
        instance.last_error = Some(error.clone());
        instance.clear_process();
        self.publish(WorkerState::Stopped);
    }

    /// Move a running worker to `Stopping`. `None` if it is not running.
    pub(crate) fn begin_stop(&self) -> SupervisorResult<Option<StopTicket>> {
        let mut instance = self.lock();
        if instance.state() != WorkerState::Running {
            return Ok(None);
        }
        instance.machine.begin_stop()?;
        self.publish(WorkerState::Stopping);
        Ok(Some(StopTicket {
            generation: instance.generation,
            pid: instance.handle.as_ref().map(|h| h.pid),
            control: instance.control.clone(),
            exit_rx: instance.exit_rx.clone(),
        }))
    }

    pub(crate) fn finish_stop(&self, generation: u64) {
        let mut instance = self.lock();
        if instance.generation != generation || instance.state() != WorkerState::Stopping {
            return;
        }
        if let Err(e) = instance.machine.complete_stop() {
            warn!("Worker {}: {}", self.name, e);
            return;
        }
        instance.clear_process();
        self.publish(WorkerState::Stopped);
    }

    /// Called by the exit monitor once the process has been reaped.
    pub(crate) fn on_process_exit(&self, generation: u64, exit: &WorkerExit) {
        let mut instance = self.lock();
        if instance.generation != generation {
            debug!(
                "Worker {} generation {} exited after being replaced",
                self.name, generation
            );
            return;
        }

        let result = match instance.state() {
            WorkerState::Running => {
                warn!("Worker {} exited unexpectedly ({})", self.name, exit);
                instance
                    .machine
                    .record_unexpected_exit(format!("unexpected exit: {}", exit))
            }
            WorkerState::Starting => {
                warn!("Worker {} exited during startup ({})", self.name, exit);
                instance.last_error = Some(SupervisorError::start_failed(
                    self.name.as_str(),
                    format!("exited during startup: {}", exit),
                ));
                instance.machine.abandon_start(format!("exited during startup: {}", exit))
            }
            WorkerState::Stopping => {
                info!("Worker {} exited ({})", self.name, exit);
                instance.machine.complete_stop()
            }
            WorkerState::Stopped => return,
        };

        if let Err(e) = result {
            warn!("Worker {}: {}", self.name, e);
            return;
        }
        instance.clear_process();
        self.publish(WorkerState::Stopped);
    }

    /// Running and unused for strictly longer than `timeout`.
    pub(crate) fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        let instance = self.lock();
        instance.state() == WorkerState::Running
            && now.saturating_duration_since(instance.last_used_at) > timeout
    }

    /// When the worker was last requested, if it is running.
    pub(crate) fn last_used_if_running(&self) -> Option<Instant> {
        let instance = self.lock();
        (instance.state() == WorkerState::Running).then_some(instance.last_used_at)
    }

    pub(crate) fn status(&self, now: Instant) -> WorkerStatus {
        let instance = self.lock();
        let running = instance.state() == WorkerState::Running;
        WorkerStatus {
            name: self.name.clone(),
            state: instance.state(),
            pid: instance.handle.as_ref().map(|h| h.pid),
            generation: instance.generation,
            use_count: instance.use_count,
            idle_for: now.saturating_duration_since(instance.last_used_at),
            uptime: instance
                .started_at
                .filter(|_| running)
                .map(|started| now.saturating_duration_since(started)),
        }
    }
}
