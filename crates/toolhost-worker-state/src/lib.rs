//! # Toolhost Worker State
//!
//! Lifecycle state machine for a single named worker.
//!
//! A worker cycles `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//! Two shortcuts back to `Stopped` exist for failures: a start that never
//! reached `Running`, and a running process that exited on its own. Nothing
//! may leave `Stopped` except through `Starting`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use toolhost_common::{SupervisorError, SupervisorResult};

/// Maximum number of transitions remembered per worker.
pub const HISTORY_LIMIT: usize = 32;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No process is associated with the worker
    Stopped,
    /// A spawn is in flight; callers wait instead of spawning again
    Starting,
    /// The process is up and its handle can be handed out
    Running,
    /// A stop was requested and the process has not been reaped yet
    Stopping,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Stopped => write!(f, "stopped"),
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Stopping => write!(f, "stopping"),
        }
    }
}

impl WorkerState {
    /// Whether a process is associated with the worker in this state.
    pub fn has_process(&self) -> bool {
        !matches!(self, WorkerState::Stopped)
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, WorkerState::Starting | WorkerState::Stopping)
    }
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: WorkerState,
    pub to_state: WorkerState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Validating state machine for one worker name.
#[derive(Debug, Clone)]
pub struct WorkerStateMachine {
    worker_id: String,
    current_state: WorkerState,
    history: VecDeque<StateTransition>,
    last_transition_time: DateTime<Utc>,
}

impl WorkerStateMachine {
    pub fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            current_state: WorkerState::Stopped,
            history: VecDeque::new(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn current_state(&self) -> WorkerState {
        self.current_state
    }

    pub fn last_transition_time(&self) -> DateTime<Utc> {
        self.last_transition_time
    }

    /// Oldest first, at most [`HISTORY_LIMIT`] entries.
    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    pub fn last_transition(&self) -> Option<&StateTransition> {
        self.history.back()
    }

    pub fn is_valid_transition(&self, target: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self.current_state, target),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
        )
    }

    pub fn transition_to(
        &mut self,
        target: WorkerState,
        reason: Option<String>,
    ) -> SupervisorResult<()> {
        if !self.is_valid_transition(target) {
            return Err(SupervisorError::invalid_state(
                &self.worker_id,
                target.to_string(),
                self.current_state.to_string(),
            ));
        }

        let from = self.current_state;
        let now = Utc::now();
        self.history.push_back(StateTransition {
            from_state: from,
            to_state: target,
            timestamp: now,
            reason,
        });
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.current_state = target;
        self.last_transition_time = now;

        tracing::debug!("Worker {} transitioned {} -> {}", self.worker_id, from, target);
        Ok(())
    }

    pub fn begin_start(&mut self) -> SupervisorResult<()> {
        self.transition_to(WorkerState::Starting, Some("start requested".to_string()))
    }

    pub fn complete_start(&mut self) -> SupervisorResult<()> {
        self.transition_to(WorkerState::Running, Some("process started".to_string()))
    }

    /// Starting -> Stopped after a failed spawn.
    pub fn abandon_start(&mut self, reason: impl Into<String>) -> SupervisorResult<()> {
        self.transition_to(WorkerState::Stopped, Some(reason.into()))
    }

    pub fn begin_stop(&mut self) -> SupervisorResult<()> {
        self.transition_to(WorkerState::Stopping, Some("stop requested".to_string()))
    }

    pub fn complete_stop(&mut self) -> SupervisorResult<()> {
        self.transition_to(WorkerState::Stopped, Some("process stopped".to_string()))
    }

    /// Running -> Stopped when the process died without being asked to.
    pub fn record_unexpected_exit(&mut self, reason: impl Into<String>) -> SupervisorResult<()> {
        self.transition_to(WorkerState::Stopped, Some(reason.into()))
    }

    /// Number of times the worker entered `Starting`, within the retained history.
    pub fn start_count(&self) -> usize {
        self.history
            .iter()
            .filter(|t| t.to_state == WorkerState::Starting)
            .count()
    }

    pub fn time_in_current_state(&self) -> chrono::Duration {
        Utc::now() - self.last_transition_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_machine_is_stopped() {
        let sm = WorkerStateMachine::new("alpha");
        assert_eq!(sm.current_state(), WorkerState::Stopped);
        assert_eq!(sm.history().count(), 0);
        assert!(sm.last_transition().is_none());
    }

    #[test]
    fn test_full_cycle() {
        let mut sm = WorkerStateMachine::new("alpha");
        sm.begin_start().unwrap();
        assert_eq!(sm.current_state(), WorkerState::Starting);
        sm.complete_start().unwrap();
        assert_eq!(sm.current_state(), WorkerState::Running);
        sm.begin_stop().unwrap();
        assert_eq!(sm.current_state(), WorkerState::Stopping);
        sm.complete_stop().unwrap();
        assert_eq!(sm.current_state(), WorkerState::Stopped);

        let history: Vec<_> = sm.history().collect();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].from_state, WorkerState::Stopped);
        assert_eq!(history[3].to_state, WorkerState::Stopped);
    }

    #[test]
    fn test_cannot_skip_starting() {
        let mut sm = WorkerStateMachine::new("alpha");
        assert!(!sm.is_valid_transition(WorkerState::Running));
        let err = sm.transition_to(WorkerState::Running, None).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidState { .. }));
        assert!(sm.transition_to(WorkerState::Stopping, None).is_err());
        assert_eq!(sm.current_state(), WorkerState::Stopped);
    }

    #[test]
    fn test_self_transitions_rejected() {
        let mut sm = WorkerStateMachine::new("alpha");
        assert!(sm.transition_to(WorkerState::Stopped, None).is_err());
        sm.begin_start().unwrap();
        assert!(sm.begin_start().is_err());
    }

    #[test]
    fn test_failure_paths_return_to_stopped() {
        let mut sm = WorkerStateMachine::new("alpha");
        sm.begin_start().unwrap();
        sm.abandon_start("spawn failed").unwrap();
        assert_eq!(sm.current_state(), WorkerState::Stopped);
        assert_eq!(
            sm.last_transition().unwrap().reason.as_deref(),
            Some("spawn failed")
        );

        sm.begin_start().unwrap();
        sm.complete_start().unwrap();
        sm.record_unexpected_exit("exit status 1").unwrap();
        assert_eq!(sm.current_state(), WorkerState::Stopped);
        assert_eq!(sm.start_count(), 2);
    }

    #[test]
    fn test_stopping_cannot_restart_directly() {
        let mut sm = WorkerStateMachine::new("alpha");
        sm.begin_start().unwrap();
        sm.complete_start().unwrap();
        sm.begin_stop().unwrap();
        assert!(!sm.is_valid_transition(WorkerState::Starting));
        assert!(!sm.is_valid_transition(WorkerState::Running));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sm = WorkerStateMachine::new("alpha");
        for _ in 0..HISTORY_LIMIT {
            sm.begin_start().unwrap();
            sm.abandon_start("again").unwrap();
        }
        assert_eq!(sm.history().count(), HISTORY_LIMIT);
        assert_eq!(sm.last_transition().unwrap().to_state, WorkerState::Stopped);
    }

    #[test]
    fn test_state_properties() {
        assert!(!WorkerState::Stopped.has_process());
        assert!(WorkerState::Stopping.has_process());
        assert!(WorkerState::Starting.is_transitional());
        assert!(!WorkerState::Running.is_transitional());
        assert_eq!(WorkerState::Running.to_string(), "running");
    }
}
