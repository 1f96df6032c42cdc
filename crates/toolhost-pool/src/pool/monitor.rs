//! Exit monitor: the task that owns a worker process.
//!
//! It reaps the process, applies terminate/kill requests sent over its
//! control channel, and reports the exit to the slot and to anyone waiting
//! on the exit watch. If every control sender is dropped while the process
//! is still alive, nobody can stop it anymore, so it is killed.

use super::instance::WorkerSlot;
use crate::launcher::{WorkerExit, WorkerProcess};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlSignal {
    Terminate,
    Kill,
}

pub(crate) fn spawn_exit_monitor(
    slot: Arc<WorkerSlot>,
    generation: u64,
    mut process: Box<dyn WorkerProcess>,
    mut control_rx: mpsc::UnboundedReceiver<ControlSignal>,
    exit_tx: watch::Sender<Option<WorkerExit>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pid = process.pid();
        let name = slot.name().clone();
        debug!("Exit monitor started for {} (PID: {})", name, pid);

        let mut control_open = true;
        let waited = loop {
            let signal = tokio::select! {
                result = process.wait() => break result,
                signal = control_rx.recv(), if control_open => signal,
            };

            let result = match signal {
                Some(ControlSignal::Terminate) => process.terminate(),
                Some(ControlSignal::Kill) => process.force_kill(),
                None => {
                    control_open = false;
                    debug!("Control channel for {} closed, killing PID {}", name, pid);
                    process.force_kill()
                }
            };
            if let Err(e) = result {
                warn!("Signal to {} (PID: {}) failed: {}", name, pid, e);
            }
        };

        let exit = match waited {
            Ok(exit) => exit,
            Err(e) => {
                warn!("Failed to wait for {} (PID: {}): {}", name, pid, e);
                WorkerExit::default()
            }
        };

        slot.on_process_exit(generation, &exit);
        exit_tx.send_replace(Some(exit));
        debug!("Exit monitor finished for {} (PID: {}): {}", name, pid, exit);
    })
}
