//! Background threads: projection consumers and the auto-pilot scheduler.

use std::sync::mpsc;
use std::thread;

pub mod autopilot;
pub mod projection_worker;

pub use autopilot::{AutoPilot, Clock, SystemClock, TickOutcome};
pub use projection_worker::ProjectionWorker;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: &'static str, shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                tracing::error!(worker = self.name, "worker thread panicked");
            }
        }
    }
}
