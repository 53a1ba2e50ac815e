//! Rewrite worker and stopper threads.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::affinity;
use super::log::{LOG_TARGET, PROGRESS_TARGET};
use super::{WorkerOutcome, WorkerReport};
use crate::rewrite::ProcedureExecutor;
use crate::store::{StoreConfig, StoreError};

/// A worker that issues a single procedure invocation on its own connection.
pub(super) struct RewriteWorker<E: ?Sized> {
    /// The worker ID.
    pub id: usize,
    /// The invocation to run.
    pub invocation: String,
    /// Whether to pin the thread to a core.
    pub pin: bool,
    /// The store to connect to.
    pub store: StoreConfig,
    /// Runs the invocation.
    pub executor: Arc<E>,
}

impl<E> RewriteWorker<E>
where
    E: ProcedureExecutor + ?Sized + 'static,
{
    /// Spawn the worker thread.
    pub fn spawn(self) -> io::Result<JoinHandle<WorkerReport>> {
        let name = format!("RewriteWorker-{}", self.id);
        thread::Builder::new().name(name).spawn(move || self.run())
    }

    #[tracing::instrument(target = "linkcirc::metrics", skip(self), fields(worker = self.id))]
    fn run(self) -> WorkerReport {
        let start = Instant::now();
        if self.pin && !affinity::pin_current_thread(self.id) {
            tracing::debug!(target: PROGRESS_TARGET, worker = self.id, "CPU pinning unavailable");
        }
        let outcome = match self.store.open() {
            Err(e) => WorkerOutcome::Failed {
                error: e.to_string(),
            },
            Ok(mut store) => match self.executor.invoke(&mut store, &self.invocation) {
                Ok(outcome) => WorkerOutcome::Finished(outcome),
                Err(e) => WorkerOutcome::Failed {
                    error: e.to_string(),
                },
            },
        };
        WorkerReport {
            worker_id: self.id,
            invocation: self.invocation,
            outcome,
            elapsed: start.elapsed(),
        }
    }
}

/// Spawn the stopper thread, the only writer of the stop flag during a run.
///
/// It sets the flag once `timeout` has passed, or as soon as a message
/// arrives on `control`. Disconnecting `control` releases it without setting
/// the flag. The thread returns whether it set the flag.
pub(super) fn spawn_stopper(
    store: StoreConfig,
    timeout: Duration,
    control: Receiver<()>,
) -> io::Result<JoinHandle<Result<bool, StoreError>>> {
    thread::Builder::new()
        .name("RewriteStopper".to_string())
        .spawn(move || {
            let reason = match control.recv_timeout(timeout) {
                Err(RecvTimeoutError::Disconnected) => return Ok(false),
                Err(RecvTimeoutError::Timeout) => "Timeout reached",
                Ok(()) => "Run aborted",
            };
            store.open()?.request_stop()?;
            tracing::info!(target: LOG_TARGET, "{reason}, stopping rewrite workers.");
            Ok(true)
        })
}
