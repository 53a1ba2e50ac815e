//! Concurrent in-place optimisation of stored circuits.
//!
//! An [`OptimisationOrchestrator`] runs a list of [`Directive`]s against a
//! shared [`GraphStore`][crate::store::GraphStore]. Every replica of every
//! directive gets its own thread and its own store connection, and issues
//! exactly one procedure invocation through a [`ProcedureExecutor`]. There
//! are no locks between workers: each procedure iteration is atomic in the
//! store, and a worker whose match was changed by someone else simply misses
//! it.
//!
//! A separate stopper thread sets the store's stop flag once the timeout
//! expires, or when the run is aborted. Procedures poll the flag between
//! iterations, so cancellation takes at most one iteration. If every worker
//! finishes first, the stopper is released without setting the flag.
//!
//! A worker that fails or panics is recorded in the [`RunReport`] and never
//! retried. The other workers run to completion regardless.

pub mod affinity;
pub mod directive;
pub mod log;
mod worker;

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};

pub use directive::{Directive, ProcedureCall, RunCount, Sampling, DEFAULT_RUN_COUNT};
pub use log::RunLogger;

use crate::rewrite::{ProcedureExecutor, ProcedureOutcome};
use crate::store::{StoreConfig, StoreError};
use worker::{spawn_stopper, RewriteWorker};

/// Configuration options for an optimisation run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorOptions {
    /// Seconds before the stop flag is set.
    ///
    /// Defaults to 60.
    pub timeout: f64,
    /// Whether to pin each worker to its own physical core.
    ///
    /// Defaults to `false`.
    pub pin_cores: bool,
    /// Raise the id sequence to at least this value before starting, so
    /// that nodes inserted concurrently get fresh ids.
    ///
    /// Defaults to `None`.
    pub id_watermark: Option<i64>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            timeout: 60.0,
            pin_cores: false,
            id_watermark: None,
        }
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerOutcome {
    /// The invocation returned.
    Finished(ProcedureOutcome),
    /// The invocation returned an error.
    Failed {
        /// The error message.
        error: String,
    },
    /// The worker thread panicked.
    Crashed,
}

/// What one worker did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Worker index over the whole run.
    pub worker_id: usize,
    /// The invocation it issued.
    pub invocation: String,
    /// How it ended.
    pub outcome: WorkerOutcome,
    /// Time spent in the worker.
    pub elapsed: Duration,
}

/// Summary of an optimisation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// One entry per worker, in worker order.
    pub workers: Vec<WorkerReport>,
    /// Wall time of the run.
    pub elapsed: Duration,
    /// Whether the stopper set the stop flag before every worker finished.
    pub stopper_fired: bool,
}

impl RunReport {
    /// Total rewrites applied.
    pub fn applied(&self) -> usize {
        self.workers
            .iter()
            .map(|w| match &w.outcome {
                WorkerOutcome::Finished(o) => o.applied,
                _ => 0,
            })
            .sum()
    }

    /// Number of workers that failed or crashed.
    pub fn failures(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| !matches!(w.outcome, WorkerOutcome::Finished(_)))
            .count()
    }
}

/// Runs concurrent rewrite workers against a shared store.
#[derive(Debug, Clone)]
pub struct OptimisationOrchestrator<E: ?Sized> {
    store: StoreConfig,
    executor: Arc<E>,
}

impl<E: ProcedureExecutor + 'static> OptimisationOrchestrator<E> {
    /// Create an orchestrator for the store at `store`.
    pub fn new(store: StoreConfig, executor: E) -> Self {
        Self::with_shared_executor(store, Arc::new(executor))
    }
}

impl<E: ProcedureExecutor + ?Sized + 'static> OptimisationOrchestrator<E> {
    /// Create an orchestrator sharing an existing executor.
    pub fn with_shared_executor(store: StoreConfig, executor: Arc<E>) -> Self {
        Self { store, executor }
    }

    /// The store workers connect to.
    pub fn store_config(&self) -> &StoreConfig {
        &self.store
    }

    /// Run all directives concurrently and wait for every worker.
    pub fn run(
        &self,
        directives: &[Directive],
        options: &OrchestratorOptions,
    ) -> Result<RunReport, OrchestratorError> {
        self.run_with_log(directives, options, &mut RunLogger::default())
    }

    /// Run all directives concurrently and wait for every worker, logging
    /// progress to `logger`.
    #[tracing::instrument(target = "linkcirc::metrics", skip_all)]
    pub fn run_with_log(
        &self,
        directives: &[Directive],
        options: &OrchestratorOptions,
        logger: &mut RunLogger,
    ) -> Result<RunReport, OrchestratorError> {
        let timeout = Duration::try_from_secs_f64(options.timeout).map_err(|_| {
            OrchestratorError::InvalidConfiguration {
                reason: format!("timeout must be a non-negative number, got {}", options.timeout),
            }
        })?;
        if let Some(d) = directives.iter().find(|d| d.replicas == 0) {
            return Err(OrchestratorError::InvalidConfiguration {
                reason: format!("directive {} has no replicas", d.call.name()),
            });
        }

        let mut control = self.store.open()?;
        control.reset_stop()?;
        if let Some(watermark) = options.id_watermark {
            let next = control.advance_id_watermark(watermark)?;
            logger.progress(format!("Id sequence advanced to {next}."));
        }

        let workers = directives
            .iter()
            .flat_map(|d| {
                (0..d.replicas).map(move |replica| {
                    d.call
                        .invocation(replica, d.replicas, options.timeout)
                        .to_string()
                })
            })
            .enumerate()
            .map(|(id, invocation)| RewriteWorker {
                id,
                invocation,
                pin: options.pin_cores,
                store: self.store.clone(),
                executor: self.executor.clone(),
            })
            .collect::<Vec<_>>();
        logger.log_run_start(workers.len(), timeout);

        let start = Instant::now();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let stopper = spawn_stopper(self.store.clone(), timeout, stop_rx)?;

        let mut handles = Vec::with_capacity(workers.len());
        let mut spawn_error = None;
        for worker in workers {
            let (id, invocation) = (worker.id, worker.invocation.clone());
            match worker.spawn() {
                Ok(handle) => handles.push((id, invocation, handle)),
                Err(e) => {
                    // Stop the workers already running before bailing out.
                    if stop_tx.send(()).is_err() {
                        logger.warn("The stopper exited before the run was aborted.");
                    }
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        let mut report = RunReport::default();
        for (worker_id, invocation, handle) in handles {
            let worker = handle.join().unwrap_or_else(|_| WorkerReport {
                worker_id,
                invocation,
                outcome: WorkerOutcome::Crashed,
                elapsed: start.elapsed(),
            });
            logger.log_worker(&worker);
            report.workers.push(worker);
        }

        // Every worker is done: release the stopper early.
        drop(stop_tx);
        report.stopper_fired = match stopper.join() {
            Ok(fired) => fired?,
            Err(_) => {
                logger.warn("The stopper thread panicked.");
                false
            }
        };
        control.reset_stop()?;
        report.elapsed = start.elapsed();

        if let Some(e) = spawn_error {
            return Err(OrchestratorError::Spawn(e));
        }
        logger.log_run_end(&report);
        Ok(report)
    }
}

/// Errors that prevent an optimisation run from starting or completing.
#[derive(Debug, Display, From, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// The directives or options were rejected before any work started.
    #[display("Invalid orchestrator configuration: {reason}")]
    #[from(ignore)]
    InvalidConfiguration {
        /// What was wrong.
        reason: String,
    },
    /// The control connection failed.
    Store(StoreError),
    /// A thread could not be spawned.
    #[display("Could not spawn a worker thread: {_0}")]
    Spawn(io::Error),
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::rewrite::ProcedureError;
    use crate::store::GraphStore;
    use cool_asserts::assert_matches;
    use rstest::rstest;
    use tempfile::TempDir;

    /// Counts calls, panics on `panic()` and fails on `fail()`.
    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
    }

    impl ProcedureExecutor for Recorder {
        fn invoke(
            &self,
            store: &mut GraphStore,
            invocation: &str,
        ) -> Result<ProcedureOutcome, ProcedureError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match invocation {
                "panic()" => panic!("worker crash"),
                "fail()" => Err(ProcedureError::UnknownProcedure {
                    name: "fail".to_string(),
                }),
                "wait()" => {
                    while !store.stop_requested()? {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Ok(ProcedureOutcome {
                        stopped: true,
                        ..Default::default()
                    })
                }
                _ => Ok(ProcedureOutcome {
                    applied: 1,
                    iterations: 1,
                    ..Default::default()
                }),
            }
        }
    }

    /// An executor that ignores the rendered invocation.
    struct Fixed(&'static str, Recorder);

    impl ProcedureExecutor for Fixed {
        fn invoke(
            &self,
            store: &mut GraphStore,
            invocation: &str,
        ) -> Result<ProcedureOutcome, ProcedureError> {
            match invocation.starts_with(self.0) {
                true => self.1.invoke(store, invocation),
                false => self.1.invoke(store, &format!("{}()", self.0)),
            }
        }
    }

    fn temp_store() -> (TempDir, StoreConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("graph.db"));
        config.open().unwrap();
        (dir, config)
    }

    fn directive(replicas: usize) -> Directive {
        Directive::new(replicas, ProcedureCall::new("noop", 0))
    }

    #[test]
    fn runs_every_replica() {
        let (_dir, config) = temp_store();
        let orchestrator = OptimisationOrchestrator::new(config, Recorder::default());
        let report = orchestrator
            .run(&[directive(3), directive(2)], &OrchestratorOptions::default())
            .unwrap();
        assert_eq!(report.workers.len(), 5);
        assert_eq!(report.applied(), 5);
        assert!(!report.stopper_fired);
        assert_eq!(orchestrator.executor.calls.load(Ordering::SeqCst), 5);
        // Worker-local ids restart for each directive.
        assert!(report.workers[4].invocation.contains(", 1, 2, 60.0)"));
    }

    #[test]
    fn timeout_stops_workers() {
        let (_dir, config) = temp_store();
        let orchestrator =
            OptimisationOrchestrator::new(config.clone(), Fixed("wait", Recorder::default()));
        let options = OrchestratorOptions {
            timeout: 0.1,
            ..Default::default()
        };
        let report = orchestrator.run(&[directive(2)], &options).unwrap();
        assert!(report.stopper_fired);
        assert!(report
            .workers
            .iter()
            .all(|w| matches!(w.outcome, WorkerOutcome::Finished(o) if o.stopped)));
        // The flag is cleared for the next run.
        assert!(!config.open().unwrap().stop_requested().unwrap());
    }

    #[rstest]
    #[case::crash("panic", WorkerOutcome::Crashed)]
    #[case::failure("fail", WorkerOutcome::Failed { error: "Unknown procedure fail.".to_string() })]
    fn failures_are_recorded(#[case] kind: &'static str, #[case] expected: WorkerOutcome) {
        let (_dir, config) = temp_store();
        let orchestrator = OptimisationOrchestrator::new(config, Fixed(kind, Recorder::default()));
        let report = orchestrator
            .run(&[directive(1)], &OrchestratorOptions::default())
            .unwrap();
        assert_eq!(report.workers[0].outcome, expected);
        assert_eq!(report.failures(), 1);
    }

    #[test]
    fn watermark() {
        let (_dir, config) = temp_store();
        let orchestrator = OptimisationOrchestrator::new(config.clone(), Recorder::default());
        let options = OrchestratorOptions {
            id_watermark: Some(1 << 40),
            ..Default::default()
        };
        orchestrator.run(&[], &options).unwrap();
        assert_eq!(config.open().unwrap().next_id().unwrap(), 1 << 40);
    }

    #[rstest]
    #[case(OrchestratorOptions { timeout: -1.0, ..Default::default() }, directive(1))]
    #[case(OrchestratorOptions::default(), directive(0))]
    fn invalid_configuration(#[case] options: OrchestratorOptions, #[case] directive: Directive) {
        let (_dir, config) = temp_store();
        let orchestrator = OptimisationOrchestrator::new(config, Recorder::default());
        assert_matches!(
            orchestrator.run(&[directive], &options),
            Err(OrchestratorError::InvalidConfiguration { .. })
        );
    }
}
