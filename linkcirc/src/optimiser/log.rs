//! Logging utilities for optimisation runs.

use std::io;
use std::time::Duration;

use super::{RunReport, WorkerOutcome, WorkerReport};

/// The logging target for general events.
pub const LOG_TARGET: &str = "linkcirc::log";
/// The logging target for progress events. More verbose than the general log.
pub const PROGRESS_TARGET: &str = "linkcirc::progress";
/// The logging target for function spans.
pub const METRICS_TARGET: &str = "linkcirc::metrics";

/// Logging configuration for optimisation runs.
#[derive(Default)]
pub struct RunLogger<'w> {
    worker_csv: Option<csv::Writer<Box<dyn io::Write + Send + Sync + 'w>>>,
}

impl<'w> RunLogger<'w> {
    /// Create a logger that also appends one CSV row per finished worker to
    /// `worker_csv_writer`.
    ///
    /// Regular events are logged with [`tracing`], with targets
    /// [`LOG_TARGET`] or [`PROGRESS_TARGET`].
    pub fn new(worker_csv_writer: impl io::Write + Send + Sync + 'w) -> Self {
        let boxed: Box<dyn io::Write + Send + Sync + 'w> = Box::new(worker_csv_writer);
        Self {
            worker_csv: Some(csv::Writer::from_writer(boxed)),
        }
    }

    /// Log the start of a run.
    pub fn log_run_start(&self, workers: usize, timeout: Duration) {
        self.log(format!(
            "Starting {workers} rewrite workers with a {:.2}s timeout.",
            timeout.as_secs_f32()
        ));
    }

    /// Log a worker that has terminated.
    pub fn log_worker(&mut self, report: &WorkerReport) {
        match &report.outcome {
            WorkerOutcome::Finished(outcome) => self.progress(format!(
                "Worker {} applied {} rewrites in {:.2}s ({} conflicts).",
                report.worker_id,
                outcome.applied,
                report.elapsed.as_secs_f32(),
                outcome.conflicts
            )),
            WorkerOutcome::Failed { error } => {
                self.warn(format!("Worker {} failed: {error}", report.worker_id))
            }
            WorkerOutcome::Crashed => self.warn(format!(
                "Worker {} crashed running {}",
                report.worker_id, report.invocation
            )),
        }
        if let Some(csv_writer) = self.worker_csv.as_mut() {
            let written = csv_writer
                .serialize(WorkerRecord::new(report))
                .and_then(|()| csv_writer.flush().map_err(csv::Error::from));
            if let Err(e) = written {
                tracing::warn!(target: LOG_TARGET, "Could not write the worker log: {e}");
            }
        }
    }

    /// Log the end of a run.
    pub fn log_run_end(&self, report: &RunReport) {
        let elapsed_secs = report.elapsed.as_secs_f32();
        match report.stopper_fired {
            true => self.log(format!("Run finished in {elapsed_secs:.2}s (timeout).")),
            false => self.log(format!("Run finished in {elapsed_secs:.2}s.")),
        };
        self.log(format!(
            "Applied {} rewrites over {} workers.",
            report.applied(),
            report.workers.len()
        ));
        let failed = report.failures();
        if failed > 0 {
            self.warn(format!("{failed} workers did not finish cleanly."));
        }
    }

    /// Log general events, normally printed to stdout.
    #[inline]
    pub fn log(&self, msg: impl AsRef<str>) {
        tracing::info!(target: LOG_TARGET, "{}", msg.as_ref());
    }

    /// Log a warning message.
    #[inline]
    pub fn warn(&self, msg: impl AsRef<str>) {
        tracing::warn!(target: LOG_TARGET, "{}", msg.as_ref());
    }

    /// Log verbose information on the progress of the run.
    #[inline]
    pub fn progress(&self, msg: impl AsRef<str>) {
        tracing::info!(target: PROGRESS_TARGET, "{}", msg.as_ref());
    }
}

/// One CSV row per terminated worker.
#[derive(serde::Serialize, Clone, Debug)]
struct WorkerRecord<'a> {
    worker: usize,
    invocation: &'a str,
    status: &'static str,
    applied: usize,
    iterations: usize,
    conflicts: usize,
    elapsed_secs: f64,
    time: String,
}

impl<'a> WorkerRecord<'a> {
    fn new(report: &'a WorkerReport) -> Self {
        let (status, outcome) = match &report.outcome {
            WorkerOutcome::Finished(o) => ("finished", *o),
            WorkerOutcome::Failed { .. } => ("failed", Default::default()),
            WorkerOutcome::Crashed => ("crashed", Default::default()),
        };
        Self {
            worker: report.worker_id,
            invocation: &report.invocation,
            status,
            applied: outcome.applied,
            iterations: outcome.iterations,
            conflicts: outcome.conflicts,
            elapsed_secs: report.elapsed.as_secs_f64(),
            time: chrono::Local::now().to_rfc3339(),
        }
    }
}
