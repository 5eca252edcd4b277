use thiserror::Error;
use tracing::{debug, info, warn};

use crate::applier::{MutationApplier, MutationTask, RowOutcome, WriteSink};
use crate::checkpoint::CheckpointStore;
use crate::config::RunConfig;
use crate::cursor::{RowCursor, Window};
use crate::error::RunError;
use crate::fetcher::{BatchFetcher, KeyBounds, RowSource};
use crate::gate::{LagOracle, ReplicationGate};
use crate::interrupt::Interrupt;
use crate::report::{Counts, Reporter, RunReport, RunStatus};
use crate::row::Key;

/// A run that stopped before the key space was exhausted. `report` carries
/// the best-known totals and the cursor to resume from.
#[derive(Debug, Error)]
#[error("run aborted at cursor {}", .report.cursor)]
pub struct Aborted {
    pub report: RunReport,
    #[source]
    pub error: RunError,
}

/// The batch loop: cursor, fetch, decide/apply, commit, report, gate, sleep.
pub struct BatchRunner<S, T, W, O> {
    config: RunConfig,
    fetcher: BatchFetcher<S>,
    applier: MutationApplier<T, W>,
    gate: ReplicationGate<O>,
    interrupt: Interrupt,
    checkpoint: Option<CheckpointStore>,
}

impl<S, T, W, O> BatchRunner<S, T, W, O>
where
    S: RowSource,
    T: MutationTask,
    W: WriteSink,
    O: LagOracle,
{
    pub fn new(config: RunConfig, source: S, task: T, sink: W, oracle: O) -> Self {
        let fetcher = BatchFetcher::new(source, config.retry.clone());
        let applier = MutationApplier::new(task, sink, config.dry_run);
        let interrupt = Interrupt::new();
        let gate = ReplicationGate::new(oracle, config.lag_poll_interval)
            .with_interrupt(interrupt.clone());
        Self {
            config,
            fetcher,
            applier,
            gate,
            interrupt,
            checkpoint: None,
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.gate = self.gate.with_interrupt(interrupt.clone());
        self.interrupt = interrupt;
        self
    }

    pub fn with_checkpoint(mut self, store: CheckpointStore) -> Self {
        self.checkpoint = Some(store);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn fetcher(&self) -> &BatchFetcher<S> {
        &self.fetcher
    }

    pub fn applier(&self) -> &MutationApplier<T, W> {
        &self.applier
    }

    pub fn gate(&self) -> &ReplicationGate<O> {
        &self.gate
    }

    pub fn run(&mut self, reporter: &mut dyn Reporter) -> Result<RunReport, Aborted> {
        let task = self.applier.task().name().to_string();
        let dry_run = self.config.dry_run;

        if let Err(error) = self.config.validate() {
            let report = RunReport::new(&task, dry_run, self.config.start.unwrap_or(0));
            return Err(self.abort(reporter, report, RunError::Configuration(error)));
        }

        let bounds = match self.fetcher.key_bounds() {
            Ok(bounds) => bounds,
            Err(source) => {
                let start = self.config.start.unwrap_or(0);
                let report = RunReport::new(&task, dry_run, start);
                let window = Window {
                    low: start,
                    high: start.saturating_add(self.config.batch_size),
                };
                return Err(self.abort(
                    reporter,
                    report,
                    RunError::FatalFetch {
                        window,
                        cursor: start,
                        source,
                    },
                ));
            }
        };

        let start = self
            .config
            .start
            .or(bounds.map(|bounds| bounds.min))
            .unwrap_or(0);
        let mut cursor = match RowCursor::new(start, self.config.batch_size) {
            Ok(cursor) => cursor,
            Err(error) => {
                let report = RunReport::new(&task, dry_run, start);
                return Err(self.abort(reporter, report, RunError::Configuration(error)));
            }
        };
        let mut report = RunReport::new(&task, dry_run, start);

        info!(
            "{task}: {} from key {start}, batch size {}{}",
            self.applier.task().describe(),
            self.config.batch_size,
            if dry_run { " (dry run)" } else { "" }
        );
        if let Some(KeyBounds { min, max }) = bounds {
            debug!("source keys span [{min}, {max}]");
            if max == Key::MAX {
                warn!("a row keyed {max} lies past the last window and will not be visited");
            }
        }

        loop {
            if cursor.is_exhausted() {
                break;
            }
            let window = cursor.next_window();
            if bounds.is_some_and(|bounds| window.low > bounds.max) {
                break;
            }
            if self.interrupt.is_triggered() {
                warn!("interrupt received; stopping before window at {}", cursor.position());
                let error = RunError::Interrupted {
                    cursor: cursor.position(),
                };
                return Err(self.abort(reporter, report, error));
            }

            let rows = match self.fetcher.fetch(window) {
                Ok(rows) => rows,
                Err(source) => {
                    let error = RunError::FatalFetch {
                        window,
                        cursor: cursor.position(),
                        source,
                    };
                    return Err(self.abort(reporter, report, error));
                }
            };
            if rows.is_empty() && bounds.is_none() {
                debug!("window {window} returned no rows; key space exhausted");
                break;
            }

            let mut counts = Counts::default();
            let mut failed_at = None;
            for row in &rows {
                counts.scanned += 1;
                match self.applier.process(window, row) {
                    RowOutcome::Applied | RowOutcome::WouldApply => counts.mutated += 1,
                    RowOutcome::Skipped => counts.skipped += 1,
                    RowOutcome::Failed(error) => {
                        counts.errors += 1;
                        if self.config.fail_fast {
                            failed_at = Some(error);
                            break;
                        }
                    }
                }
            }

            if let Err(error) = self.applier.finish_window() {
                if let Err(rollback) = self.applier.abandon_window() {
                    warn!("rollback after failed commit also failed: {rollback:#}");
                }
                let error = RunError::Sink {
                    window,
                    cursor: cursor.position(),
                    message: format!("{error:#}"),
                };
                return Err(self.abort(reporter, report, error));
            }

            // Fail-fast stops in front of the failing row: everything before
            // it is committed, the row itself is retried on resume.
            let confirmed = failed_at.as_ref().map_or(window.high, |error| error.key);
            if let Err(source) = cursor.advance(confirmed) {
                let error = RunError::Cursor {
                    cursor: cursor.position(),
                    source,
                };
                return Err(self.abort(reporter, report, error));
            }
            report.windows += 1;
            report.totals.add(&counts);
            report.cursor = cursor.position();
            reporter.report_batch(window, &counts, cursor.position());

            if let Some(source) = failed_at {
                let error = RunError::FailFast {
                    cursor: cursor.position(),
                    source,
                };
                return Err(self.abort(reporter, report, error));
            }

            if let Err(error) = self.save_checkpoint(&report) {
                return Err(self.abort(reporter, report, error));
            }

            if let Err(timeout) = self
                .gate
                .wait_until_caught(self.config.max_lag, self.config.lag_timeout)
            {
                let error = RunError::ReplicationTimeout {
                    cursor: cursor.position(),
                    timeout: self.config.lag_timeout,
                    detail: timeout.detail,
                };
                return Err(self.abort(reporter, report, error));
            }

            if !self.config.sleep.is_zero() {
                self.interrupt.sleep(self.config.sleep);
            }
        }

        report.status = RunStatus::Completed;
        if let Err(error) = self.save_checkpoint(&report) {
            return Err(self.abort(reporter, report, error));
        }
        info!(
            "{task}: completed after {} windows; {} mutated, {} skipped, {} errors",
            report.windows, report.totals.mutated, report.totals.skipped, report.totals.errors
        );
        reporter.report_final(&report, None);
        Ok(report)
    }

    /// Dry runs never move the checkpoint; a later commit run resumes from
    /// where the last commit run stopped.
    fn save_checkpoint(&self, report: &RunReport) -> Result<(), RunError> {
        let Some(store) = &self.checkpoint else {
            return Ok(());
        };
        if self.config.dry_run {
            return Ok(());
        }
        store.save(report).map_err(|error| RunError::Checkpoint {
            cursor: report.cursor,
            message: format!("{error:#}"),
        })
    }

    fn abort(&self, reporter: &mut dyn Reporter, mut report: RunReport, error: RunError) -> Aborted {
        report.status = RunStatus::Aborted;
        if let Some(cursor) = error.cursor() {
            report.cursor = cursor;
        }
        let records_progress = !matches!(
            error,
            RunError::Configuration(_) | RunError::Checkpoint { .. }
        );
        if records_progress && let Err(save_error) = self.save_checkpoint(&report) {
            warn!("{save_error}");
        }
        warn!("{}: aborted at cursor {}: {error}", report.task, report.cursor);
        reporter.report_final(&report, Some(&error));
        Aborted { report, error }
    }
}

/// Resume position for an aborted run, or `None` when it completed.
pub fn resume_cursor(result: &Result<RunReport, Aborted>) -> Option<Key> {
    match result {
        Ok(_) => None,
        Err(aborted) => Some(aborted.report.cursor),
    }
}
