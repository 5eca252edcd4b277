use std::io::Write;

use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::cursor::Window;
use crate::error::RunError;
use crate::row::Key;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub scanned: u64,
    pub mutated: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl Counts {
    pub fn add(&mut self, other: &Counts) {
        self.scanned += other.scanned;
        self.mutated += other.mutated;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

/// Cumulative state of a run. `cursor` is the last confirmed position, the
/// value to pass to `--start` when resuming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub task: String,
    pub dry_run: bool,
    pub windows: u64,
    pub totals: Counts,
    pub cursor: Key,
    pub status: RunStatus,
}

impl RunReport {
    pub fn new(task: &str, dry_run: bool, cursor: Key) -> Self {
        Self {
            task: task.to_string(),
            dry_run,
            windows: 0,
            totals: Counts::default(),
            cursor,
            status: RunStatus::Running,
        }
    }
}

/// Observational output. Implementations must never fail the run.
pub trait Reporter {
    fn report_batch(&mut self, window: Window, counts: &Counts, cursor: Key);
    fn report_final(&mut self, report: &RunReport, error: Option<&RunError>);
}

impl<R: Reporter + ?Sized> Reporter for &mut R {
    fn report_batch(&mut self, window: Window, counts: &Counts, cursor: Key) {
        (**self).report_batch(window, counts, cursor);
    }

    fn report_final(&mut self, report: &RunReport, error: Option<&RunError>) {
        (**self).report_final(report, error);
    }
}

/// One line per window and one summary line.
pub struct TextReporter<W> {
    out: W,
    dry_run: bool,
}

impl<W: Write> TextReporter<W> {
    pub fn new(out: W, dry_run: bool) -> Self {
        Self { out, dry_run }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, line: &str) {
        let prefix = if self.dry_run { "[dry-run] " } else { "" };
        if let Err(error) = writeln!(self.out, "{prefix}{line}").and_then(|()| self.out.flush()) {
            warn!("failed to write report line: {error}");
        }
    }
}

impl<W: Write> Reporter for TextReporter<W> {
    fn report_batch(&mut self, window: Window, counts: &Counts, cursor: Key) {
        self.emit(&format!(
            "window {window}: scanned {}, mutated {}, skipped {}, errors {}; cursor {cursor}",
            counts.scanned, counts.mutated, counts.skipped, counts.errors
        ));
    }

    fn report_final(&mut self, report: &RunReport, error: Option<&RunError>) {
        let totals = &report.totals;
        let mut line = format!(
            "rows scanned: {}, mutated: {}, skipped: {}, errors: {}; windows: {}; cursor: {}; status: {}",
            totals.scanned,
            totals.mutated,
            totals.skipped,
            totals.errors,
            report.windows,
            report.cursor,
            report.status.as_str()
        );
        if let Some(error) = error {
            line.push_str(&format!(" ({}: {error})", error.kind()));
            if let Some(cursor) = error.cursor() {
                line.push_str(&format!("; resume with --start={cursor}"));
            }
        }
        self.emit(&line);
    }
}

/// One JSON object per line.
pub struct JsonReporter<W> {
    out: W,
}

impl<W: Write> JsonReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, value: &serde_json::Value) {
        let result = serde_json::to_writer(&mut self.out, value)
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(self.out))
            .and_then(|()| self.out.flush());
        if let Err(error) = result {
            warn!("failed to write report line: {error}");
        }
    }
}

impl<W: Write> Reporter for JsonReporter<W> {
    fn report_batch(&mut self, window: Window, counts: &Counts, cursor: Key) {
        self.emit(&json!({
            "event": "batch",
            "window": window,
            "counts": counts,
            "cursor": cursor,
        }));
    }

    fn report_final(&mut self, report: &RunReport, error: Option<&RunError>) {
        self.emit(&json!({
            "event": "final",
            "report": report,
            "error": error.map(|error| json!({
                "kind": error.kind(),
                "message": error.to_string(),
                "resume_cursor": error.cursor(),
            })),
        }));
    }
}
