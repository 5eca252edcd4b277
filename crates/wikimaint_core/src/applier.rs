use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cursor::Window;
use crate::error::RowApplyError;
use crate::row::{Directive, FieldMap, Key, Row};

/// A maintenance job expressed as a pure per-row decision.
///
/// `decide` must depend only on the row and on the task's own immutable
/// settings. Dry-run and commit mode call it identically.
pub trait MutationTask {
    fn name(&self) -> &str;
    /// Source table; updates and deletes target it too.
    fn table(&self) -> &str;
    fn key_column(&self) -> &str;
    /// Columns the source must load into each [`Row`].
    fn columns(&self) -> Vec<String>;
    /// Stable description of the task's parameters.
    fn describe(&self) -> String;
    fn decide(&self, row: &Row) -> Directive;
}

impl<T: MutationTask + ?Sized> MutationTask for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn table(&self) -> &str {
        (**self).table()
    }

    fn key_column(&self) -> &str {
        (**self).key_column()
    }

    fn columns(&self) -> Vec<String> {
        (**self).columns()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn decide(&self, row: &Row) -> Directive {
        (**self).decide(row)
    }
}

/// Write access to the primary store. All writes of a window happen between
/// `begin_window` and `commit_window`.
pub trait WriteSink {
    fn begin_window(&mut self, window: Window) -> Result<()>;
    fn update(&mut self, table: &str, key_column: &str, key: Key, values: &FieldMap)
    -> Result<usize>;
    fn delete(&mut self, table: &str, key_column: &str, key: Key) -> Result<usize>;
    fn insert(&mut self, table: &str, values: &FieldMap) -> Result<()>;
    fn commit_window(&mut self) -> Result<()>;
    fn rollback_window(&mut self) -> Result<()>;
}

impl<W: WriteSink + ?Sized> WriteSink for Box<W> {
    fn begin_window(&mut self, window: Window) -> Result<()> {
        (**self).begin_window(window)
    }

    fn update(
        &mut self,
        table: &str,
        key_column: &str,
        key: Key,
        values: &FieldMap,
    ) -> Result<usize> {
        (**self).update(table, key_column, key, values)
    }

    fn delete(&mut self, table: &str, key_column: &str, key: Key) -> Result<usize> {
        (**self).delete(table, key_column, key)
    }

    fn insert(&mut self, table: &str, values: &FieldMap) -> Result<()> {
        (**self).insert(table, values)
    }

    fn commit_window(&mut self) -> Result<()> {
        (**self).commit_window()
    }

    fn rollback_window(&mut self) -> Result<()> {
        (**self).rollback_window()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    /// A write reached the sink. Always false in dry-run mode; see
    /// [`RowOutcome::WouldApply`] for how the run counts those rows.
    pub applied: bool,
    pub error: Option<RowApplyError>,
}

/// Terminal state of one row. `Applied` and `WouldApply` both count as
/// mutated in the run totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Applied,
    /// Dry run: the row would have been written.
    WouldApply,
    Skipped,
    Failed(RowApplyError),
}

pub struct MutationApplier<T, W> {
    task: T,
    sink: W,
    dry_run: bool,
    window_open: bool,
}

impl<T: MutationTask, W: WriteSink> MutationApplier<T, W> {
    pub fn new(task: T, sink: W, dry_run: bool) -> Self {
        Self {
            task,
            sink,
            dry_run,
            window_open: false,
        }
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn decide(&self, row: &Row) -> Directive {
        self.task.decide(row)
    }

    /// Opens the window transaction lazily, on the first real write.
    fn ensure_window(&mut self, window: Window) -> Result<()> {
        if !self.window_open {
            self.sink.begin_window(window)?;
            self.window_open = true;
        }
        Ok(())
    }

    pub fn apply(&mut self, window: Window, key: Key, directive: &Directive) -> ApplyResult {
        if directive.is_skip() {
            return ApplyResult {
                applied: false,
                error: None,
            };
        }
        if self.dry_run {
            info!("[dry-run] row {key}: would {directive}");
            return ApplyResult {
                applied: false,
                error: None,
            };
        }

        let outcome = self.ensure_window(window).and_then(|()| self.write(key, directive));
        match outcome {
            Ok(()) => {
                debug!("row {key}: {directive}");
                ApplyResult {
                    applied: true,
                    error: None,
                }
            }
            Err(error) => ApplyResult {
                applied: false,
                error: Some(RowApplyError {
                    key,
                    message: format!("{error:#}"),
                }),
            },
        }
    }

    fn write(&mut self, key: Key, directive: &Directive) -> Result<()> {
        let table = self.task.table();
        let key_column = self.task.key_column();
        match directive {
            Directive::Skip => {}
            Directive::Update(values) => {
                let changed = self.sink.update(table, key_column, key, values)?;
                if changed == 0 {
                    debug!("row {key}: update matched no rows");
                }
            }
            Directive::Delete => {
                let changed = self.sink.delete(table, key_column, key)?;
                if changed == 0 {
                    debug!("row {key}: delete matched no rows");
                }
            }
            Directive::Insert { table, values } => self.sink.insert(table, values)?,
        }
        Ok(())
    }

    /// Decides and applies one row.
    pub fn process(&mut self, window: Window, row: &Row) -> RowOutcome {
        let directive = self.decide(row);
        if directive.is_skip() {
            return RowOutcome::Skipped;
        }
        let result = self.apply(window, row.key, &directive);
        match result.error {
            Some(error) => {
                warn!("{error}");
                RowOutcome::Failed(error)
            }
            None if result.applied => RowOutcome::Applied,
            None => RowOutcome::WouldApply,
        }
    }

    /// Commits the window transaction if one was opened. On failure the
    /// window stays open for [`Self::abandon_window`].
    pub fn finish_window(&mut self) -> Result<()> {
        if !self.window_open {
            return Ok(());
        }
        self.sink.commit_window()?;
        self.window_open = false;
        Ok(())
    }

    pub fn abandon_window(&mut self) -> Result<()> {
        if !self.window_open {
            return Ok(());
        }
        self.window_open = false;
        self.sink.rollback_window()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use anyhow::bail;

    use super::*;
    use crate::row::FieldValue;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum SinkCall {
        Begin(Window),
        Update(Key, FieldMap),
        Delete(Key),
        Insert(String, FieldMap),
        Commit,
        Rollback,
    }

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub calls: Vec<SinkCall>,
        pub failing_keys: Vec<Key>,
    }

    impl RecordingSink {
        pub fn writes(&self) -> usize {
            self.calls
                .iter()
                .filter(|call| {
                    matches!(
                        call,
                        SinkCall::Update(..) | SinkCall::Delete(_) | SinkCall::Insert(..)
                    )
                })
                .count()
        }
    }

    impl WriteSink for RecordingSink {
        fn begin_window(&mut self, window: Window) -> Result<()> {
            self.calls.push(SinkCall::Begin(window));
            Ok(())
        }

        fn update(
            &mut self,
            _table: &str,
            _key_column: &str,
            key: Key,
            values: &FieldMap,
        ) -> Result<usize> {
            if self.failing_keys.contains(&key) {
                bail!("UNIQUE constraint failed");
            }
            self.calls.push(SinkCall::Update(key, values.clone()));
            Ok(1)
        }

        fn delete(&mut self, _table: &str, _key_column: &str, key: Key) -> Result<usize> {
            if self.failing_keys.contains(&key) {
                bail!("FOREIGN KEY constraint failed");
            }
            self.calls.push(SinkCall::Delete(key));
            Ok(1)
        }

        fn insert(&mut self, table: &str, values: &FieldMap) -> Result<()> {
            self.calls.push(SinkCall::Insert(table.to_string(), values.clone()));
            Ok(())
        }

        fn commit_window(&mut self) -> Result<()> {
            self.calls.push(SinkCall::Commit);
            Ok(())
        }

        fn rollback_window(&mut self) -> Result<()> {
            self.calls.push(SinkCall::Rollback);
            Ok(())
        }
    }

    /// Deletes rows whose `flag` column equals "X".
    pub(crate) struct DeleteFlagged;

    impl MutationTask for DeleteFlagged {
        fn name(&self) -> &str {
            "delete-flagged"
        }

        fn table(&self) -> &str {
            "things"
        }

        fn key_column(&self) -> &str {
            "id"
        }

        fn columns(&self) -> Vec<String> {
            vec!["flag".to_string()]
        }

        fn describe(&self) -> String {
            "delete-flagged flag=X".to_string()
        }

        fn decide(&self, row: &Row) -> Directive {
            if row.text("flag") == Some("X") {
                Directive::Delete
            } else {
                Directive::Skip
            }
        }
    }

    const WINDOW: Window = Window { low: 1, high: 11 };

    #[test]
    fn skip_never_touches_the_sink() {
        let mut applier = MutationApplier::new(DeleteFlagged, RecordingSink::default(), false);
        let outcome = applier.process(WINDOW, &Row::new(1).with_field("flag", "Y"));
        assert_eq!(outcome, RowOutcome::Skipped);
        applier.finish_window().expect("finish");
        assert!(applier.sink().calls.is_empty());
    }

    #[test]
    fn commit_mode_wraps_writes_in_one_window_transaction() {
        let mut applier = MutationApplier::new(DeleteFlagged, RecordingSink::default(), false);
        for key in [2, 5] {
            let outcome = applier.process(WINDOW, &Row::new(key).with_field("flag", "X"));
            assert_eq!(outcome, RowOutcome::Applied);
        }
        applier.finish_window().expect("finish");
        assert_eq!(
            applier.sink().calls,
            vec![
                SinkCall::Begin(WINDOW),
                SinkCall::Delete(2),
                SinkCall::Delete(5),
                SinkCall::Commit,
            ]
        );
    }

    #[test]
    fn dry_run_decides_but_never_writes() {
        let mut applier = MutationApplier::new(DeleteFlagged, RecordingSink::default(), true);
        let row = Row::new(3).with_field("flag", "X");
        assert_eq!(applier.decide(&row), Directive::Delete);
        let result = applier.apply(WINDOW, row.key, &Directive::Delete);
        assert_eq!(
            result,
            ApplyResult {
                applied: false,
                error: None
            }
        );
        assert_eq!(applier.process(WINDOW, &row), RowOutcome::WouldApply);
        applier.finish_window().expect("finish");
        assert!(applier.sink().calls.is_empty());
    }

    #[test]
    fn row_failure_is_contained() {
        let sink = RecordingSink {
            failing_keys: vec![4],
            ..RecordingSink::default()
        };
        let mut applier = MutationApplier::new(DeleteFlagged, sink, false);
        let failed = applier.process(WINDOW, &Row::new(4).with_field("flag", "X"));
        let applied = applier.process(WINDOW, &Row::new(6).with_field("flag", "X"));
        applier.finish_window().expect("finish");

        match failed {
            RowOutcome::Failed(error) => {
                assert_eq!(error.key, 4);
                assert!(error.message.contains("FOREIGN KEY"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(applied, RowOutcome::Applied);
        assert_eq!(applier.sink().writes(), 1);
        assert_eq!(applier.sink().calls.last(), Some(&SinkCall::Commit));
    }

    #[test]
    fn abandon_rolls_back_open_window_only() {
        let mut applier = MutationApplier::new(DeleteFlagged, RecordingSink::default(), false);
        applier.abandon_window().expect("nothing open");
        assert!(applier.sink().calls.is_empty());

        applier.process(WINDOW, &Row::new(1).with_field("flag", "X"));
        applier.abandon_window().expect("rollback");
        assert_eq!(applier.sink().calls.last(), Some(&SinkCall::Rollback));
    }

    #[test]
    fn insert_directives_target_their_own_table() {
        struct CopyToArchive;
        impl MutationTask for CopyToArchive {
            fn name(&self) -> &str {
                "copy"
            }
            fn table(&self) -> &str {
                "things"
            }
            fn key_column(&self) -> &str {
                "id"
            }
            fn columns(&self) -> Vec<String> {
                Vec::new()
            }
            fn describe(&self) -> String {
                "copy".to_string()
            }
            fn decide(&self, row: &Row) -> Directive {
                let mut values = FieldMap::new();
                values.insert("thing_id".to_string(), FieldValue::Integer(row.key));
                Directive::Insert {
                    table: "archive".to_string(),
                    values,
                }
            }
        }

        let mut applier = MutationApplier::new(CopyToArchive, RecordingSink::default(), false);
        applier.process(WINDOW, &Row::new(9));
        let mut expected = FieldMap::new();
        expected.insert("thing_id".to_string(), FieldValue::Integer(9));
        assert_eq!(
            applier.sink().calls[1],
            SinkCall::Insert("archive".to_string(), expected)
        );
    }
}
