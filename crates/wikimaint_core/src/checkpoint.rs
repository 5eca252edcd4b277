use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::applier::MutationTask;
use crate::report::{Counts, RunReport, RunStatus};
use crate::row::Key;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task: String,
    pub fingerprint: String,
    pub cursor: Key,
    pub scanned: u64,
    pub mutated: u64,
    pub skipped: u64,
    pub errors: u64,
    pub complete: bool,
    pub updated_at_unix: u64,
}

impl Checkpoint {
    pub fn totals(&self) -> Counts {
        Counts {
            scanned: self.scanned,
            mutated: self.mutated,
            skipped: self.skipped,
            errors: self.errors,
        }
    }
}

/// Hash of everything that determines which rows a task touches. A checkpoint
/// written by a differently-parameterised task must not be resumed.
pub fn task_fingerprint<T: MutationTask + ?Sized>(task: &T) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task.name().as_bytes());
    hasher.update([0]);
    hasher.update(task.table().as_bytes());
    hasher.update([0]);
    hasher.update(task.key_column().as_bytes());
    hasher.update([0]);
    hasher.update(task.describe().as_bytes());
    let digest = hasher.finalize();
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// JSON checkpoint file for one task, rewritten after every confirmed window.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    task: String,
    fingerprint: String,
}

impl CheckpointStore {
    pub fn new<T: MutationTask + ?Sized>(path: &Path, task: &T) -> Self {
        Self {
            path: path.to_path_buf(),
            task: task.name().to_string(),
            fingerprint: task_fingerprint(task),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(Some(checkpoint))
    }

    /// Cursor to resume from, after checking the file belongs to this task.
    pub fn resume_cursor(&self) -> Result<Option<Key>> {
        let Some(checkpoint) = self.load()? else {
            return Ok(None);
        };
        if checkpoint.fingerprint != self.fingerprint {
            bail!(
                "checkpoint {} was written by a different task ({} {}); refusing to resume",
                self.path.display(),
                checkpoint.task,
                checkpoint.fingerprint
            );
        }
        Ok(Some(checkpoint.cursor))
    }

    pub fn save(&self, report: &RunReport) -> Result<()> {
        let checkpoint = Checkpoint {
            task: self.task.clone(),
            fingerprint: self.fingerprint.clone(),
            cursor: report.cursor,
            scanned: report.totals.scanned,
            mutated: report.totals.mutated,
            skipped: report.totals.skipped,
            errors: report.totals.errors,
            complete: report.status == RunStatus::Completed,
            updated_at_unix: unix_timestamp()?,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let rendered =
            serde_json::to_string_pretty(&checkpoint).context("failed to serialize checkpoint")?;
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, rendered)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::tasks::RewriteField;

    fn task(to: &str) -> RewriteField {
        RewriteField {
            table: "page".to_string(),
            key_column: "page_id".to_string(),
            column: "page_content_model".to_string(),
            from: "text".to_string(),
            to: to.to_string(),
        }
    }

    fn report(cursor: Key, status: RunStatus) -> RunReport {
        RunReport {
            task: "rewrite-field".to_string(),
            dry_run: false,
            windows: 2,
            totals: Counts {
                scanned: 200,
                mutated: 4,
                skipped: 196,
                errors: 0,
            },
            cursor,
            status,
        }
    }

    #[test]
    fn missing_file_means_no_resume_point() {
        let temp = tempdir().expect("tempdir");
        let store = CheckpointStore::new(&temp.path().join("run.json"), &task("wikitext"));
        assert_eq!(store.load().expect("load"), None);
        assert_eq!(store.resume_cursor().expect("resume"), None);
    }

    #[test]
    fn save_then_resume_returns_cursor() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("state").join("run.json");
        let store = CheckpointStore::new(&path, &task("wikitext"));
        store
            .save(&report(201, RunStatus::Running))
            .expect("save");

        assert_eq!(store.resume_cursor().expect("resume"), Some(201));
        let checkpoint = store.load().expect("load").expect("present");
        assert!(!checkpoint.complete);
        assert_eq!(checkpoint.totals().mutated, 4);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn completed_runs_are_marked() {
        let temp = tempdir().expect("tempdir");
        let store = CheckpointStore::new(&temp.path().join("run.json"), &task("wikitext"));
        store
            .save(&report(301, RunStatus::Completed))
            .expect("save");
        assert!(store.load().expect("load").expect("present").complete);
    }

    #[test]
    fn checkpoint_from_another_task_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("run.json");
        CheckpointStore::new(&path, &task("wikitext"))
            .save(&report(101, RunStatus::Running))
            .expect("save");

        let other = CheckpointStore::new(&path, &task("json"));
        let error = other.resume_cursor().expect_err("fingerprint mismatch");
        assert!(error.to_string().contains("different task"));
    }

    #[test]
    fn fingerprint_is_stable_and_parameter_sensitive() {
        assert_eq!(task_fingerprint(&task("a")), task_fingerprint(&task("a")));
        assert_ne!(task_fingerprint(&task("a")), task_fingerprint(&task("b")));
        assert_eq!(task_fingerprint(&task("a")).len(), 16);
    }
}
