#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::store::fsio;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

// One agent invocation, as recorded on disk. The captured combined output
// lives in a sibling .log file keyed by run id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: String,
    pub task_id: u64,
    pub task_title: String,
    pub workspace: String,
    pub branch: String,
    pub status: RunStatus,
    pub started: String,
    pub finished: Option<String>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl RunRecord {
    #[must_use]
    pub fn begin(task_id: u64, task_title: &str, workspace: &str, branch: &str) -> Self {
        Self {
            run_id: new_run_id(),
            task_id,
            task_title: task_title.to_owned(),
            workspace: workspace.to_owned(),
            branch: branch.to_owned(),
            status: RunStatus::Running,
            started: now_rfc3339(),
            finished: None,
            exit_code: None,
            error: None,
        }
    }

    pub fn finish(&mut self, exit_code: Option<i32>, error: Option<String>) {
        self.status = if error.is_none() && exit_code == Some(0) {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.finished = Some(now_rfc3339());
        self.exit_code = exit_code;
        self.error = error;
    }
}

// Run records and captured output under `<repo>/logs/agents/`. Survives the
// process; pruned by age alongside the task-file backups.
#[derive(Debug, Clone)]
pub struct RunLog {
    base: PathBuf,
}

impl RunLog {
    #[must_use]
    pub fn new(repo_root: &Path) -> Self {
        Self {
            base: repo_root.join("logs").join("agents"),
        }
    }

    #[must_use]
    pub fn record_path(&self, run_id: &str) -> PathBuf {
        self.base.join(format!("{run_id}.json"))
    }

    #[must_use]
    pub fn output_path(&self, run_id: &str) -> PathBuf {
        self.base.join(format!("{run_id}.log"))
    }

    pub fn save(&self, record: &RunRecord) -> Result<()> {
        validate_run_id(&record.run_id)?;
        let data = serde_json::to_vec_pretty(record)?;
        fsio::atomic_write(&self.record_path(&record.run_id), &data)
    }

    pub fn write_output(&self, run_id: &str, output: &str) -> Result<()> {
        validate_run_id(run_id)?;
        let path = self.output_path(run_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::io(parent, e))?;
        }
        std::fs::write(&path, output.as_bytes()).map_err(|e| AppError::io(&path, e))
    }

    pub fn read_output(&self, run_id: &str) -> Result<String> {
        validate_run_id(run_id)?;
        let path = self.output_path(run_id);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(AppError::io(&path, e)),
        }
    }

    // Newest first. Unparsable records are skipped rather than failing the
    // whole listing.
    pub fn list(&self) -> Result<Vec<RunRecord>> {
        if !self.base.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.base).map_err(|e| AppError::io(&self.base, e))? {
            let entry = entry.map_err(|e| AppError::io(&self.base, e))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            let Ok(record) = serde_json::from_slice::<RunRecord>(&data) else {
                continue;
            };
            records.push(record);
        }
        records.sort_by(|a, b| b.started.cmp(&a.started));
        Ok(records)
    }

    // Finished runs older than `max_age` lose both their record and their
    // captured output. Running records are never touched.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize> {
        let cutoff = OffsetDateTime::now_utc() - max_age;
        let mut removed = 0;
        for record in self.list()? {
            if record.status == RunStatus::Running {
                continue;
            }
            let started = OffsetDateTime::parse(&record.started, &Rfc3339)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH);
            if started < cutoff {
                let _ = std::fs::remove_file(self.record_path(&record.run_id));
                let _ = std::fs::remove_file(self.output_path(&record.run_id));
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[must_use]
pub fn new_run_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    let short: String = id.chars().take(8).collect();
    format!("run-{short}")
}

fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.is_empty()
        || run_id.contains('/')
        || run_id.contains('\\')
        || run_id.contains("..")
    {
        return Err(AppError::Validation(format!("invalid run id: {run_id}")));
    }
    Ok(())
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_lifecycle_round_trips() {
        let td = tempfile::tempdir().expect("tempdir");
        let log = RunLog::new(td.path());

        let mut record = RunRecord::begin(3, "T", "repo-worker1", "task_3");
        log.save(&record).unwrap();

        record.finish(Some(0), None);
        log.save(&record).unwrap();
        log.write_output(&record.run_id, "agent said hi\n").unwrap();

        let listed = log.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, RunStatus::Completed);
        assert_eq!(listed[0].exit_code, Some(0));
        assert_eq!(log.read_output(&record.run_id).unwrap(), "agent said hi\n");
    }

    #[test]
    fn failures_and_nonzero_exits_mark_failed() {
        let mut by_code = RunRecord::begin(1, "T", "w", "task_1");
        by_code.finish(Some(3), None);
        assert_eq!(by_code.status, RunStatus::Failed);

        let mut by_error = RunRecord::begin(1, "T", "w", "task_1");
        by_error.finish(Some(0), Some("spawn failed".to_owned()));
        assert_eq!(by_error.status, RunStatus::Failed);
    }

    #[test]
    fn listing_is_newest_first_and_skips_garbage() {
        let td = tempfile::tempdir().expect("tempdir");
        let log = RunLog::new(td.path());

        let mut older = RunRecord::begin(1, "old", "w", "task_1");
        older.started = "2020-01-01T00:00:00Z".to_owned();
        log.save(&older).unwrap();
        let newer = RunRecord::begin(2, "new", "w", "task_2");
        log.save(&newer).unwrap();

        std::fs::write(log.record_path("run-bogus"), b"not json").unwrap();

        let listed = log.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].task_id, 2);
        assert_eq!(listed[1].task_id, 1);
    }

    #[test]
    fn cleanup_prunes_old_finished_runs_only() {
        let td = tempfile::tempdir().expect("tempdir");
        let log = RunLog::new(td.path());

        let mut old_done = RunRecord::begin(1, "old", "w", "task_1");
        old_done.started = "2020-01-01T00:00:00Z".to_owned();
        old_done.finish(Some(0), None);
        log.save(&old_done).unwrap();
        log.write_output(&old_done.run_id, "out").unwrap();

        let mut old_running = RunRecord::begin(2, "stuck", "w", "task_2");
        old_running.started = "2020-01-01T00:00:00Z".to_owned();
        log.save(&old_running).unwrap();

        let fresh = RunRecord::begin(3, "fresh", "w", "task_3");
        log.save(&fresh).unwrap();

        let removed = log.cleanup(Duration::from_secs(86_400)).unwrap();
        assert_eq!(removed, 1);
        assert!(!log.record_path(&old_done.run_id).exists());
        assert!(!log.output_path(&old_done.run_id).exists());
        assert!(log.record_path(&old_running.run_id).exists());
        assert!(log.record_path(&fresh.run_id).exists());
    }

    #[test]
    fn run_ids_that_escape_the_log_dir_are_rejected() {
        let td = tempfile::tempdir().expect("tempdir");
        let log = RunLog::new(td.path());
        assert!(log.read_output("../../etc/passwd").is_err());
        assert!(log.write_output("a/b", "x").is_err());
    }
}
