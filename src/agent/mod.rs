#![forbid(unsafe_code)]

pub mod execution;
pub mod sanitize;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncBufReadExt as _;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::git::Git;
use crate::pool::{PoolLease, WorktreePool};
use crate::store::model::Task;

#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    pub executable: String,
    pub bypass_flag: String,
    pub spawn_timeout: Duration,
    pub path_policy: sanitize::PathPolicy,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            executable: "claude".to_owned(),
            bypass_flag: "--dangerously-skip-permissions".to_owned(),
            spawn_timeout: Duration::from_secs(30),
            path_policy: sanitize::PathPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchReceipt {
    pub task_id: u64,
    pub run_id: String,
    pub workspace: String,
    pub branch: String,
    pub exit_code: Option<i32>,
}

// Obtains a lease, invokes the external agent on the leased checkout, and
// returns the workspace to the pool when the subprocess ends. The agent is
// an opaque interactive CLI; the contract with it is the prompt string.
#[derive(Debug)]
pub struct AgentSpawner {
    repo_root: PathBuf,
    git: Git,
    pool: Arc<WorktreePool>,
    runs: execution::RunLog,
    cfg: SpawnerConfig,
}

impl AgentSpawner {
    #[must_use]
    pub fn new(repo_root: PathBuf, pool: Arc<WorktreePool>, cfg: SpawnerConfig) -> Self {
        let git = Git::new(repo_root.clone());
        let runs = execution::RunLog::new(&repo_root);
        Self {
            repo_root,
            git,
            pool,
            runs,
            cfg,
        }
    }

    #[must_use]
    pub fn run_log(&self) -> &execution::RunLog {
        &self.runs
    }

    // The prompt is the whole contract with the agent: read the plan and the
    // task list, do the work, commit to the task branch, and flip the task
    // to pending_review in the task list of the *primary* checkout. Work
    // lives on the branch; the status change must be visible to the control
    // plane immediately, without merging anything.
    #[must_use]
    pub fn build_prompt(&self, task_id: u64, title: &str) -> String {
        format!(
            "Review plan/plan.md and plan/task.json. Begin task #{task_id}: {title}. \
             Commit your work to branch task_{task_id} in this checkout. When the task is done, \
             edit plan/task.json in the main checkout at {root} and set this task's status to \
             'pending_review', then exit.",
            root = self.repo_root.display()
        )
    }

    pub async fn launch(&self, task: &Task) -> Result<LaunchReceipt> {
        // All validation happens before a lease is taken.
        let root = sanitize::validate_project_root(&self.cfg.path_policy, &self.repo_root)?;
        let agent_exe = sanitize::resolve_agent_executable(&self.cfg.executable)?;
        let title = sanitize::sanitize_title(&task.title);

        let lease = self.pool.acquire(task.id, &title)?;
        let workspace = lease.workspace.clone();
        let branch = lease.branch.clone();

        let mut record =
            execution::RunRecord::begin(task.id, &title, &lease.workspace_name(), &branch);
        if let Err(e) = self.runs.save(&record) {
            warn!(task_id = task.id, "failed to record agent run: {e}");
        }

        info!(
            task_id = task.id,
            run_id = %record.run_id,
            agent = %agent_exe.display(),
            workspace = %workspace.display(),
            root = %root.display(),
            "launching agent"
        );

        let run = self
            .run_agent(&agent_exe, &workspace, task.id, &title)
            .await;

        // The workspace leaves the task branch on every exit path so the
        // branch can be deleted by review; then the lease goes back.
        if let Err(e) = self.git.run_in_dir(&workspace, &["checkout", "--detach"]) {
            warn!(workspace = %workspace.display(), "failed to detach workspace: {e}");
        }
        self.release_quietly(lease);

        let (code, output) = match run {
            Ok(done) => done,
            Err(e) => {
                record.finish(None, Some(e.to_string()));
                self.save_quietly(&record);
                return Err(e);
            }
        };

        let error = (code != Some(0)).then(|| format!("agent exited with status {code:?}"));
        record.finish(code, error);
        self.save_quietly(&record);
        if let Err(e) = self.runs.write_output(&record.run_id, &output) {
            warn!(run_id = %record.run_id, "failed to store agent output: {e}");
        }

        if code != Some(0) {
            return Err(AppError::AgentFailed {
                task_id: task.id,
                code,
                output,
            });
        }

        info!(task_id = task.id, branch = %branch, "agent exited cleanly");
        Ok(LaunchReceipt {
            task_id: task.id,
            run_id: record.run_id,
            workspace: workspace.to_string_lossy().to_string(),
            branch,
            exit_code: code,
        })
    }

    fn save_quietly(&self, record: &execution::RunRecord) {
        if let Err(e) = self.runs.save(record) {
            warn!(run_id = %record.run_id, "failed to record agent run: {e}");
        }
    }

    async fn run_agent(
        &self,
        agent_exe: &Path,
        workspace: &Path,
        task_id: u64,
        title: &str,
    ) -> Result<(Option<i32>, String)> {
        let prompt = self.build_prompt(task_id, title);

        let mut cmd = tokio::process::Command::new(agent_exe);
        cmd.arg(&prompt);
        if !self.cfg.bypass_flag.trim().is_empty() {
            cmd.arg(self.cfg.bypass_flag.trim());
        }
        cmd.current_dir(workspace);
        // Nothing from the host environment leaks into the agent beyond
        // identity and the task coordinates.
        cmd.env_clear();
        cmd.env("PATH", sanitize::RESTRICTED_PATH);
        cmd.env("HOME", std::env::var_os("HOME").unwrap_or_default());
        cmd.env("USER", std::env::var_os("USER").unwrap_or_default());
        cmd.env("TASK_ID", task_id.to_string());
        cmd.env("TASK_TITLE", title);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| AppError::Internal(format!(
            "failed to start {}: {e}",
            agent_exe.display()
        )))?;

        let output = Arc::new(tokio::sync::Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(collect_lines(stdout, Arc::clone(&output))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(collect_lines(stderr, Arc::clone(&output))));
        }

        // The timeout bounds invocation acceptance only. A child that exits
        // inside the window is judged right away; one that outlives it has
        // accepted the invocation and is awaited without further bound (the
        // lease-age ceiling covers runaways).
        let status = match tokio::time::timeout(self.cfg.spawn_timeout, child.wait()).await {
            Ok(waited) => {
                waited.map_err(|e| AppError::Internal(format!("failed to wait for agent: {e}")))?
            }
            Err(_) => {
                info!(task_id, "agent accepted invocation, awaiting completion");
                child
                    .wait()
                    .await
                    .map_err(|e| AppError::Internal(format!("failed to wait for agent: {e}")))?
            }
        };

        for reader in readers {
            let _ = reader.await;
        }
        let combined = output.lock().await.clone();
        Ok((status.code(), combined))
    }

    fn release_quietly(&self, lease: PoolLease) {
        if let Err(e) = self.pool.release(lease) {
            warn!("lease release failed: {e}");
        }
    }
}

async fn collect_lines(
    stream: impl tokio::io::AsyncRead + Unpin,
    sink: Arc<tokio::sync::Mutex<String>>,
) {
    let mut lines = tokio::io::BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut buf = sink.lock().await;
        buf.push_str(&line);
        buf.push('\n');
    }
}
