#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use time::OffsetDateTime;
use time::macros::format_description;

use crate::error::{AppError, Result};

pub const LEASE_FILE: &str = ".agent_state";

const HUMAN_STAMP: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

// The busy marker co-located with a workspace. Presence means leased;
// absence means the workspace is idle and reusable. Stored as key=value
// lines so shell tooling can read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub pid: u32,
    pub task_id: u64,
    pub task_title: String,
    pub started: i64,
    pub started_human: String,
    pub worktree: String,
}

impl Lease {
    #[must_use]
    pub fn new(task_id: u64, task_title: &str, worktree: &str) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            pid: std::process::id(),
            task_id,
            task_title: task_title.to_owned(),
            started: now.unix_timestamp(),
            started_human: now
                .format(&HUMAN_STAMP)
                .unwrap_or_else(|_| "unknown".to_owned()),
            worktree: worktree.to_owned(),
        }
    }

    #[must_use]
    pub fn path(workspace: &Path) -> PathBuf {
        workspace.join(LEASE_FILE)
    }

    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "status=busy\npid={}\ntask_id={}\ntask_title={}\nstarted={}\nstarted_human={}\nworktree={}\n",
            self.pid, self.task_id, self.task_title, self.started, self.started_human, self.worktree
        )
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut pid = None;
        let mut task_id = None;
        let mut task_title = String::new();
        let mut started = None;
        let mut started_human = String::new();
        let mut worktree = String::new();

        for line in input.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "pid" => pid = value.trim().parse::<u32>().ok(),
                "task_id" => task_id = value.trim().parse::<u64>().ok(),
                "task_title" => task_title = value.to_owned(),
                "started" => started = value.trim().parse::<i64>().ok(),
                "started_human" => started_human = value.to_owned(),
                "worktree" => worktree = value.to_owned(),
                _ => {}
            }
        }

        match (pid, task_id, started) {
            (Some(pid), Some(task_id), Some(started)) => Ok(Self {
                pid,
                task_id,
                task_title,
                started,
                started_human,
                worktree,
            }),
            _ => Err(AppError::Validation(
                "lease record is missing pid, task_id or started".to_owned(),
            )),
        }
    }

    pub fn load(workspace: &Path) -> Result<Option<Self>> {
        let path = Self::path(workspace);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Self::parse(&raw).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::io(&path, e)),
        }
    }

    pub fn write(&self, workspace: &Path) -> Result<()> {
        let path = Self::path(workspace);
        std::fs::write(&path, self.render()).map_err(|e| AppError::io(&path, e))
    }

    pub fn remove(workspace: &Path) -> Result<()> {
        let path = Self::path(workspace);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::io(&path, e)),
        }
    }

    #[must_use]
    pub fn age(&self, now_epoch: i64) -> Duration {
        Duration::from_secs(now_epoch.saturating_sub(self.started).max(0) as u64)
    }

    // A lease is stale when its owner is gone or it has outlived the
    // configured ceiling; either way the workspace is reclaimable.
    #[must_use]
    pub fn is_stale(&self, max_age: Duration, now_epoch: i64) -> bool {
        !pid_alive(self.pid) || self.age(now_epoch) > max_age
    }
}

// Liveness probe via `kill -0`, matching how the rest of the system talks
// to the host (subprocesses, not syscall bindings).
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
