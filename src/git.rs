#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
pub struct Git {
    repo_root: PathBuf,
}

impl Git {
    #[must_use]
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }

    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn run(&self, args: &[&str]) -> Result<String> {
        self.run_in_dir(self.repo_root.as_path(), args)
    }

    pub fn run_in_dir(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let out = self.run_raw_in_dir(dir, args)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            Err(AppError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
            })
        }
    }

    pub fn run_raw_in_dir(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AppError::GitNotFound,
                _ => AppError::Internal(format!("failed to run git: {e}")),
            })
    }

    pub fn current_branch(&self) -> Result<String> {
        Ok(self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?.trim().to_owned())
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        Ok(self.run(&["rev-parse", rev])?.trim().to_owned())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let out = self.run(&["branch", "--list", branch])?;
        Ok(!out.trim().is_empty())
    }

    // Non-fast-forward merge into the current branch of the primary checkout.
    // Conflict output is distinguished from other failures so the caller can
    // surface it for human intervention.
    pub fn merge_no_ff(&self, branch: &str, message: &str) -> Result<String> {
        let args = ["merge", branch, "--no-ff", "-m", message];
        let out = self.run_raw_in_dir(&self.repo_root, &args)?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        );
        if out.status.success() {
            return Ok(combined);
        }
        if combined.contains("CONFLICT") || combined.contains("Automatic merge failed") {
            return Err(AppError::MergeConflict {
                branch: branch.to_owned(),
                output: combined.trim().to_owned(),
            });
        }
        Err(AppError::Git {
            command: args.join(" "),
            stderr: combined.trim().to_owned(),
        })
    }

    pub fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        let _ = self.run(&["branch", flag, branch])?;
        Ok(())
    }

    pub fn list_worktrees_porcelain(&self) -> Result<String> {
        self.run(&["worktree", "list", "--porcelain"])
    }

    pub fn add_worktree_detached(&self, path: &Path, rev: &str) -> Result<()> {
        let path = path.to_string_lossy();
        let _ = self.run(&["worktree", "add", "--detach", &path, rev])?;
        Ok(())
    }

    pub fn prune_worktrees(&self) -> Result<()> {
        let _ = self.run(&["worktree", "prune"])?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: String,
    pub branch: String,
    pub head: String,
}

#[must_use]
pub fn parse_worktree_porcelain(out: &str) -> Vec<WorktreeEntry> {
    let mut entries: Vec<WorktreeEntry> = Vec::new();

    let mut cur_path: Option<String> = None;
    let mut cur_branch = String::new();
    let mut cur_head = String::new();

    for line in out.lines() {
        let line = line.trim_end();
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(p) = cur_path.take() {
                entries.push(WorktreeEntry {
                    path: p,
                    branch: std::mem::take(&mut cur_branch),
                    head: std::mem::take(&mut cur_head),
                });
            }
            cur_path = Some(path.to_owned());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            cur_branch = branch.trim().trim_start_matches("refs/heads/").to_owned();
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            cur_head = head.trim().to_owned();
        }
    }
    if let Some(p) = cur_path.take() {
        entries.push(WorktreeEntry {
            path: p,
            branch: cur_branch,
            head: cur_head,
        });
    }

    entries
}
