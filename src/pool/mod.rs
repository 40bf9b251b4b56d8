#![forbid(unsafe_code)]

pub mod lease;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::git::{Git, parse_worktree_porcelain};
use crate::pool::lease::Lease;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub max_lease_age: Duration,
    // Empty means "resolve the primary checkout's HEAD per acquire".
    pub mainline: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            max_lease_age: Duration::from_secs(2 * 60 * 60),
            mainline: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WorkspaceStatus {
    pub name: String,
    pub status: &'static str,
    pub task_id: Option<u64>,
    pub task_title: Option<String>,
    pub pid: Option<u32>,
    pub started: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub stale: usize,
    pub max_workers: usize,
    pub worktrees: Vec<WorkspaceStatus>,
}

// An exclusive claim on one pooled workspace. The lease record on disk is
// removed on release; Drop is the backstop so a panicking holder cannot
// leak a busy marker.
#[derive(Debug)]
pub struct PoolLease {
    pub index: usize,
    pub workspace: PathBuf,
    pub branch: String,
    pub record: Lease,
    armed: bool,
}

impl PoolLease {
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        Lease::remove(&self.workspace)
    }

    #[must_use]
    pub fn workspace_name(&self) -> String {
        self.workspace
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if self.armed {
            let _ = Lease::remove(&self.workspace);
        }
    }
}

// Bounded set of reusable worktrees next to the primary checkout, named
// `<repo>-worker<N>`. All lease discovery is done by scanning workspaces;
// there is no central lease table.
#[derive(Debug)]
pub struct WorktreePool {
    git: Git,
    parent: PathBuf,
    repo_name: String,
    cfg: PoolConfig,
    alloc: Mutex<()>,
}

impl WorktreePool {
    pub fn new(git: Git, cfg: PoolConfig) -> Result<Self> {
        let root = git.repo_root().to_path_buf();
        let parent = root
            .parent()
            .ok_or_else(|| {
                AppError::Config(format!(
                    "repository {} has no parent directory for worker checkouts",
                    root.display()
                ))
            })?
            .to_path_buf();
        let repo_name = root
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                AppError::Config(format!("cannot derive repository name from {}", root.display()))
            })?
            .to_owned();

        Ok(Self {
            git,
            parent,
            repo_name,
            cfg,
            alloc: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn workspace_path(&self, index: usize) -> PathBuf {
        self.parent.join(format!("{}-worker{index}", self.repo_name))
    }

    // Scan, reclaim stale leases, pick the lowest idle index, create a new
    // workspace below capacity, or report saturation. Reclamation happens
    // under the same lock as selection so two callers cannot both claim a
    // freshly purged workspace. Workspace preparation (the git scrubbing)
    // runs after the lease is written, outside the lock.
    pub fn acquire(&self, task_id: u64, task_title: &str) -> Result<PoolLease> {
        let (index, workspace, record) = {
            let _guard = self
                .alloc
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            if let Err(e) = self.git.prune_worktrees() {
                warn!("worktree prune failed: {e}");
            }

            let now = OffsetDateTime::now_utc().unix_timestamp();
            let spaces = self.discover()?;
            let registered = self.registered_worktrees();
            let mut chosen: Option<(usize, PathBuf)> = None;
            for (index, path) in &spaces {
                // A directory that matches the naming convention but is not
                // in the worktree registry cannot be checked out into; skip
                // it rather than corrupt it.
                if !registered.is_empty() {
                    let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
                    if !registered.contains(&canonical) {
                        warn!(workspace = %path.display(), "skipping unregistered worker directory");
                        continue;
                    }
                }
                match Lease::load(path) {
                    Ok(None) => {
                        chosen = Some((*index, path.clone()));
                        break;
                    }
                    Ok(Some(existing)) => {
                        if existing.is_stale(self.cfg.max_lease_age, now) {
                            info!(
                                workspace = %path.display(),
                                pid = existing.pid,
                                task_id = existing.task_id,
                                "reclaiming stale lease"
                            );
                            Lease::remove(path)?;
                            chosen = Some((*index, path.clone()));
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(workspace = %path.display(), "purging unreadable lease: {e}");
                        Lease::remove(path)?;
                        chosen = Some((*index, path.clone()));
                        break;
                    }
                }
            }

            let (index, workspace) = match chosen {
                Some(found) => found,
                None if spaces.len() < self.cfg.max_workers => {
                    let used: BTreeSet<usize> = spaces.iter().map(|(i, _)| *i).collect();
                    let index = (1..=self.cfg.max_workers)
                        .find(|i| !used.contains(i))
                        .ok_or(AppError::PoolFull)?;
                    let path = self.workspace_path(index);
                    let mainline = self.mainline_commit()?;
                    self.git.add_worktree_detached(&path, &mainline)?;
                    info!(workspace = %path.display(), "created worker checkout");
                    (index, path)
                }
                None => return Err(AppError::PoolFull),
            };

            let name = format!("{}-worker{index}", self.repo_name);
            let record = Lease::new(task_id, task_title, &name);
            record.write(&workspace)?;
            (index, workspace, record)
        };

        let branch = match self.prepare(&workspace, task_id) {
            Ok(branch) => branch,
            Err(e) => {
                let _ = Lease::remove(&workspace);
                return Err(e);
            }
        };

        info!(task_id, workspace = %workspace.display(), branch = %branch, "workspace leased");
        Ok(PoolLease {
            index,
            workspace,
            branch,
            record,
            armed: true,
        })
    }

    pub fn release(&self, lease: PoolLease) -> Result<()> {
        let name = lease.workspace_name();
        lease.release()?;
        info!(workspace = %name, "lease released");
        Ok(())
    }

    pub fn status(&self) -> Result<PoolStatus> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let spaces = self.discover()?;

        let mut worktrees = Vec::with_capacity(spaces.len());
        let (mut idle, mut busy, mut stale) = (0usize, 0usize, 0usize);
        for (index, path) in &spaces {
            let name = format!("{}-worker{index}", self.repo_name);
            let entry = match Lease::load(path) {
                Ok(Some(l)) if l.is_stale(self.cfg.max_lease_age, now) => {
                    stale += 1;
                    WorkspaceStatus {
                        name,
                        status: "stale",
                        task_id: Some(l.task_id),
                        task_title: Some(l.task_title),
                        pid: Some(l.pid),
                        started: Some(l.started_human),
                    }
                }
                Ok(Some(l)) => {
                    busy += 1;
                    WorkspaceStatus {
                        name,
                        status: "busy",
                        task_id: Some(l.task_id),
                        task_title: Some(l.task_title),
                        pid: Some(l.pid),
                        started: Some(l.started_human),
                    }
                }
                Ok(None) => {
                    idle += 1;
                    WorkspaceStatus {
                        name,
                        status: "idle",
                        task_id: None,
                        task_title: None,
                        pid: None,
                        started: None,
                    }
                }
                Err(_) => {
                    stale += 1;
                    WorkspaceStatus {
                        name,
                        status: "stale",
                        task_id: None,
                        task_title: None,
                        pid: None,
                        started: None,
                    }
                }
            };
            worktrees.push(entry);
        }

        Ok(PoolStatus {
            total: spaces.len(),
            idle,
            busy,
            stale,
            max_workers: self.cfg.max_workers,
            worktrees,
        })
    }

    // Workspaces are discovered purely by the naming convention; indices
    // beyond max_workers are ignored so shrinking the configured maximum
    // never reuses out-of-range checkouts.
    fn discover(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.parent.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}-worker", self.repo_name);

        let mut spaces = Vec::new();
        for entry in std::fs::read_dir(&self.parent).map_err(|e| AppError::io(&self.parent, e))? {
            let entry = entry.map_err(|e| AppError::io(&self.parent, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(index) = suffix.parse::<usize>() else {
                continue;
            };
            if index >= 1 && index <= self.cfg.max_workers {
                spaces.push((index, entry.path()));
            }
        }
        spaces.sort_by_key(|(i, _)| *i);
        Ok(spaces)
    }

    // Clean slate at the mainline revision, then the task branch. Detaching
    // first also frees whatever branch the previous occupant left checked
    // out, so review can delete it.
    fn prepare(&self, workspace: &Path, task_id: u64) -> Result<String> {
        let mainline = self.mainline_commit()?;
        let _ = self
            .git
            .run_in_dir(workspace, &["checkout", "--force", "--detach", &mainline])?;
        let _ = self.git.run_in_dir(workspace, &["clean", "-fd"])?;

        let branch = format!("task_{task_id}");
        let _ = self.git.run_in_dir(workspace, &["checkout", "-B", &branch])?;
        Ok(branch)
    }

    // Paths git currently tracks as worktrees of this repository, for
    // cross-referencing against the directory scan. Empty when the registry
    // cannot be read.
    fn registered_worktrees(&self) -> BTreeSet<PathBuf> {
        let Ok(out) = self.git.list_worktrees_porcelain() else {
            return BTreeSet::new();
        };
        parse_worktree_porcelain(&out)
            .into_iter()
            .filter_map(|entry| PathBuf::from(entry.path).canonicalize().ok())
            .collect()
    }

    fn mainline_commit(&self) -> Result<String> {
        if self.cfg.mainline.trim().is_empty() {
            self.git.rev_parse("HEAD")
        } else {
            self.git.rev_parse(self.cfg.mainline.trim())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_at(parent: &Path, max_workers: usize) -> WorktreePool {
        let root = parent.join("repo");
        std::fs::create_dir_all(&root).unwrap();
        WorktreePool::new(
            Git::new(root),
            PoolConfig {
                max_workers,
                ..PoolConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn workspace_names_follow_the_convention() {
        let td = tempfile::tempdir().expect("tempdir");
        let pool = pool_at(td.path(), 2);
        assert_eq!(
            pool.workspace_path(1),
            td.path().join("repo-worker1")
        );
        assert_eq!(
            pool.workspace_path(2),
            td.path().join("repo-worker2")
        );
    }

    #[test]
    fn discover_matches_convention_and_ignores_strays() {
        let td = tempfile::tempdir().expect("tempdir");
        let pool = pool_at(td.path(), 3);
        for name in [
            "repo-worker2",
            "repo-worker1",
            "repo-worker9", // beyond capacity
            "repo-workerx", // not an index
            "other-worker1",
        ] {
            std::fs::create_dir_all(td.path().join(name)).unwrap();
        }
        std::fs::write(td.path().join("repo-worker3"), b"a file, not a dir").unwrap();

        let found = pool.discover().unwrap();
        let indices: Vec<usize> = found.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn status_classifies_idle_busy_and_stale() {
        let td = tempfile::tempdir().expect("tempdir");
        let pool = pool_at(td.path(), 3);

        let idle_ws = td.path().join("repo-worker1");
        std::fs::create_dir_all(&idle_ws).unwrap();

        let busy_ws = td.path().join("repo-worker2");
        std::fs::create_dir_all(&busy_ws).unwrap();
        Lease::new(4, "live", "repo-worker2").write(&busy_ws).unwrap();

        let stale_ws = td.path().join("repo-worker3");
        std::fs::create_dir_all(&stale_ws).unwrap();
        let mut dead = Lease::new(5, "gone", "repo-worker3");
        dead.pid = u32::MAX - 1;
        dead.write(&stale_ws).unwrap();

        let status = pool.status().unwrap();
        assert_eq!(status.total, 3);
        assert_eq!(status.idle, 1);
        assert_eq!(status.busy, 1);
        assert_eq!(status.stale, 1);
        assert_eq!(status.worktrees[0].status, "idle");
        assert_eq!(status.worktrees[1].status, "busy");
        assert_eq!(status.worktrees[1].task_id, Some(4));
        assert_eq!(status.worktrees[2].status, "stale");
    }

    #[test]
    fn dropped_lease_removes_the_record() {
        let td = tempfile::tempdir().expect("tempdir");
        let ws = td.path().join("repo-worker1");
        std::fs::create_dir_all(&ws).unwrap();
        let record = Lease::new(1, "T", "repo-worker1");
        record.write(&ws).unwrap();

        {
            let _lease = PoolLease {
                index: 1,
                workspace: ws.clone(),
                branch: "task_1".to_owned(),
                record,
                armed: true,
            };
            assert!(Lease::path(&ws).exists());
        }
        assert!(!Lease::path(&ws).exists());
    }
}
