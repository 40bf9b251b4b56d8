#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::git::Git;
use crate::store::TaskStore;
use crate::store::model::TaskStatus;

pub const REJECT_MARKER: &str = "NOT MERGED: ";

#[must_use]
pub fn task_branch(id: u64) -> String {
    format!("task_{id}")
}

// Closes the loop between autonomous agent output and the mainline: a human
// approves (merge, delete branch, done) or rejects (discard branch, mark
// title, done).
#[derive(Debug)]
pub struct ReviewService {
    store: Arc<TaskStore>,
    git: Git,
}

impl ReviewService {
    #[must_use]
    pub fn new(store: Arc<TaskStore>, git: Git) -> Self {
        Self { store, git }
    }

    pub fn approve(&self, id: u64) -> Result<()> {
        let task = self.store.get(id)?;
        if task.status != TaskStatus::PendingReview {
            return Err(AppError::Validation(format!(
                "task {id} is not in pending_review"
            )));
        }

        let branch = task_branch(id);
        if !self.git.branch_exists(&branch)? {
            return Err(AppError::BranchNotFound(branch));
        }

        let message = format!("Merge task #{id}: {}", task.title);
        let _ = self.git.merge_no_ff(&branch, &message)?;
        info!(task_id = id, branch = %branch, "task branch merged");

        // The branch only goes away after the merge landed.
        if let Err(e) = self.git.delete_branch(&branch, false) {
            warn!(task_id = id, branch = %branch, "failed to delete merged branch: {e}");
        }

        // Persistence is last. If it fails the merge is already on disk, so
        // the caller gets the partial-success variant rather than a plain
        // failure.
        self.store
            .move_status(id, TaskStatus::Done)
            .map_err(|e| AppError::MergedNotRecorded {
                id,
                source: Box::new(e),
            })?;

        info!(task_id = id, "task approved");
        Ok(())
    }

    pub fn reject(&self, id: u64) -> Result<()> {
        let mut task = self.store.get(id)?;
        if task.status != TaskStatus::PendingReview {
            // A repeated reject is a no-op, not an error.
            if task.status == TaskStatus::Done && task.title.starts_with(REJECT_MARKER) {
                return Ok(());
            }
            return Err(AppError::Validation(format!(
                "task {id} is not in pending_review"
            )));
        }

        // The desired end state is "this work is discarded"; a branch that
        // refuses to die is logged, not fatal.
        let branch = task_branch(id);
        if let Err(e) = self.git.delete_branch(&branch, true) {
            warn!(task_id = id, branch = %branch, "failed to delete rejected branch: {e}");
        }

        if !task.title.starts_with(REJECT_MARKER) {
            task.title = format!("{REJECT_MARKER}{}", task.title);
        }
        task.status = TaskStatus::Done;
        self.store.update(task)?;

        info!(task_id = id, "task rejected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names_follow_the_convention() {
        assert_eq!(task_branch(12), "task_12");
    }
}
