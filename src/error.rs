#![forbid(unsafe_code)]

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    External,
    Internal,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid priority: {0}")]
    InvalidPriority(String),

    #[error("task {0} not found")]
    TaskNotFound(u64),

    #[error("branch {0} not found")]
    BranchNotFound(String),

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("terminal session {0} not found")]
    SessionNotFound(String),

    #[error("worktree pool is full")]
    PoolFull,

    #[error("merge conflict on {branch}: {output}")]
    MergeConflict { branch: String, output: String },

    #[error("agent for task #{task_id} exited with status {code:?}: {output}")]
    AgentFailed {
        task_id: u64,
        code: Option<i32>,
        output: String,
    },

    #[error("git {command}: {stderr}")]
    Git { command: String, stderr: String },

    #[error("git is required but was not found in PATH")]
    GitNotFound,

    #[error("terminal error: {0}")]
    Pty(String),

    #[error("task #{id} merged but status update failed: {source}")]
    MergedNotRecorded {
        id: u64,
        #[source]
        source: Box<AppError>,
    },

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

impl AppError {
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoPath {
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InvalidStatus(_) | Self::InvalidPriority(_) => {
                ErrorKind::Validation
            }
            Self::TaskNotFound(_)
            | Self::BranchNotFound(_)
            | Self::RepoNotFound(_)
            | Self::SessionNotFound(_) => ErrorKind::NotFound,
            Self::PoolFull | Self::MergeConflict { .. } => ErrorKind::Conflict,
            Self::AgentFailed { .. } | Self::Git { .. } | Self::GitNotFound | Self::Pty(_) => {
                ErrorKind::External
            }
            Self::MergedNotRecorded { .. }
            | Self::IoPath { .. }
            | Self::Config(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    // External failures are the only class a caller may reasonably retry;
    // the core itself never retries.
    #[must_use]
    pub fn retryable(&self) -> bool {
        self.kind() == ErrorKind::External
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_taxonomy() {
        assert_eq!(
            AppError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(AppError::TaskNotFound(7).kind(), ErrorKind::NotFound);
        assert_eq!(AppError::PoolFull.kind(), ErrorKind::Conflict);
        assert_eq!(
            AppError::MergeConflict {
                branch: "task_1".into(),
                output: String::new()
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(AppError::GitNotFound.kind(), ErrorKind::External);
        assert_eq!(AppError::Internal("x".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn only_external_errors_are_retryable() {
        assert!(
            AppError::AgentFailed {
                task_id: 1,
                code: Some(1),
                output: String::new()
            }
            .retryable()
        );
        assert!(!AppError::PoolFull.retryable());
        assert!(!AppError::TaskNotFound(1).retryable());
    }
}
