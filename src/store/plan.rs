#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{AppError, Result};
use crate::store::fsio;

// The free-form plan document next to the task list. Read and overwritten
// whole; every overwrite leaves a timestamped backup beside it.
#[derive(Debug, Clone)]
pub struct PlanFile {
    path: PathBuf,
}

impl PlanFile {
    #[must_use]
    pub fn new(repo_root: &Path) -> Self {
        Self {
            path: repo_root.join("plan").join("plan.md"),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            // A fresh repository simply has no plan yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(AppError::io(&self.path, e)),
        }
    }

    pub fn write(&self, content: &str) -> Result<()> {
        if let Err(e) = fsio::create_backup(&self.path) {
            warn!(path = %self.path.display(), "plan backup failed: {e}");
        }
        fsio::atomic_write(&self.path, content.as_bytes())
    }
}
