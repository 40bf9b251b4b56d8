#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::store::model::Task;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub path: String,
    pub added_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
struct RegistryFile {
    active: String,
    repositories: Vec<Repository>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub name: String,
    pub path: String,
    pub is_valid: bool,
    pub has_plan_file: bool,
    pub task_count: usize,
}

// Persistent list of known repositories plus the active selection.
// Lives next to the settings file; writes are atomic (tmp + rename).
#[derive(Debug)]
pub struct RepoRegistry {
    path: PathBuf,
    state: RegistryFile,
}

impl RepoRegistry {
    pub fn open(path: PathBuf) -> Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| AppError::io(&path, e))?;
            let state: RegistryFile = toml::from_str(&raw)
                .map_err(|e| AppError::Config(format!("failed to parse {}: {e}", path.display())))?;
            return Ok(Self { path, state });
        }

        // First run: seed from the repository enclosing the cwd, when there
        // is one. This is the fallback path; the registry is authoritative
        // from the second run onward.
        let mut reg = Self {
            path,
            state: RegistryFile::default(),
        };
        if let Ok(cwd) = std::env::current_dir()
            && let Some(root) = detect_repository(&cwd)
        {
            let repo = reg.push_repository(None, &root)?;
            reg.state.active = repo.id.clone();
            info!(path = %root.display(), "detected repository from working directory");
        }
        reg.save()?;
        Ok(reg)
    }

    #[must_use]
    pub fn repositories(&self) -> &[Repository] {
        &self.state.repositories
    }

    pub fn active(&self) -> Result<Repository> {
        self.state
            .repositories
            .iter()
            .find(|r| r.id == self.state.active)
            .cloned()
            .ok_or_else(|| AppError::RepoNotFound("no active repository configured".to_owned()))
    }

    pub fn add(&mut self, name: Option<&str>, path: &Path) -> Result<Repository> {
        let canonical = path
            .canonicalize()
            .map_err(|e| AppError::io(path, e))?;
        if !is_valid_repository(&canonical) {
            return Err(AppError::Validation(format!(
                "not a valid repository (missing plan/task.json): {}",
                canonical.display()
            )));
        }
        let path_str = canonical.to_string_lossy().to_string();
        if self.state.repositories.iter().any(|r| r.path == path_str) {
            return Err(AppError::Validation(format!(
                "repository already registered: {path_str}"
            )));
        }

        let repo = self.push_repository(name, &canonical)?;
        // First repository becomes the active one.
        if self.state.repositories.len() == 1 {
            self.state.active = repo.id.clone();
        }
        self.save()?;
        Ok(repo)
    }

    pub fn remove(&mut self, id: &str) -> Result<()> {
        let before = self.state.repositories.len();
        self.state.repositories.retain(|r| r.id != id);
        if self.state.repositories.len() == before {
            return Err(AppError::RepoNotFound(id.to_owned()));
        }

        if self.state.active == id {
            self.state.active = self
                .state
                .repositories
                .first()
                .map(|r| r.id.clone())
                .unwrap_or_default();
        }
        self.save()
    }

    pub fn switch(&mut self, id: &str) -> Result<Repository> {
        let repo = self
            .state
            .repositories
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| AppError::RepoNotFound(id.to_owned()))?;
        self.state.active = repo.id.clone();
        self.save()?;
        Ok(repo)
    }

    fn push_repository(&mut self, name: Option<&str>, path: &Path) -> Result<Repository> {
        let name = match name {
            Some(n) if !n.trim().is_empty() => n.trim().to_owned(),
            _ => path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("repository")
                .to_owned(),
        };
        let repo = Repository {
            id: Uuid::new_v4().simple().to_string(),
            name,
            path: path.to_string_lossy().to_string(),
            added_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_else(|_| "unknown".to_owned()),
        };
        self.state.repositories.push(repo.clone());
        Ok(repo)
    }

    fn save(&self) -> Result<()> {
        let data = toml::to_string_pretty(&self.state)
            .map_err(|e| AppError::Config(format!("failed to serialize registry: {e}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::io(parent, e))?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, data.as_bytes()).map_err(|e| AppError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            AppError::io(&self.path, e)
        })?;
        Ok(())
    }
}

#[must_use]
pub fn task_file_path(repo_root: &Path) -> PathBuf {
    repo_root.join("plan").join("task.json")
}

#[must_use]
pub fn is_valid_repository(path: &Path) -> bool {
    path.is_dir() && task_file_path(path).is_file()
}

// Walk up from `start` looking for a directory carrying plan/task.json.
#[must_use]
pub fn detect_repository(start: &Path) -> Option<PathBuf> {
    let mut cur = Some(start);
    while let Some(dir) = cur {
        if is_valid_repository(dir) {
            return Some(dir.to_path_buf());
        }
        cur = dir.parent();
    }
    None
}

// Scan the direct children of a directory for usable repositories, skipping
// hidden and build/dependency directories.
pub fn find_repositories(search_dir: &Path) -> Result<Vec<RepositoryInfo>> {
    if !search_dir.is_dir() {
        return Err(AppError::Validation(format!(
            "not a directory: {}",
            search_dir.display()
        )));
    }

    let mut found = Vec::new();
    for entry in std::fs::read_dir(search_dir).map_err(|e| AppError::io(search_dir, e))? {
        let entry = entry.map_err(|e| AppError::io(search_dir, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if should_skip_dir(name) {
            continue;
        }
        if is_valid_repository(&path) {
            found.push(validate_repository(&path));
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

fn should_skip_dir(name: &str) -> bool {
    if name.starts_with('.') {
        return true;
    }
    matches!(
        name,
        "node_modules" | "vendor" | "target" | "dist" | "build"
    )
}

#[must_use]
pub fn validate_repository(path: &Path) -> RepositoryInfo {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("repository")
        .to_owned();
    let task_file = task_file_path(path);
    let has_plan_file = task_file.is_file();
    let task_count = if has_plan_file {
        std::fs::read(&task_file)
            .ok()
            .and_then(|data| serde_json::from_slice::<Vec<Task>>(&data).ok())
            .map_or(0, |tasks| tasks.len())
    } else {
        0
    };

    RepositoryInfo {
        name,
        path: path.to_string_lossy().to_string(),
        is_valid: path.is_dir() && has_plan_file,
        has_plan_file,
        task_count,
    }
}
