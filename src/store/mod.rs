#![forbid(unsafe_code)]

pub mod fsio;
pub mod model;
pub mod plan;

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::store::model::{Task, TaskStatus, validate_tasks};

// Exclusive owner of the task list file. Exactly one writer at a time, any
// number of readers; every mutation is durable before the call returns.
#[derive(Debug)]
pub struct TaskStore {
    path: PathBuf,
    tasks: RwLock<Vec<Task>>,
}

impl TaskStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let store = Self {
            path,
            tasks: RwLock::new(Vec::new()),
        };
        store.load()?;
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // Re-reads the canonical file so external edits are picked up. An absent
    // file is created as an empty list through the same atomic write path.
    pub fn load(&self) -> Result<Vec<Task>> {
        let mut guard = self.write_lock();

        match std::fs::read(&self.path) {
            Ok(data) => {
                let tasks: Vec<Task> = serde_json::from_slice(&data).map_err(|e| {
                    AppError::Validation(format!(
                        "failed to parse {}: {e}",
                        self.path.display()
                    ))
                })?;
                *guard = tasks;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *guard = Vec::new();
                self.persist_locked(&guard)?;
                info!(path = %self.path.display(), "created empty task file");
            }
            Err(e) => return Err(AppError::io(&self.path, e)),
        }

        Ok(guard.clone())
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Task> {
        self.read_lock().clone()
    }

    pub fn save(&self, tasks: Vec<Task>) -> Result<()> {
        validate_tasks(&tasks)?;
        let mut guard = self.write_lock();
        self.persist_locked(&tasks)?;
        *guard = tasks;
        Ok(())
    }

    pub fn get(&self, id: u64) -> Result<Task> {
        self.read_lock()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(AppError::TaskNotFound(id))
    }

    // New tasks start life in backlog or todo and get the next free id.
    pub fn add(&self, mut task: Task) -> Result<Task> {
        if !matches!(task.status, TaskStatus::Backlog | TaskStatus::Todo) {
            return Err(AppError::Validation(format!(
                "new tasks start in backlog or todo, not {}",
                task.status.as_str()
            )));
        }

        let mut guard = self.write_lock();
        task.id = guard.iter().map(|t| t.id).max().unwrap_or(0) + 1;

        let mut updated = guard.clone();
        updated.push(task.clone());
        validate_tasks(&updated)?;

        self.persist_locked(&updated)?;
        *guard = updated;
        info!(task_id = task.id, "task created");
        Ok(task)
    }

    // Deletion refuses to orphan siblings: a task still referenced by
    // another task's deps or parent stays.
    pub fn remove(&self, id: u64) -> Result<()> {
        let mut guard = self.write_lock();
        if !guard.iter().any(|t| t.id == id) {
            return Err(AppError::TaskNotFound(id));
        }

        let updated: Vec<Task> = guard.iter().filter(|t| t.id != id).cloned().collect();
        validate_tasks(&updated).map_err(|_| {
            AppError::Validation(format!(
                "task {id} is referenced by another task's deps or parent"
            ))
        })?;

        self.persist_locked(&updated)?;
        *guard = updated;
        info!(task_id = id, "task deleted");
        Ok(())
    }

    // The replacement is validated in the context of the whole list, so a
    // task may keep deps/parent references to its siblings.
    pub fn update(&self, task: Task) -> Result<()> {
        let id = task.id;
        let mut guard = self.write_lock();

        let mut updated = guard.clone();
        let slot = updated
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(AppError::TaskNotFound(id))?;
        *slot = task;
        validate_tasks(&updated)?;

        self.persist_locked(&updated)?;
        *guard = updated;
        info!(task_id = id, "task updated");
        Ok(())
    }

    // Mutates only the status field; returns the previous status so callers
    // can detect transition edges. Idempotent for an unchanged status.
    pub fn move_status(&self, id: u64, status: TaskStatus) -> Result<TaskStatus> {
        let mut guard = self.write_lock();

        let mut updated = guard.clone();
        let slot = updated
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(AppError::TaskNotFound(id))?;
        let old = slot.status;
        slot.status = status;

        self.persist_locked(&updated)?;
        *guard = updated;
        info!(task_id = id, from = old.as_str(), to = status.as_str(), "task moved");
        Ok(old)
    }

    #[must_use]
    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.read_lock()
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    pub fn cleanup_backups(&self, max_age: Duration) -> Result<usize> {
        let removed = fsio::cleanup_old_backups(&self.path, max_age)?;
        if removed > 0 {
            info!(removed, path = %self.path.display(), "pruned task file backups");
        }
        Ok(removed)
    }

    // Backup (best effort), marshal, atomic replace. On a failed replace the
    // backup is renamed back into place so readers keep a coherent file.
    fn persist_locked(&self, tasks: &[Task]) -> Result<()> {
        let backup = match fsio::create_backup(&self.path) {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %self.path.display(), "task file backup failed: {e}");
                None
            }
        };

        let mut data = serde_json::to_vec_pretty(tasks)?;
        data.push(b'\n');

        if let Err(e) = fsio::atomic_write(&self.path, &data) {
            if let Some(backup) = backup
                && let Err(rb) = fsio::restore_backup(&self.path, &backup)
            {
                warn!(path = %self.path.display(), "rollback from backup failed: {rb}");
            }
            return Err(e);
        }
        Ok(())
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, Vec<Task>> {
        self.tasks.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Task>> {
        self.tasks.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::TaskPriority;

    fn task(id: u64, status: TaskStatus) -> Task {
        Task {
            id,
            title: format!("task {id}"),
            status,
            priority: TaskPriority::Medium,
            deps: Vec::new(),
            parent: None,
        }
    }

    fn open_store(dir: &Path) -> TaskStore {
        TaskStore::open(dir.join("plan").join("task.json")).unwrap()
    }

    #[test]
    fn absent_file_becomes_an_empty_list_on_disk() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = open_store(td.path());
        assert!(store.snapshot().is_empty());

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw.trim(), "[]");
    }

    #[test]
    fn save_then_load_is_identity() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = open_store(td.path());
        let tasks = vec![task(1, TaskStatus::Todo), task(2, TaskStatus::Backlog)];

        store.save(tasks.clone()).unwrap();
        assert_eq!(store.load().unwrap(), tasks);

        // Pretty-printed with two-space indentation for human diffing.
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("  \"id\": 1"));
    }

    #[test]
    fn save_rejects_invalid_lists() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = open_store(td.path());
        let mut bad = task(1, TaskStatus::Todo);
        bad.title = String::new();
        assert!(store.save(vec![bad]).is_err());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn move_status_returns_old_and_is_idempotent() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = open_store(td.path());
        store.save(vec![task(1, TaskStatus::Todo)]).unwrap();

        let old = store.move_status(1, TaskStatus::Doing).unwrap();
        assert_eq!(old, TaskStatus::Todo);

        let old = store.move_status(1, TaskStatus::Doing).unwrap();
        assert_eq!(old, TaskStatus::Doing);
        assert_eq!(store.get(1).unwrap().status, TaskStatus::Doing);

        assert!(matches!(
            store.move_status(9, TaskStatus::Done),
            Err(AppError::TaskNotFound(9))
        ));
    }

    #[test]
    fn update_replaces_matching_id_only() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = open_store(td.path());
        store.save(vec![task(1, TaskStatus::Todo)]).unwrap();

        let mut changed = task(1, TaskStatus::Todo);
        changed.title = "renamed".to_owned();
        store.update(changed).unwrap();
        assert_eq!(store.get(1).unwrap().title, "renamed");

        assert!(matches!(
            store.update(task(5, TaskStatus::Todo)),
            Err(AppError::TaskNotFound(5))
        ));
    }

    #[test]
    fn add_assigns_the_next_id_and_enforces_the_entry_statuses() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = open_store(td.path());
        store.save(vec![task(3, TaskStatus::Done)]).unwrap();

        let created = store.add(task(0, TaskStatus::Todo)).unwrap();
        assert_eq!(created.id, 4);
        assert_eq!(store.get(4).unwrap().status, TaskStatus::Todo);

        let refused = store.add(task(0, TaskStatus::Doing));
        assert!(matches!(refused, Err(AppError::Validation(_))));
    }

    #[test]
    fn remove_refuses_to_orphan_references() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = open_store(td.path());
        let mut child = task(2, TaskStatus::Todo);
        child.deps = vec![1];
        store.save(vec![task(1, TaskStatus::Todo), child]).unwrap();

        assert!(matches!(store.remove(1), Err(AppError::Validation(_))));
        store.remove(2).unwrap();
        store.remove(1).unwrap();
        assert!(store.snapshot().is_empty());
        assert!(matches!(store.remove(9), Err(AppError::TaskNotFound(9))));
    }

    #[test]
    fn update_may_reference_sibling_tasks() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = open_store(td.path());
        store
            .save(vec![task(1, TaskStatus::Todo), task(2, TaskStatus::Todo)])
            .unwrap();

        let mut child = task(2, TaskStatus::Todo);
        child.deps = vec![1];
        child.parent = Some(1);
        store.update(child).unwrap();
        assert_eq!(store.get(2).unwrap().deps, vec![1]);

        // A dangling reference is still refused.
        let mut broken = task(2, TaskStatus::Todo);
        broken.deps = vec![9];
        assert!(store.update(broken).is_err());
    }

    #[test]
    fn filter_by_status_snapshots() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = open_store(td.path());
        store
            .save(vec![
                task(1, TaskStatus::Todo),
                task(2, TaskStatus::Doing),
                task(3, TaskStatus::Todo),
            ])
            .unwrap();

        let todos = store.tasks_by_status(TaskStatus::Todo);
        assert_eq!(todos.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn writes_leave_timestamped_backups_and_cleanup_prunes_them() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = open_store(td.path());
        store.save(vec![task(1, TaskStatus::Todo)]).unwrap();
        store.save(vec![task(1, TaskStatus::Done)]).unwrap();

        let plan_dir = store.path().parent().unwrap();
        let backups = |dir: &Path| {
            std::fs::read_dir(dir)
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().contains(".backup."))
                .count()
        };
        assert!(backups(plan_dir) >= 1);

        store.cleanup_backups(Duration::ZERO).unwrap();
        assert_eq!(backups(plan_dir), 0);
    }

    #[test]
    fn external_edits_show_up_on_load() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = open_store(td.path());
        store.save(vec![task(1, TaskStatus::Todo)]).unwrap();

        // Simulate the agent's cross-branch status write.
        let mut external = store.snapshot();
        external[0].status = TaskStatus::PendingReview;
        let mut data = serde_json::to_vec_pretty(&external).unwrap();
        data.push(b'\n');
        std::fs::write(store.path(), data).unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded[0].status, TaskStatus::PendingReview);
    }
}
