#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use crate::agent::execution::{RunLog, RunRecord};
use crate::agent::{AgentSpawner, SpawnerConfig, sanitize::PathPolicy};
use crate::config::registry::{RepoRegistry, Repository, RepositoryInfo, task_file_path};
use crate::config::{self, Settings};
use crate::engine::TransitionEngine;
use crate::error::{AppError, Result};
use crate::git::Git;
use crate::pool::{PoolConfig, PoolStatus, WorktreePool};
use crate::review::ReviewService;
use crate::store::TaskStore;
use crate::store::model::{Task, TaskStatus};
use crate::store::plan::PlanFile;
use crate::term::{TerminalConfig, TerminalMultiplexer};

// Everything bound to one repository. Rebuilt wholesale when the active
// repository changes.
#[derive(Debug)]
pub struct RepoContext {
    pub root: PathBuf,
    pub store: Arc<TaskStore>,
    pub pool: Arc<WorktreePool>,
    pub engine: TransitionEngine,
    pub review: ReviewService,
    pub plan: PlanFile,
    pub runs: RunLog,
}

// Process-wide composition root. Terminal sessions are independent of the
// repository and survive a switch; the task pipeline does not.
#[derive(Debug)]
pub struct App {
    settings: Settings,
    registry: Mutex<RepoRegistry>,
    terminals: Arc<TerminalMultiplexer>,
    repo: RwLock<Arc<RepoContext>>,
}

impl App {
    pub fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        settings.validate()?;
        let paths = config::default_paths()?;
        let registry = RepoRegistry::open(paths.registry_file)?;
        let active = registry.active()?;
        Self::bootstrap_with(settings, registry, PathBuf::from(&active.path))
    }

    // Used by tests and by callers that already know the repository root.
    pub fn bootstrap_with(
        settings: Settings,
        registry: RepoRegistry,
        repo_root: PathBuf,
    ) -> Result<Arc<Self>> {
        settings.validate()?;
        let context = build_context(&settings, repo_root)?;
        let terminals = Arc::new(TerminalMultiplexer::new(TerminalConfig {
            shell: settings.terminal.shell.clone(),
            scrollback_lines: settings.terminal.scrollback_lines,
            scrollback_bytes: settings.terminal.scrollback_bytes,
        }));

        let app = Arc::new(Self {
            settings,
            registry: Mutex::new(registry),
            terminals,
            repo: RwLock::new(Arc::new(context)),
        });

        if let Ok(retention) = app.settings.backup_retention()
            && let Err(e) = app.repo().store.cleanup_backups(retention)
        {
            warn!("startup backup cleanup failed: {e}");
        }
        Ok(app)
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn repo(&self) -> Arc<RepoContext> {
        Arc::clone(
            &self
                .repo
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    #[must_use]
    pub fn terminals(&self) -> &Arc<TerminalMultiplexer> {
        &self.terminals
    }

    // Periodic backup pruning; the interval and retention both come from
    // settings. Runs until the process exits.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let Ok(interval) = self.settings.cleanup_interval() else {
            return;
        };
        let Ok(retention) = self.settings.backup_retention() else {
            return;
        };

        let run_retention = self.settings.agent_log_retention().ok();
        let app = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let repo = app.repo();
                if let Err(e) = repo.store.cleanup_backups(retention) {
                    warn!("periodic backup cleanup failed: {e}");
                }
                if let Some(run_retention) = run_retention
                    && let Err(e) = repo.runs.cleanup(run_retention)
                {
                    warn!("periodic agent log cleanup failed: {e}");
                }
            }
        });
    }

    // ── task operations ─────────────────────────────────────────────────

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.repo().store.load()
    }

    pub fn save_tasks(&self, tasks: Vec<Task>) -> Result<()> {
        self.repo().store.save(tasks)
    }

    pub fn update_task(&self, task: Task) -> Result<()> {
        self.repo().store.update(task)
    }

    pub fn add_task(&self, task: Task) -> Result<Task> {
        self.repo().store.add(task)
    }

    pub fn delete_task(&self, id: u64) -> Result<()> {
        self.repo().store.remove(id)
    }

    pub fn move_task(&self, id: u64, status: TaskStatus) -> Result<()> {
        self.repo().engine.move_task(id, status)
    }

    pub async fn move_task_foreground(&self, id: u64, status: TaskStatus) -> Result<()> {
        let repo = self.repo();
        repo.engine.move_task_foreground(id, status).await
    }

    pub fn approve_task(&self, id: u64) -> Result<()> {
        self.repo().review.approve(id)
    }

    pub fn reject_task(&self, id: u64) -> Result<()> {
        self.repo().review.reject(id)
    }

    pub fn pool_status(&self) -> Result<PoolStatus> {
        self.repo().pool.status()
    }

    pub fn read_plan(&self) -> Result<String> {
        self.repo().plan.read()
    }

    pub fn write_plan(&self, content: &str) -> Result<()> {
        self.repo().plan.write(content)
    }

    pub fn list_agent_runs(&self) -> Result<Vec<RunRecord>> {
        self.repo().runs.list()
    }

    pub fn read_agent_log(&self, run_id: &str) -> Result<String> {
        self.repo().runs.read_output(run_id)
    }

    // ── repository operations ───────────────────────────────────────────

    pub fn list_repositories(&self) -> Vec<Repository> {
        self.registry_lock().repositories().to_vec()
    }

    pub fn active_repository(&self) -> Result<Repository> {
        self.registry_lock().active()
    }

    pub fn add_repository(&self, name: Option<&str>, path: &str) -> Result<Repository> {
        let expanded = config::expand_path(path)?;
        self.registry_lock().add(name, &expanded)
    }

    pub fn remove_repository(&self, id: &str) -> Result<()> {
        self.registry_lock().remove(id)
    }

    pub fn validate_repository(&self, path: &str) -> Result<RepositoryInfo> {
        let expanded = config::expand_path(path)?;
        Ok(crate::config::registry::validate_repository(&expanded))
    }

    pub fn find_repositories(&self, search_dir: &str) -> Result<Vec<RepositoryInfo>> {
        let expanded = config::expand_path(search_dir)?;
        crate::config::registry::find_repositories(&expanded)
    }

    // Re-initializes the task pipeline for the new repository. Terminal
    // sessions are untouched on purpose.
    pub fn switch_repository(&self, id: &str) -> Result<Repository> {
        let repo = self.registry_lock().switch(id)?;
        let context = build_context(&self.settings, PathBuf::from(&repo.path))?;
        *self
            .repo
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(context);
        info!(repo = %repo.name, path = %repo.path, "switched active repository");
        Ok(repo)
    }

    fn registry_lock(&self) -> std::sync::MutexGuard<'_, RepoRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn build_context(settings: &Settings, root: PathBuf) -> Result<RepoContext> {
    let store = Arc::new(TaskStore::open(task_file_path(&root))?);
    let git = Git::new(root.clone());

    let pool = Arc::new(WorktreePool::new(
        git.clone(),
        PoolConfig {
            max_workers: settings.pool.max_workers,
            max_lease_age: settings.max_lease_age()?,
            mainline: settings.pool.mainline.clone(),
        },
    )?);

    let mut allowed_roots = Vec::new();
    for raw in &settings.agent.allowed_roots {
        allowed_roots.push(config::expand_path(raw)?);
    }
    let spawner = Arc::new(AgentSpawner::new(
        root.clone(),
        Arc::clone(&pool),
        SpawnerConfig {
            executable: settings.agent.executable.clone(),
            bypass_flag: settings.agent.bypass_flag.clone(),
            spawn_timeout: settings.spawn_timeout()?,
            path_policy: PathPolicy {
                allowed_roots,
                ..PathPolicy::default()
            },
        },
    ));

    let runs = spawner.run_log().clone();
    let engine = TransitionEngine::new(Arc::clone(&store), spawner);
    let review = ReviewService::new(Arc::clone(&store), git);
    let plan = PlanFile::new(&root);

    Ok(RepoContext {
        root,
        store,
        pool,
        engine,
        review,
        plan,
        runs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_repo(dir: &std::path::Path, name: &str) -> PathBuf {
        let root = dir.join(name);
        std::fs::create_dir_all(root.join("plan")).unwrap();
        std::fs::write(
            root.join("plan").join("task.json"),
            format!(
                r#"[{{"id":1,"title":"{name} task","status":"todo","priority":"low","deps":[],"parent":null}}]"#
            ),
        )
        .unwrap();
        root
    }

    #[test]
    fn switch_repository_swaps_the_task_pipeline() {
        let td = tempfile::tempdir().expect("tempdir");
        let root_a = seeded_repo(td.path(), "alpha");
        let root_b = seeded_repo(td.path(), "beta");

        let mut registry = RepoRegistry::open(td.path().join("repos.toml")).unwrap();
        let a = registry.add(None, &root_a).unwrap();
        let b = registry.add(None, &root_b).unwrap();
        assert_eq!(registry.active().unwrap().id, a.id);

        let app = App::bootstrap_with(Settings::default(), registry, root_a).unwrap();
        assert_eq!(app.list_tasks().unwrap()[0].title, "alpha task");

        let term_id = app.terminals().open();
        app.switch_repository(&b.id).unwrap();
        assert_eq!(app.list_tasks().unwrap()[0].title, "beta task");
        // Terminal ids are repository-independent.
        assert_ne!(term_id, "");
        assert_eq!(app.active_repository().unwrap().id, b.id);
    }

    #[test]
    fn plan_round_trips_through_the_facade() {
        let td = tempfile::tempdir().expect("tempdir");
        let root = seeded_repo(td.path(), "solo");
        let mut registry = RepoRegistry::open(td.path().join("repos.toml")).unwrap();
        registry.add(None, &root).unwrap();

        let app = App::bootstrap_with(Settings::default(), registry, root).unwrap();
        assert_eq!(app.read_plan().unwrap(), "");
        app.write_plan("# the plan\n").unwrap();
        assert_eq!(app.read_plan().unwrap(), "# the plan\n");
    }
}
