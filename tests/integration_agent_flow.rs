use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use agentboard::agent::execution::{RunLog, RunStatus};
use agentboard::agent::sanitize::PathPolicy;
use agentboard::agent::{AgentSpawner, SpawnerConfig};
use agentboard::engine::TransitionEngine;
use agentboard::error::AppError;
use agentboard::git::Git;
use agentboard::pool::lease::Lease;
use agentboard::pool::{PoolConfig, WorktreePool};
use agentboard::store::TaskStore;
use agentboard::store::model::{Task, TaskPriority, TaskStatus};

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

fn run(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git command");
    if !out.status.success() {
        panic!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }
}

fn seed_repo(parent: &Path) -> PathBuf {
    let repo = parent.join("repo");
    std::fs::create_dir_all(&repo).expect("mkdir repo");
    run(&repo, &["init"]);
    run(&repo, &["config", "user.email", "test@example.com"]);
    run(&repo, &["config", "user.name", "Test"]);
    std::fs::write(repo.join("README.md"), "hello\n").expect("write");
    run(&repo, &["add", "."]);
    run(&repo, &["commit", "-m", "init"]);
    repo
}

#[cfg(unix)]
fn write_stub_agent(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt as _;

    let script = dir.join("stub-agent.sh");
    std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    script
}

#[cfg(unix)]
fn wiring(
    repo: &Path,
    agent_exe: &Path,
) -> (Arc<TaskStore>, Arc<WorktreePool>, TransitionEngine) {
    let store = Arc::new(TaskStore::open(repo.join("plan").join("task.json")).expect("store"));
    store
        .save(vec![Task {
            id: 1,
            title: "T".to_owned(),
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            deps: Vec::new(),
            parent: None,
        }])
        .expect("seed task");

    let pool = Arc::new(
        WorktreePool::new(Git::new(repo.to_path_buf()), PoolConfig::default()).expect("pool"),
    );
    let spawner = Arc::new(AgentSpawner::new(
        repo.to_path_buf(),
        Arc::clone(&pool),
        SpawnerConfig {
            executable: agent_exe.to_string_lossy().to_string(),
            bypass_flag: String::new(),
            spawn_timeout: Duration::from_secs(30),
            path_policy: PathPolicy {
                allowed_roots: Vec::new(),
                max_depth: 64,
            },
        },
    ));
    let engine = TransitionEngine::new(Arc::clone(&store), spawner);
    (store, pool, engine)
}

// S1 shape: the move persists first, a lease appears in worker1, the agent
// runs on the leased checkout with the task coordinates in its environment,
// and the lease is gone after an orderly exit.
#[cfg(unix)]
#[tokio::test]
async fn happy_path_move_spawns_agent_and_cleans_up() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = seed_repo(td.path());
    let agent = write_stub_agent(
        td.path(),
        "printf '%s|%s|%s' \"$TASK_ID\" \"$TASK_TITLE\" \"$PATH\" > agent_ran.txt",
    );
    let (store, _pool, engine) = wiring(&repo, &agent);

    engine
        .move_task_foreground(1, TaskStatus::Doing)
        .await
        .expect("move");

    // The status change was persisted independently of the agent run.
    assert_eq!(store.get(1).expect("task").status, TaskStatus::Doing);

    let worker1 = td.path().join("repo-worker1");
    let marker = std::fs::read_to_string(worker1.join("agent_ran.txt")).expect("agent marker");
    let mut parts = marker.split('|');
    assert_eq!(parts.next(), Some("1"));
    assert_eq!(parts.next(), Some("T"));
    // The agent saw the restricted PATH, not the host's.
    assert_eq!(parts.next(), Some("/usr/local/bin:/usr/bin:/bin"));

    // Orderly exit released the lease and detached the workspace from the
    // task branch.
    assert!(Lease::load(&worker1).expect("load").is_none());
    let git = Git::new(repo.clone());
    let head = git
        .run_in_dir(&worker1, &["rev-parse", "--abbrev-ref", "HEAD"])
        .expect("head");
    assert_eq!(head.trim(), "HEAD");

    // The run left a completed record behind.
    let runs = RunLog::new(&repo).list().expect("list runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].task_id, 1);
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(runs[0].exit_code, Some(0));
}

#[cfg(unix)]
#[tokio::test]
async fn nonzero_agent_exit_surfaces_failure_but_keeps_doing() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = seed_repo(td.path());
    let agent = write_stub_agent(td.path(), "echo boom >&2\nexit 3");
    let (store, _pool, engine) = wiring(&repo, &agent);

    let err = engine
        .move_task_foreground(1, TaskStatus::Doing)
        .await
        .expect_err("agent failure");
    match err {
        AppError::AgentFailed {
            task_id,
            code,
            output,
        } => {
            assert_eq!(task_id, 1);
            assert_eq!(code, Some(3));
            assert!(output.contains("boom"));
        }
        other => panic!("expected AgentFailed, got {other}"),
    }

    // No rollback: the task stays visibly stuck in doing, and the lease is
    // back in the pool.
    assert_eq!(store.get(1).expect("task").status, TaskStatus::Doing);
    assert!(
        Lease::load(&td.path().join("repo-worker1"))
            .expect("load")
            .is_none()
    );

    // The failure is on record together with the captured output.
    let log = RunLog::new(&repo);
    let runs = log.list().expect("list runs");
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(log.read_output(&runs[0].run_id).expect("output").contains("boom"));
}

#[cfg(unix)]
#[tokio::test]
async fn saturated_pool_fails_the_launch_but_not_the_move() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = seed_repo(td.path());
    let agent = write_stub_agent(td.path(), "exit 0");
    let (store, pool, engine) = wiring(&repo, &agent);

    // Two healthy live leases saturate the default pool.
    let busy_a = pool.acquire(90, "held").expect("lease a");
    let busy_b = pool.acquire(91, "held").expect("lease b");

    let err = engine
        .move_task_foreground(1, TaskStatus::Doing)
        .await
        .expect_err("saturated");
    assert!(matches!(err, AppError::PoolFull));
    assert_eq!(store.get(1).expect("task").status, TaskStatus::Doing);

    drop(busy_a);
    drop(busy_b);
}
