#![forbid(unsafe_code)]

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::app::App;
use crate::config;
use crate::error::Result;
use crate::output::table::Table;
use crate::store::model::TaskStatus;

#[derive(Debug, Parser)]
#[command(
    name = "agentboard",
    version,
    about = "Autonomous task-execution supervisor over pooled git worktrees"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the control-plane server
    Serve(ServeArgs),
    /// List tasks from the active repository
    Tasks(TasksArgs),
    /// Create a task
    Add(AddArgs),
    /// Delete a task
    Remove(IdArgs),
    /// Move a task to a new status column
    Move(MoveArgs),
    /// Merge a task branch and mark the task done
    Approve(IdArgs),
    /// Discard a task branch and mark the task done
    Reject(IdArgs),
    /// Show worktree pool status
    Status(StatusArgs),
    /// List recorded agent runs
    Agents(AgentsArgs),
    /// Print the plan document
    Plan,
    /// Manage registered repositories
    Repos(ReposArgs),
}

#[derive(Debug, Parser)]
pub struct ServeArgs {
    /// Address to listen on (defaults to server.bind from config)
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Debug, Parser)]
pub struct TasksArgs {
    /// Only show tasks in this status
    #[arg(short = 's', long = "status")]
    pub status: Option<String>,
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
    /// Output as CSV
    #[arg(long)]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct AddArgs {
    pub title: String,
    /// backlog or todo
    #[arg(short = 's', long = "status", default_value = "todo")]
    pub status: String,
    /// high, medium or low
    #[arg(short = 'p', long = "priority", default_value = "medium")]
    pub priority: String,
    /// Task ids this task depends on
    #[arg(short = 'd', long = "dep")]
    pub deps: Vec<u64>,
    /// Parent task id
    #[arg(long = "parent")]
    pub parent: Option<u64>,
}

#[derive(Debug, Parser)]
pub struct MoveArgs {
    pub id: u64,
    pub status: String,
}

#[derive(Debug, Parser)]
pub struct IdArgs {
    pub id: u64,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct AgentsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
    /// Print the captured output of one run
    #[arg(long = "log")]
    pub log: Option<String>,
}

#[derive(Debug, Parser)]
pub struct ReposArgs {
    #[command(subcommand)]
    pub cmd: RepoCommands,
}

#[derive(Debug, Subcommand)]
pub enum RepoCommands {
    /// List registered repositories
    List,
    /// Register a repository by path
    Add {
        path: String,
        #[arg(short = 'n', long = "name")]
        name: Option<String>,
    },
    /// Remove a repository from the registry
    Remove { id: String },
    /// Switch the active repository
    Switch { id: String },
    /// Check whether a path is a usable repository
    Validate { path: String },
    /// Search a directory for usable repositories
    Find { dir: String },
}

pub async fn main() -> ExitCode {
    crate::logging::init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = config::load()?;

    // Registry maintenance must work before any repository is active, so it
    // bypasses App entirely.
    let cmd = match cli.cmd {
        Commands::Repos(args) => return cmd_repos(args.cmd),
        other => other,
    };

    let app = App::bootstrap(settings)?;
    match cmd {
        Commands::Serve(args) => cmd_serve(&app, args).await,
        Commands::Tasks(args) => cmd_tasks(&app, &args),
        Commands::Add(args) => cmd_add(&app, args),
        Commands::Remove(args) => {
            app.delete_task(args.id)?;
            println!("task #{} deleted", args.id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Move(args) => cmd_move(&app, &args).await,
        Commands::Approve(args) => {
            app.approve_task(args.id)?;
            println!("task #{} approved and merged", args.id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reject(args) => {
            app.reject_task(args.id)?;
            println!("task #{} rejected", args.id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status(args) => cmd_status(&app, &args),
        Commands::Agents(args) => cmd_agents(&app, &args),
        Commands::Plan => {
            print!("{}", app.read_plan()?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Repos(_) => unreachable!("handled above"),
    }
}

async fn cmd_serve(app: &Arc<App>, args: ServeArgs) -> Result<ExitCode> {
    let bind = args
        .bind
        .unwrap_or_else(|| app.settings().server.bind.clone());
    app.start_background_tasks();
    crate::server::run(Arc::clone(app), &bind).await?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_tasks(app: &App, args: &TasksArgs) -> Result<ExitCode> {
    let mut tasks = app.list_tasks()?;
    if let Some(raw) = &args.status {
        let wanted = TaskStatus::parse(raw)?;
        tasks.retain(|t| t.status == wanted);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut table = Table::new(["ID", "STATUS", "PRIORITY", "TITLE"]);
    for task in &tasks {
        table.row([
            task.id.to_string(),
            task.status.as_str().to_owned(),
            task.priority.as_str().to_owned(),
            task.title.clone(),
        ]);
    }
    if args.csv {
        table
            .print_csv()
            .map_err(|e| crate::error::AppError::Internal(format!("csv output failed: {e}")))?;
    } else {
        table
            .print()
            .map_err(|e| crate::error::AppError::Internal(format!("output failed: {e}")))?;
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_add(app: &App, args: AddArgs) -> Result<ExitCode> {
    use crate::store::model::{Task, TaskPriority};

    let task = app.add_task(Task {
        id: 0,
        title: args.title,
        status: TaskStatus::parse(&args.status)?,
        priority: TaskPriority::parse(&args.priority)?,
        deps: args.deps,
        parent: args.parent,
    })?;
    println!("task #{} created ({})", task.id, task.status.as_str());
    Ok(ExitCode::SUCCESS)
}

// The one-shot CLI waits for the agent when the move triggers one; the
// server path dispatches it in the background instead.
async fn cmd_move(app: &App, args: &MoveArgs) -> Result<ExitCode> {
    let status = TaskStatus::parse(&args.status)?;
    app.move_task_foreground(args.id, status).await?;
    println!("task #{} moved to {}", args.id, status.as_str());
    Ok(ExitCode::SUCCESS)
}

fn cmd_status(app: &App, args: &StatusArgs) -> Result<ExitCode> {
    let status = app.pool_status()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "workers: {} total, {} idle, {} busy, {} stale (max {})",
        status.total, status.idle, status.busy, status.stale, status.max_workers
    );
    let mut table = Table::new(["WORKER", "STATE", "TASK", "TITLE", "PID", "STARTED"]);
    for ws in &status.worktrees {
        table.row([
            ws.name.clone(),
            ws.status.to_owned(),
            ws.task_id.map(|id| id.to_string()).unwrap_or_default(),
            ws.task_title.clone().unwrap_or_default(),
            ws.pid.map(|p| p.to_string()).unwrap_or_default(),
            ws.started.clone().unwrap_or_default(),
        ]);
    }
    table
        .print()
        .map_err(|e| crate::error::AppError::Internal(format!("output failed: {e}")))?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_agents(app: &App, args: &AgentsArgs) -> Result<ExitCode> {
    if let Some(run_id) = &args.log {
        print!("{}", app.read_agent_log(run_id)?);
        return Ok(ExitCode::SUCCESS);
    }

    let runs = app.list_agent_runs()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut table = Table::new(["RUN", "TASK", "STATUS", "EXIT", "STARTED", "WORKER"]);
    for run in &runs {
        let status = match run.status {
            crate::agent::execution::RunStatus::Running => "running",
            crate::agent::execution::RunStatus::Completed => "completed",
            crate::agent::execution::RunStatus::Failed => "failed",
        };
        table.row([
            run.run_id.clone(),
            format!("#{} {}", run.task_id, run.task_title),
            status.to_owned(),
            run.exit_code.map(|c| c.to_string()).unwrap_or_default(),
            run.started.clone(),
            run.workspace.clone(),
        ]);
    }
    table
        .print()
        .map_err(|e| crate::error::AppError::Internal(format!("output failed: {e}")))?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_repos(cmd: RepoCommands) -> Result<ExitCode> {
    use crate::config::registry::{self, RepoRegistry};

    let paths = config::default_paths()?;
    let mut registry = RepoRegistry::open(paths.registry_file)?;

    match cmd {
        RepoCommands::List => {
            let active = registry.active().ok();
            let mut table = Table::new(["ID", "NAME", "PATH", "ACTIVE"]);
            for repo in registry.repositories() {
                let marker = if active.as_ref().is_some_and(|a| a.id == repo.id) {
                    "*"
                } else {
                    ""
                };
                table.row([
                    repo.id.clone(),
                    repo.name.clone(),
                    repo.path.clone(),
                    marker.to_owned(),
                ]);
            }
            table
                .print()
                .map_err(|e| crate::error::AppError::Internal(format!("output failed: {e}")))?;
        }
        RepoCommands::Add { path, name } => {
            let expanded = config::expand_path(&path)?;
            let repo = registry.add(name.as_deref(), &expanded)?;
            println!("added {} ({})", repo.name, repo.id);
        }
        RepoCommands::Remove { id } => {
            registry.remove(&id)?;
            println!("removed {id}");
        }
        RepoCommands::Switch { id } => {
            let repo = registry.switch(&id)?;
            println!("active repository: {} ({})", repo.name, repo.path);
        }
        RepoCommands::Validate { path } => {
            let expanded = config::expand_path(&path)?;
            let info = registry::validate_repository(&expanded);
            println!(
                "{}: valid={} tasks={}",
                info.path, info.is_valid, info.task_count
            );
        }
        RepoCommands::Find { dir } => {
            let expanded = config::expand_path(&dir)?;
            let mut table = Table::new(["NAME", "PATH", "TASKS"]);
            for info in registry::find_repositories(&expanded)? {
                table.row([info.name, info.path, info.task_count.to_string()]);
            }
            table
                .print()
                .map_err(|e| crate::error::AppError::Internal(format!("output failed: {e}")))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
