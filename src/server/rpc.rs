#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::App;
use crate::error::{AppError, ErrorKind, Result};
use crate::store::model::{Task, TaskStatus};

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub op: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct MoveParams {
    id: u64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct PlanParams {
    content: String,
}

#[derive(Debug, Deserialize)]
struct RepoIdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AddRepoParams {
    #[serde(default)]
    name: Option<String>,
    path: String,
}

#[derive(Debug, Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Debug, Deserialize)]
struct RunIdParams {
    run_id: String,
}

#[derive(Debug, Deserialize)]
struct AddTaskParams {
    title: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    deps: Vec<u64>,
    #[serde(default)]
    parent: Option<u64>,
}

impl AddTaskParams {
    fn into_task(self) -> crate::error::Result<Task> {
        use crate::store::model::TaskPriority;

        let status = match self.status.as_deref() {
            Some(raw) => TaskStatus::parse(raw)?,
            None => TaskStatus::Todo,
        };
        let priority = match self.priority.as_deref() {
            Some(raw) => TaskPriority::parse(raw)?,
            None => TaskPriority::Medium,
        };
        Ok(Task {
            id: 0,
            title: self.title,
            status,
            priority,
            deps: self.deps,
            parent: self.parent,
        })
    }
}

// Every facade operation returns success or a typed error; the error kind
// travels with the message so clients can route it.
pub async fn handle(text: &str, app: &App) -> String {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(req) => req,
        Err(e) => {
            return encode(RpcResponse {
                id: Value::Null,
                result: None,
                error: Some(RpcError {
                    kind: ErrorKind::Validation,
                    message: format!("malformed request: {e}"),
                }),
            });
        }
    };

    let id = req.id.clone();
    let response = match dispatch(&req.op, req.params, app).await {
        Ok(result) => RpcResponse {
            id,
            result: Some(result),
            error: None,
        },
        Err(err) => RpcResponse {
            id,
            result: None,
            error: Some(RpcError {
                kind: err.kind(),
                message: err.to_string(),
            }),
        },
    };
    encode(response)
}

async fn dispatch(op: &str, params: Value, app: &App) -> Result<Value> {
    match op {
        "list_tasks" => to_value(app.list_tasks()?),
        "save_tasks" => {
            let tasks: Vec<Task> = decode(params)?;
            app.save_tasks(tasks)?;
            ok()
        }
        "update_task" => {
            let task: Task = decode(params)?;
            app.update_task(task)?;
            ok()
        }
        "add_task" => {
            let p: AddTaskParams = decode(params)?;
            to_value(app.add_task(p.into_task()?)?)
        }
        "delete_task" => {
            let p: IdParams = decode(params)?;
            app.delete_task(p.id)?;
            ok()
        }
        "move_task" => {
            let p: MoveParams = decode(params)?;
            let status = TaskStatus::parse(&p.status)?;
            app.move_task(p.id, status)?;
            ok()
        }
        "approve_task" => {
            let p: IdParams = decode(params)?;
            app.approve_task(p.id)?;
            ok()
        }
        "reject_task" => {
            let p: IdParams = decode(params)?;
            app.reject_task(p.id)?;
            ok()
        }
        "get_pool_status" => to_value(app.pool_status()?),
        "list_agent_runs" => to_value(app.list_agent_runs()?),
        "read_agent_log" => {
            let p: RunIdParams = decode(params)?;
            to_value(serde_json::json!({ "output": app.read_agent_log(&p.run_id)? }))
        }
        "read_plan" => to_value(serde_json::json!({ "content": app.read_plan()? })),
        "write_plan" => {
            let p: PlanParams = decode(params)?;
            app.write_plan(&p.content)?;
            ok()
        }
        "open_terminal" => to_value(serde_json::json!({ "session_id": app.terminals().open() })),
        "list_repositories" => to_value(app.list_repositories()),
        "active_repository" => to_value(app.active_repository()?),
        "switch_repository" => {
            let p: RepoIdParams = decode(params)?;
            to_value(app.switch_repository(&p.id)?)
        }
        "add_repository" => {
            let p: AddRepoParams = decode(params)?;
            to_value(app.add_repository(p.name.as_deref(), &p.path)?)
        }
        "remove_repository" => {
            let p: RepoIdParams = decode(params)?;
            app.remove_repository(&p.id)?;
            ok()
        }
        "validate_repository" => {
            let p: PathParams = decode(params)?;
            to_value(app.validate_repository(&p.path)?)
        }
        "find_repositories" => {
            let p: PathParams = decode(params)?;
            to_value(app.find_repositories(&p.path)?)
        }
        other => Err(AppError::Validation(format!("unknown operation: {other}"))),
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| AppError::Validation(format!("invalid params: {e}")))
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn ok() -> Result<Value> {
    Ok(serde_json::json!({ "ok": true }))
}

fn encode(response: RpcResponse) -> String {
    serde_json::to_string(&response).unwrap_or_else(|_| {
        r#"{"id":null,"error":{"kind":"internal","message":"response encoding failed"}}"#.to_owned()
    })
}
