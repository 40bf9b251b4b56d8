#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Todo,
    Doing,
    PendingReview,
    Done,
}

impl TaskStatus {
    pub const ALL: [Self; 5] = [
        Self::Backlog,
        Self::Todo,
        Self::Doing,
        Self::PendingReview,
        Self::Done,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Todo => "todo",
            Self::Doing => "doing",
            Self::PendingReview => "pending_review",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| AppError::InvalidStatus(s.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl TaskPriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(AppError::InvalidPriority(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: u64,
    pub title: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    #[serde(default)]
    pub deps: Vec<u64>,
    #[serde(default)]
    pub parent: Option<u64>,
}

// Checked before every write: titles, unique ids, referential integrity of
// deps/parent, and an acyclic parent chain.
pub fn validate_tasks(tasks: &[Task]) -> Result<()> {
    let mut ids = BTreeSet::new();
    for task in tasks {
        if task.title.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "task {} has an empty title",
                task.id
            )));
        }
        if !ids.insert(task.id) {
            return Err(AppError::Validation(format!(
                "duplicate task id {}",
                task.id
            )));
        }
    }

    for task in tasks {
        for dep in &task.deps {
            if !ids.contains(dep) {
                return Err(AppError::Validation(format!(
                    "task {} depends on unknown task {dep}",
                    task.id
                )));
            }
        }
        if let Some(parent) = task.parent {
            if !ids.contains(&parent) {
                return Err(AppError::Validation(format!(
                    "task {} references unknown parent {parent}",
                    task.id
                )));
            }
            if parent == task.id {
                return Err(AppError::Validation(format!(
                    "task {} is its own parent",
                    task.id
                )));
            }
        }
    }

    check_parent_cycles(tasks)
}

fn check_parent_cycles(tasks: &[Task]) -> Result<()> {
    for task in tasks {
        let mut seen = BTreeSet::new();
        seen.insert(task.id);
        let mut cur = task.parent;
        while let Some(id) = cur {
            if !seen.insert(id) {
                return Err(AppError::Validation(format!(
                    "parent cycle involving task {id}"
                )));
            }
            cur = tasks.iter().find(|t| t.id == id).and_then(|t| t.parent);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u64) -> Task {
        Task {
            id,
            title: format!("task {id}"),
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            deps: Vec::new(),
            parent: None,
        }
    }

    #[test]
    fn serializes_with_task_file_field_names() {
        let t = Task {
            id: 1,
            title: "T".to_owned(),
            status: TaskStatus::PendingReview,
            priority: TaskPriority::High,
            deps: vec![2],
            parent: None,
        };
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 1,
                "title": "T",
                "status": "pending_review",
                "priority": "high",
                "deps": [2],
                "parent": null,
            })
        );
    }

    #[test]
    fn deserializes_minimal_records() {
        let t: Task = serde_json::from_str(
            r#"{"id":3,"title":"x","status":"backlog","priority":"low"}"#,
        )
        .unwrap();
        assert!(t.deps.is_empty());
        assert_eq!(t.parent, None);
    }

    #[test]
    fn status_round_trips_through_parse() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TaskStatus::parse("in_progress").is_err());
        assert!(TaskPriority::parse("urgent").is_err());
    }

    #[test]
    fn rejects_empty_title_and_duplicate_ids() {
        let mut a = task(1);
        a.title = "  ".to_owned();
        assert!(validate_tasks(&[a]).is_err());

        assert!(validate_tasks(&[task(1), task(1)]).is_err());
    }

    #[test]
    fn rejects_dangling_references() {
        let mut a = task(1);
        a.deps = vec![9];
        assert!(validate_tasks(&[a]).is_err());

        let mut b = task(2);
        b.parent = Some(9);
        assert!(validate_tasks(&[b]).is_err());
    }

    #[test]
    fn rejects_parent_cycles() {
        let mut a = task(1);
        let mut b = task(2);
        a.parent = Some(2);
        b.parent = Some(1);
        assert!(validate_tasks(&[a.clone(), b]).is_err());

        let mut solo = task(3);
        solo.parent = Some(3);
        assert!(validate_tasks(&[solo]).is_err());

        // A legal chain still passes.
        let mut c = task(2);
        c.parent = Some(3);
        a.parent = Some(2);
        assert!(validate_tasks(&[a, c, task(3)]).is_ok());
    }
}
