#![forbid(unsafe_code)]

use std::sync::Arc;

use futures_util::FutureExt as _;
use tracing::{error, info};

use crate::agent::AgentSpawner;
use crate::error::Result;
use crate::store::TaskStore;
use crate::store::model::TaskStatus;

// Observes status changes and dispatches their side effects. The status
// write is durable before any side effect starts; a failed or crashed side
// effect never reverts it, which is how a stuck `doing` task surfaces.
#[derive(Debug)]
pub struct TransitionEngine {
    store: Arc<TaskStore>,
    spawner: Arc<AgentSpawner>,
}

impl TransitionEngine {
    #[must_use]
    pub fn new(store: Arc<TaskStore>, spawner: Arc<AgentSpawner>) -> Self {
        Self { store, spawner }
    }

    // Facade path: persist, then fire and forget. Only todo -> doing has a
    // side effect here; approve/reject run through the review subsystem.
    pub fn move_task(&self, id: u64, new_status: TaskStatus) -> Result<()> {
        let old = self.store.move_status(id, new_status)?;
        if Self::spawns_agent(old, new_status) {
            let task = self.store.get(id)?;
            let spawner = Arc::clone(&self.spawner);
            tokio::spawn(async move {
                let launch = std::panic::AssertUnwindSafe(spawner.launch(&task))
                    .catch_unwind()
                    .await;
                match launch {
                    Ok(Ok(receipt)) => {
                        info!(
                            task_id = receipt.task_id,
                            workspace = %receipt.workspace,
                            "agent run finished"
                        );
                    }
                    Ok(Err(err)) => {
                        error!(task_id = id, kind = ?err.kind(), "agent launch failed: {err}");
                    }
                    Err(_) => {
                        error!(task_id = id, "agent launch panicked");
                    }
                }
            });
        }
        Ok(())
    }

    // One-shot callers (the CLI) have no process lifetime to lean on, so
    // they wait for the launch instead of detaching it.
    pub async fn move_task_foreground(&self, id: u64, new_status: TaskStatus) -> Result<()> {
        let old = self.store.move_status(id, new_status)?;
        if Self::spawns_agent(old, new_status) {
            let task = self.store.get(id)?;
            let receipt = self.spawner.launch(&task).await?;
            info!(
                task_id = receipt.task_id,
                workspace = %receipt.workspace,
                "agent run finished"
            );
        }
        Ok(())
    }

    fn spawns_agent(old: TaskStatus, new: TaskStatus) -> bool {
        old == TaskStatus::Todo && new == TaskStatus::Doing
    }
}
