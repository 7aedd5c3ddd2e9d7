//! Payload tasks.
//!
//! Each payload request becomes one task, registered under its correlation
//! id so a `kill_step_execution` can find it. The task's reply and its own
//! retirement leave through the action queue.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::actions::{Action, ActionQueue};
use super::modules::ProcessExecutor;
use crate::broker::Message;
use crate::rpc::{PayloadReply, PayloadRequest, ResultCode};
use crate::types::{CorrelationId, Error, Result};

#[derive(Debug)]
struct RunningTask {
    module: String,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Snapshot row of a running task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub correlation_id: CorrelationId,
    pub module: String,
    pub started_at: DateTime<Utc>,
}

/// Active tasks by correlation id.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<CorrelationId, RunningTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a task; returns its cancellation token.
    pub async fn register(&self, correlation_id: CorrelationId, module: &str) -> Result<CancellationToken> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&correlation_id) {
            return Err(Error::validation(format!("task {} already running", correlation_id)));
        }
        let cancel = CancellationToken::new();
        tasks.insert(
            correlation_id,
            RunningTask {
                module: module.to_string(),
                cancel: cancel.clone(),
                started_at: Utc::now(),
            },
        );
        Ok(cancel)
    }

    /// Cancel a running task. The task itself reports `stopped`.
    pub async fn kill(&self, correlation_id: &CorrelationId) -> Result<()> {
        let tasks = self.tasks.lock().await;
        let task = tasks
            .get(correlation_id)
            .ok_or_else(|| Error::not_found(format!("task {}", correlation_id)))?;
        task.cancel.cancel();
        tracing::info!(correlation_id = %correlation_id, module = %task.module, "task kill requested");
        Ok(())
    }

    pub async fn retire(&self, correlation_id: &CorrelationId) -> bool {
        self.tasks.lock().await.remove(correlation_id).is_some()
    }

    pub async fn list(&self) -> Vec<TaskInfo> {
        let mut listing: Vec<TaskInfo> = self
            .tasks
            .lock()
            .await
            .iter()
            .map(|(correlation_id, task)| TaskInfo {
                correlation_id: correlation_id.clone(),
                module: task.module.clone(),
                started_at: task.started_at,
            })
            .collect();
        listing.sort_by_key(|task| task.started_at);
        listing
    }

    pub async fn cancel_all(&self) {
        for task in self.tasks.lock().await.values() {
            task.cancel.cancel();
        }
    }
}

/// Run one payload request to completion.
pub async fn run_task(executor: &ProcessExecutor, tasks: &TaskRegistry, actions: &ActionQueue, message: Message) {
    let Some(correlation_id) = message.correlation_id.clone() else {
        tracing::warn!("payload request without correlation id dropped");
        return;
    };
    let request = match PayloadRequest::from_body(&message.body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(correlation_id = %correlation_id, error = %e, "malformed payload request");
            reply(actions, &message, PayloadReply::new(ResultCode::Error, e.to_string())).await;
            return;
        }
    };
    let cancel = match tasks.register(correlation_id.clone(), &request.module).await {
        Ok(cancel) => cancel,
        Err(e) => {
            tracing::warn!(correlation_id = %correlation_id, error = %e, "duplicate payload request dropped");
            return;
        }
    };

    if let Some(ack_queue) = &request.ack_queue {
        let ack = Message::new(json!({"correlation_id": correlation_id, "status": "accepted"}))
            .with_correlation(correlation_id.clone());
        actions
            .push(Action::Relay {
                queue: ack_queue.clone(),
                message: ack,
            })
            .await;
    }

    tracing::info!(correlation_id = %correlation_id, module = %request.module, "task started");
    let outcome = executor.run(&request.module, &request.arguments, cancel).await;
    tracing::info!(correlation_id = %correlation_id, result = %outcome.result, "task finished");

    reply(actions, &message, outcome).await;
    actions.push(Action::RetireTask { correlation_id }).await;
}

async fn reply(actions: &ActionQueue, request: &Message, outcome: PayloadReply) {
    let Some(reply_to) = request.reply_to.clone() else {
        return;
    };
    let body = match serde_json::to_value(&outcome) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode payload reply");
            return;
        }
    };
    let mut message = Message::new(body);
    if let Some(correlation_id) = request.correlation_id.clone() {
        message = message.with_correlation(correlation_id);
    }
    actions
        .push(Action::Relay {
            queue: reply_to,
            message,
        })
        .await;
}
