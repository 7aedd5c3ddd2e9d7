//! Step execution lifecycle: dispatch, replies, the reply watchdog and kill.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::arguments::{self, ResolveContext, CREATE_NAMED_SESSION, SESSION_ID};
use super::{Engine, LOCK_STEP};
use crate::broker::Message;
use crate::rpc::{events, worker_control_queue, worker_payload_queue, EventMessage, PayloadReply, PayloadRequest};
use crate::state::{EntityKind, ExecutionState, StateMachine};
use crate::store::{Filter, PendingCorrelation, SessionRecord, StepExecutionRecord};
use crate::types::{CorrelationId, Error, Result, StepExecutionId, StepId};

/// Output a finished step exposes to its successors and the stage.
fn exposed_output(record: &StepExecutionRecord) -> Value {
    match &record.serialized_output {
        Some(value) if !value.is_null() => value.clone(),
        _ => record.output.clone().map(Value::String).unwrap_or(Value::Null),
    }
}

impl Engine {
    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Claim a PENDING step execution and dispatch it to the bound worker.
    /// Returns `false` when the step was no longer PENDING. A dispatch
    /// failure moves the step to ERROR and prunes its branch.
    pub async fn execute_step(&self, id: &StepExecutionId, parent: Option<StepExecutionId>) -> Result<bool> {
        let guard = self.store().locks.lock(LOCK_STEP, id).await;
        let execution = self.store().step_executions.get(id).await?;
        if execution.state != ExecutionState::Pending {
            return Ok(false);
        }
        if parent.is_some() {
            self.store()
                .step_executions
                .update(id, |execution| execution.parent_id = parent)
                .await?;
        }
        let claimed = self
            .store()
            .step_executions
            .compare_and_set_state(id, ExecutionState::Pending, ExecutionState::Starting)
            .await?;
        if !claimed {
            return Ok(false);
        }

        let dispatched = self.dispatch_step(id).await;
        drop(guard);
        match dispatched {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::error!(step_execution_id = %id, error = %e, "step dispatch failed");
                self.fail_step(id).await?;
                Err(e)
            }
        }
    }

    /// Resolve arguments, register the correlation, publish, arm the
    /// watchdog. Runs under the step lock.
    async fn dispatch_step(&self, id: &StepExecutionId) -> Result<()> {
        let execution = self.store().step_executions.get(id).await?;
        let scope = self.stage_scope(&execution.stage_execution_id).await?;
        let stage = scope.stage()?;
        let step = stage
            .step(&execution.step_id)
            .ok_or_else(|| Error::not_found(format!("step {} of step execution {}", execution.step_id, id)))?;

        let variables: HashMap<String, Value> = self
            .store()
            .variables
            .filter(&Filter::new().field("plan_execution_id", &scope.plan_execution.id))
            .await?
            .into_iter()
            .map(|variable| (variable.name, variable.value))
            .collect();
        let sessions: HashMap<String, Value> = self
            .store()
            .sessions
            .filter(&Filter::new().field("plan_execution_id", &scope.plan_execution.id))
            .await?
            .into_iter()
            .map(|session| (session.name, session.session_id))
            .collect();
        let parent_output = match &execution.parent_id {
            Some(parent_id) => Some(exposed_output(&self.store().step_executions.get(parent_id).await?)),
            None => None,
        };
        let ctx = ResolveContext {
            variables,
            parent_output,
            trigger_output: scope.execution.trigger_output.as_ref(),
            step_outputs: Some(&scope.execution.output),
            sessions,
        };
        let resolved = arguments::resolve(&step.arguments, &ctx)?;

        let correlation_id = CorrelationId::new();
        self.correlations()
            .register(correlation_id.clone(), id.clone(), scope.worker.id.clone())
            .await?;
        self.store()
            .step_executions
            .update(id, |execution| {
                execution.arguments = Some(resolved.clone());
                execution.correlation_id = Some(correlation_id.clone());
            })
            .await?;

        let request = PayloadRequest {
            module: step.module.clone(),
            arguments: resolved,
            ack_queue: None,
        };
        let message = Message::new(serde_json::to_value(&request)?)
            .with_correlation(correlation_id.clone())
            .with_reply_to(self.config().payload_response_queue.clone());
        if let Err(e) = self
            .rpc()
            .send(&worker_payload_queue(&scope.worker.name), message)
            .await
        {
            self.correlations().complete(&correlation_id).await?;
            return Err(e);
        }

        self.store().step_executions.transition(id, ExecutionState::Running).await?;
        self.arm_watchdog(id, correlation_id.clone()).await;
        tracing::info!(
            step_execution_id = %id,
            step = %step.name,
            module = %step.module,
            worker = %scope.worker.name,
            correlation_id = %correlation_id,
            "step dispatched"
        );
        Ok(())
    }

    async fn arm_watchdog(&self, id: &StepExecutionId, correlation_id: CorrelationId) {
        let engine = self.clone();
        let step_execution_id = id.clone();
        let timeout = self.config().step_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Err(e) = engine.step_timed_out(&step_execution_id, &correlation_id).await {
                tracing::warn!(step_execution_id = %step_execution_id, error = %e, "timeout handling failed");
            }
        });
        if let Some(previous) = self.inner.watchdogs.lock().await.insert(id.clone(), handle) {
            previous.abort();
        }
    }

    async fn disarm_watchdog(&self, id: &StepExecutionId) {
        if let Some(handle) = self.inner.watchdogs.lock().await.remove(id) {
            handle.abort();
        }
    }

    /// No reply before the deadline: ERROR and prune.
    async fn step_timed_out(&self, id: &StepExecutionId, correlation_id: &CorrelationId) -> Result<()> {
        {
            let _guard = self.store().locks.lock(LOCK_STEP, id).await;
            let execution = self.store().step_executions.get(id).await?;
            if execution.state != ExecutionState::Running
                || execution.correlation_id.as_ref() != Some(correlation_id)
            {
                return Ok(());
            }
            self.store().step_executions.transition(id, ExecutionState::Error).await?;
            // Our own handle; dropping it leaves this task running.
            self.inner.watchdogs.lock().await.remove(id);
            self.correlations().complete(correlation_id).await?;
        }
        let error = Error::rpc_timeout(format!("no reply within {:?}", self.config().step_timeout));
        tracing::error!(step_execution_id = %id, %error, "step timed out");
        self.prune_after(id).await
    }

    async fn fail_step(&self, id: &StepExecutionId) -> Result<()> {
        {
            let _guard = self.store().locks.lock(LOCK_STEP, id).await;
            let execution = self.store().step_executions.get(id).await?;
            if execution.state.is_terminal() {
                return Ok(());
            }
            self.store().step_executions.transition(id, ExecutionState::Error).await?;
        }
        self.prune_after(id).await
    }

    /// Ignore what the step can no longer reach, then check the stage.
    async fn prune_after(&self, id: &StepExecutionId) -> Result<()> {
        let execution = self.store().step_executions.get(id).await?;
        let scope = self.stage_scope(&execution.stage_execution_id).await?;
        let stage = scope.stage()?;
        let children: Vec<(StepId, Option<StepId>)> = stage
            .graph
            .children(&execution.step_id)
            .iter()
            .map(|child| (child.clone(), Some(execution.step_id.clone())))
            .collect();
        if !children.is_empty() {
            self.ignore_branch(&scope.execution.id, stage, children).await?;
        }
        self.stage_progress(&scope.execution.id).await
    }

    // =========================================================================
    // Replies
    // =========================================================================

    /// Apply a worker's reply to the step execution it was correlated with.
    /// Any result code finishes a RUNNING step; a TERMINATING step becomes
    /// TERMINATED. Late or duplicate replies are dropped.
    pub async fn handle_reply(&self, pending: PendingCorrelation, reply: PayloadReply) -> Result<()> {
        let id = pending.step_execution_id.clone();
        let settled = {
            let _guard = self.store().locks.lock(LOCK_STEP, &id).await;
            self.disarm_watchdog(&id).await;
            self.correlations().complete(&pending.id).await?;

            let execution = self.store().step_executions.get(&id).await?;
            if execution.correlation_id.as_ref() != Some(&pending.id) {
                tracing::warn!(step_execution_id = %id, correlation_id = %pending.id, "stale reply dropped");
                return Ok(());
            }
            let to = match execution.state {
                ExecutionState::Running => ExecutionState::Finished,
                ExecutionState::Terminating => ExecutionState::Terminated,
                state => {
                    tracing::warn!(step_execution_id = %id, %state, "reply for settled step dropped");
                    return Ok(());
                }
            };
            let serialized_output = (!reply.serialized_output.is_null()).then_some(reply.serialized_output);
            self.store()
                .step_executions
                .update(&id, |execution| {
                    execution.result = Some(reply.result);
                    execution.output = Some(reply.output);
                    execution.serialized_output = serialized_output;
                })
                .await?;
            self.store().step_executions.transition(&id, to).await?;
            self.store().step_executions.get(&id).await?
        };
        tracing::info!(
            step_execution_id = %id,
            result = ?settled.result,
            state = %settled.state,
            "step settled"
        );

        let scope = self.stage_scope(&settled.stage_execution_id).await?;
        let stage = scope.stage()?;
        self.record_named_session(&settled, &scope.plan_execution.id).await?;
        if let Some(step) = stage.step(&settled.step_id) {
            let output = exposed_output(&settled);
            let name = step.name.clone();
            self.store()
                .stage_executions
                .update(&scope.execution.id, |execution| {
                    execution.output.insert(name, output);
                })
                .await?;
        }

        if settled.state == ExecutionState::Finished {
            let stage_execution = self.store().stage_executions.get(&scope.execution.id).await?;
            if stage_execution.state == ExecutionState::Running {
                self.execute_successors(&stage_execution, stage, &settled).await?;
            }
            return self.stage_progress(&scope.execution.id).await;
        }
        self.prune_after(&id).await
    }

    async fn record_named_session(
        &self,
        settled: &StepExecutionRecord,
        plan_execution_id: &crate::types::PlanExecutionId,
    ) -> Result<()> {
        let Some(name) = settled
            .arguments
            .as_ref()
            .and_then(|arguments| arguments.get(CREATE_NAMED_SESSION))
            .and_then(Value::as_str)
        else {
            return Ok(());
        };
        let Some(session_id) = settled
            .serialized_output
            .as_ref()
            .and_then(|output| output.get(SESSION_ID))
        else {
            tracing::warn!(step_execution_id = %settled.id, session = name, "no session in output");
            return Ok(());
        };
        self.store()
            .sessions
            .create(SessionRecord {
                plan_execution_id: plan_execution_id.clone(),
                name: name.to_string(),
                session_id: session_id.clone(),
                ..Default::default()
            })
            .await?;
        tracing::info!(step_execution_id = %settled.id, session = name, "named session stored");
        Ok(())
    }

    // =========================================================================
    // Kill
    // =========================================================================

    /// Kill one step execution, prune its branch and check the stage.
    pub async fn kill_step(&self, id: &StepExecutionId) -> Result<()> {
        self.terminate_step(id).await?;
        self.prune_after(id).await
    }

    /// Terminate a step without touching the rest of the stage:
    ///   - PENDING → TERMINATED
    ///   - STARTING/RUNNING → TERMINATING, ask the worker to stop the task,
    ///     → TERMINATED (even when the worker cannot be reached)
    ///
    /// An already TERMINATED step is fine; other terminal states fail.
    pub(crate) async fn terminate_step(&self, id: &StepExecutionId) -> Result<()> {
        let execution = {
            let _guard = self.store().locks.lock(LOCK_STEP, id).await;
            let execution = self.store().step_executions.get(id).await?;
            match execution.state {
                ExecutionState::Pending => {
                    self.store().step_executions.transition(id, ExecutionState::Terminated).await?;
                    tracing::info!(step_execution_id = %id, "pending step terminated");
                    return Ok(());
                }
                ExecutionState::Starting | ExecutionState::Running => {
                    self.store()
                        .step_executions
                        .transition(id, ExecutionState::Terminating)
                        .await?;
                    execution
                }
                ExecutionState::Terminating => return Ok(()),
                state => {
                    StateMachine::for_kind(EntityKind::StepExecution)
                        .validate_transition(state, ExecutionState::Terminated)?;
                    return Ok(());
                }
            }
        };
        self.disarm_watchdog(id).await;

        if let Some(correlation_id) = &execution.correlation_id {
            let scope = self.stage_scope(&execution.stage_execution_id).await?;
            let event = EventMessage::new(
                events::KILL_STEP_EXECUTION,
                json!({"correlation_id": correlation_id}),
            );
            if let Err(e) = self
                .rpc()
                .call_control(
                    &worker_control_queue(&scope.worker.name),
                    &event,
                    self.config().rpc_timeout,
                    Error::internal,
                )
                .await
            {
                tracing::warn!(step_execution_id = %id, worker = %scope.worker.name, error = %e, "worker kill failed");
            }
        }

        let _guard = self.store().locks.lock(LOCK_STEP, id).await;
        let current = self.store().step_executions.get(id).await?;
        if current.state == ExecutionState::Terminating {
            self.store().step_executions.transition(id, ExecutionState::Terminated).await?;
        }
        if let Some(correlation_id) = &current.correlation_id {
            self.correlations().complete(correlation_id).await?;
        }
        tracing::info!(step_execution_id = %id, state = %current.state, "step terminated");
        Ok(())
    }

    pub(crate) fn boxed_terminate_step(&self, id: StepExecutionId) -> BoxFuture<'static, Result<()>> {
        let engine = self.clone();
        async move { engine.terminate_step(&id).await }.boxed()
    }
}
