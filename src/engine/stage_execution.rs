//! Stage execution lifecycle: arming, the dependency-aware start path,
//! pause/resume, kill and finish detection.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use super::dependencies::dependencies_met;
use super::{Engine, LOCK_STAGE};
use crate::definition::{PlanModel, StageModel};
use crate::state::{EntityKind, ExecutionState, StateMachine};
use crate::store::{Filter, PlanExecutionRecord, StageExecutionRecord, WorkerRecord};
use crate::trigger::TriggerFired;
use crate::types::{Error, Result, StageExecutionId};

/// A stage execution with everything around it.
#[derive(Debug)]
pub(crate) struct StageScope {
    pub execution: StageExecutionRecord,
    pub plan_execution: PlanExecutionRecord,
    pub plan: PlanModel,
    pub worker: WorkerRecord,
}

impl StageScope {
    pub fn stage(&self) -> Result<&StageModel> {
        self.plan.stage(&self.execution.stage_id).ok_or_else(|| {
            Error::not_found(format!(
                "stage {} of stage execution {}",
                self.execution.stage_id, self.execution.id
            ))
        })
    }
}

const ACTIVE_STEP: [ExecutionState; 3] = [
    ExecutionState::Starting,
    ExecutionState::Running,
    ExecutionState::Terminating,
];

impl Engine {
    pub(crate) async fn stage_scope(&self, id: &StageExecutionId) -> Result<StageScope> {
        let execution = self.store().stage_executions.get(id).await?;
        let plan_execution = self.store().plan_executions.get(&execution.plan_execution_id).await?;
        let plan = self.plan_model(&plan_execution.plan_id).await?;
        let worker = self.store().workers.get(&plan_execution.worker_id).await?;
        Ok(StageScope {
            execution,
            plan_execution,
            plan,
            worker,
        })
    }

    async fn has_active_steps(&self, id: &StageExecutionId) -> Result<bool> {
        Ok(self
            .store()
            .step_executions_of(id)
            .await?
            .iter()
            .any(|step| ACTIVE_STEP.contains(&step.state)))
    }

    // =========================================================================
    // Arming and starting
    // =========================================================================

    /// Arm the stage's trigger. Immediate triggers go straight to the start
    /// path; time triggers leave the stage SCHEDULED, event triggers AWAITING.
    pub async fn arm_stage(&self, id: &StageExecutionId) -> Result<()> {
        let guard = self.store().locks.lock(LOCK_STAGE, id).await;
        let scope = self.stage_scope(id).await?;
        if scope.execution.state != ExecutionState::Pending {
            tracing::debug!(stage_execution_id = %id, state = %scope.execution.state, "stage already armed");
            return Ok(());
        }
        let stage = scope.stage()?;
        let ctx = self.trigger_context(&scope.execution, &scope.plan_execution, &scope.worker);

        let started = match stage.trigger.start(&ctx).await {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(stage_execution_id = %id, error = %e, "trigger could not be armed");
                self.store().stage_executions.transition(id, ExecutionState::Error).await?;
                drop(guard);
                self.plan_progress(&scope.plan_execution.id).await?;
                return Err(e);
            }
        };

        let Some(trigger_id) = started.trigger_id else {
            drop(guard);
            return self.start_stage(id, &[ExecutionState::Pending]).await;
        };

        self.store()
            .stage_executions
            .update(id, |execution| {
                execution.trigger_id = Some(trigger_id);
                execution.times.schedule_time = started.schedule_time;
            })
            .await?;
        let armed = if started.schedule_time.is_some() {
            ExecutionState::Scheduled
        } else {
            ExecutionState::Awaiting
        };
        self.store().stage_executions.transition(id, armed).await?;
        Ok(())
    }

    /// The dependency-aware start path. Proceeds only from a state in `from`:
    ///   - plan execution pausing or paused → PAUSED
    ///   - any dependency not FINISHED → WAITING
    ///   - otherwise → RUNNING, disarm the event trigger, dispatch the
    ///     PENDING initial steps
    pub async fn start_stage(&self, id: &StageExecutionId, from: &[ExecutionState]) -> Result<()> {
        let guard = self.store().locks.lock(LOCK_STAGE, id).await;
        let scope = self.stage_scope(id).await?;
        let current = scope.execution.state;
        if !from.contains(&current) {
            tracing::debug!(stage_execution_id = %id, state = %current, "stage start skipped");
            return Ok(());
        }

        if matches!(
            scope.plan_execution.state,
            ExecutionState::Pausing | ExecutionState::Paused
        ) {
            self.store()
                .stage_executions
                .update(id, |execution| execution.paused_from = Some(ExecutionState::Waiting))
                .await?;
            self.store().stage_executions.transition(id, ExecutionState::Paused).await?;
            tracing::info!(stage_execution_id = %id, "plan paused, stage held");
            return Ok(());
        }

        let stage = scope.stage()?;
        let siblings = self.store().stage_executions_of(&scope.plan_execution.id).await?;
        if !dependencies_met(stage, &siblings) {
            self.store().stage_executions.transition(id, ExecutionState::Waiting).await?;
            tracing::info!(stage_execution_id = %id, stage = %stage.name, "stage waiting on dependencies");
            return Ok(());
        }

        self.store().stage_executions.transition(id, ExecutionState::Running).await?;
        self.store()
            .stage_executions
            .update(id, |execution| execution.paused_from = None)
            .await?;
        drop(guard);
        tracing::info!(stage_execution_id = %id, stage = %stage.name, "stage running");

        if stage.trigger.is_event_based() {
            if let Some(trigger_id) = &scope.execution.trigger_id {
                let ctx = self.trigger_context(&scope.execution, &scope.plan_execution, &scope.worker);
                if let Err(e) = stage.trigger.stop(&ctx, trigger_id).await {
                    tracing::warn!(stage_execution_id = %id, error = %e, "event trigger not disarmed");
                }
            }
        }

        self.dispatch_initial_steps(id, stage).await?;
        self.stage_progress(id).await
    }

    async fn dispatch_initial_steps(&self, id: &StageExecutionId, stage: &StageModel) -> Result<()> {
        let executions = self.store().step_executions_of(id).await?;
        for step in stage.init_steps() {
            let Some(execution) = executions
                .iter()
                .find(|e| e.step_id == step.id && e.state == ExecutionState::Pending)
            else {
                continue;
            };
            if let Err(e) = self.execute_step(&execution.id, None).await {
                tracing::warn!(step_execution_id = %execution.id, error = %e, "initial step dispatch failed");
            }
        }
        Ok(())
    }

    /// A time trigger fired.
    pub async fn on_scheduled_stage(&self, id: &StageExecutionId) -> Result<()> {
        tracing::info!(stage_execution_id = %id, "time trigger fired");
        self.start_stage(id, &[ExecutionState::Scheduled]).await
    }

    /// An event trigger fired on a worker.
    pub async fn on_trigger_fired(&self, fired: TriggerFired) -> Result<()> {
        let matches = self
            .store()
            .stage_executions
            .filter(&Filter::new().field("trigger_id", fired.trigger_id.as_str()))
            .await?;
        let Some(execution) = matches.into_iter().next() else {
            tracing::warn!(trigger_id = %fired.trigger_id, "notification for unknown trigger dropped");
            return Ok(());
        };

        {
            let _guard = self.store().locks.lock(LOCK_STAGE, &execution.id).await;
            let current = self.store().stage_executions.get(&execution.id).await?;
            if current.state != ExecutionState::Awaiting {
                tracing::debug!(stage_execution_id = %execution.id, state = %current.state, "late trigger notification");
                return Ok(());
            }
            self.store()
                .stage_executions
                .update(&execution.id, |e| e.trigger_output = Some(Value::Object(fired.parameters)))
                .await?;
        }
        tracing::info!(stage_execution_id = %execution.id, trigger_id = %fired.trigger_id, "event trigger fired");
        self.start_stage(&execution.id, &[ExecutionState::Awaiting]).await
    }

    // =========================================================================
    // Pause / resume
    // =========================================================================

    /// Pause one stage execution:
    ///   - RUNNING → PAUSING while steps are in flight, else PAUSED
    ///   - SCHEDULED → PAUSED, the scheduler job is removed
    ///   - WAITING → PAUSED
    ///
    /// Other states are left alone.
    pub async fn pause_stage(&self, id: &StageExecutionId) -> Result<()> {
        let _guard = self.store().locks.lock(LOCK_STAGE, id).await;
        let scope = self.stage_scope(id).await?;
        let from = scope.execution.state;
        let active = from == ExecutionState::Running && self.has_active_steps(id).await?;
        let to = match from {
            ExecutionState::Running if active => ExecutionState::Pausing,
            ExecutionState::Running | ExecutionState::Waiting => ExecutionState::Paused,
            ExecutionState::Scheduled => {
                if let Some(trigger_id) = &scope.execution.trigger_id {
                    let ctx = self.trigger_context(&scope.execution, &scope.plan_execution, &scope.worker);
                    if let Err(e) = scope.stage()?.trigger.stop(&ctx, trigger_id).await {
                        tracing::warn!(stage_execution_id = %id, error = %e, "scheduled trigger not removed");
                    }
                }
                ExecutionState::Paused
            }
            _ => return Ok(()),
        };

        self.store()
            .stage_executions
            .update(id, |execution| {
                execution.paused_from = Some(from);
                if from == ExecutionState::Scheduled {
                    execution.trigger_id = None;
                }
            })
            .await?;
        self.store().stage_executions.transition(id, to).await?;
        tracing::info!(stage_execution_id = %id, %from, %to, "stage pausing");
        Ok(())
    }

    /// Resume a PAUSED or PAUSING stage the way it was left:
    ///   - it was running → RUNNING, dispatch what the pause held back
    ///   - it was scheduled → re-arm the trigger with the pause-adjusted time
    ///   - otherwise → the start path
    pub async fn resume_stage(&self, id: &StageExecutionId) -> Result<()> {
        let guard = self.store().locks.lock(LOCK_STAGE, id).await;
        let scope = self.stage_scope(id).await?;
        let state = scope.execution.state;
        if !matches!(state, ExecutionState::Paused | ExecutionState::Pausing) {
            return Ok(());
        }

        match scope.execution.paused_from {
            Some(ExecutionState::Running) | Some(ExecutionState::Pausing) => {
                self.store().stage_executions.transition(id, ExecutionState::Running).await?;
                self.store()
                    .stage_executions
                    .update(id, |execution| execution.paused_from = None)
                    .await?;
                drop(guard);
                tracing::info!(stage_execution_id = %id, "stage resumed");
                self.continue_stage(id).await
            }
            _ if state == ExecutionState::Pausing => {
                self.store().stage_executions.transition(id, ExecutionState::Running).await?;
                drop(guard);
                self.continue_stage(id).await
            }
            Some(ExecutionState::Scheduled) => {
                let stage = scope.stage()?;
                let ctx = self.trigger_context(&scope.execution, &scope.plan_execution, &scope.worker);
                let started = stage.trigger.start(&ctx).await?;
                self.store()
                    .stage_executions
                    .update(id, |execution| {
                        execution.trigger_id = started.trigger_id;
                        execution.times.schedule_time = started.schedule_time;
                        execution.paused_from = None;
                    })
                    .await?;
                self.store().stage_executions.transition(id, ExecutionState::Scheduled).await?;
                tracing::info!(stage_execution_id = %id, schedule_time = ?started.schedule_time, "stage rescheduled");
                Ok(())
            }
            _ => {
                drop(guard);
                self.start_stage(id, &[ExecutionState::Paused]).await
            }
        }
    }

    /// Dispatch PENDING initial steps and re-resolve successors of every
    /// finished step. Both are no-ops for work already done.
    async fn continue_stage(&self, id: &StageExecutionId) -> Result<()> {
        let scope = self.stage_scope(id).await?;
        let stage = scope.stage()?;
        self.dispatch_initial_steps(id, stage).await?;
        for step in self.store().step_executions_of(id).await? {
            if step.state == ExecutionState::Finished {
                self.execute_successors(&scope.execution, stage, &step).await?;
            }
        }
        self.stage_progress(id).await
    }

    // =========================================================================
    // Kill
    // =========================================================================

    /// Kill a stage execution and every non-terminal step of it. Fails when
    /// the stage itself cannot be terminated; failing steps are tolerated.
    pub async fn kill_stage(&self, id: &StageExecutionId) -> Result<()> {
        let (scope, direct) = {
            let _guard = self.store().locks.lock(LOCK_STAGE, id).await;
            let scope = self.stage_scope(id).await?;
            let direct = scope.execution.state == ExecutionState::Pending;
            let machine = StateMachine::for_kind(EntityKind::StageExecution);
            if direct {
                machine.validate_transition(scope.execution.state, ExecutionState::Terminated)?;
            } else {
                self.store()
                    .stage_executions
                    .transition(id, ExecutionState::Terminating)
                    .await?;
            }
            (scope, direct)
        };

        if matches!(
            scope.execution.state,
            ExecutionState::Scheduled | ExecutionState::Awaiting
        ) {
            if let Some(trigger_id) = &scope.execution.trigger_id {
                let ctx = self.trigger_context(&scope.execution, &scope.plan_execution, &scope.worker);
                if let Err(e) = scope.stage()?.trigger.stop(&ctx, trigger_id).await {
                    tracing::warn!(stage_execution_id = %id, error = %e, "trigger not disarmed on kill");
                }
            }
        }

        let tasks: Vec<BoxFuture<'static, Result<()>>> = self
            .store()
            .step_executions_of(id)
            .await?
            .into_iter()
            .filter(|step| !step.state.is_terminal())
            .map(|step| self.boxed_terminate_step(step.id))
            .collect();
        let failures = self.fan_out("kill_step", tasks).await;

        self.store()
            .stage_executions
            .transition(id, ExecutionState::Terminated)
            .await?;
        tracing::info!(stage_execution_id = %id, direct, failures, "stage terminated");
        Ok(())
    }

    // =========================================================================
    // Progress
    // =========================================================================

    /// Move a RUNNING/PAUSING stage forward once its steps allow it:
    /// FINISHED when every step is terminal, PAUSED when a pausing stage has
    /// nothing in flight. Then let the plan execution follow.
    pub(crate) async fn stage_progress(&self, id: &StageExecutionId) -> Result<()> {
        let finished = {
            let _guard = self.store().locks.lock(LOCK_STAGE, id).await;
            let execution = self.store().stage_executions.get(id).await?;
            if !matches!(execution.state, ExecutionState::Running | ExecutionState::Pausing) {
                return Ok(());
            }
            let steps = self.store().step_executions_of(id).await?;
            if steps.iter().all(|step| step.state.is_terminal()) {
                self.store().stage_executions.transition(id, ExecutionState::Finished).await?;
                tracing::info!(stage_execution_id = %id, "stage finished");
                Some(execution)
            } else if execution.state == ExecutionState::Pausing
                && !steps.iter().any(|step| ACTIVE_STEP.contains(&step.state))
            {
                self.store().stage_executions.transition(id, ExecutionState::Paused).await?;
                tracing::info!(stage_execution_id = %id, "stage paused");
                None
            } else {
                return Ok(());
            }
        };

        if let Some(execution) = finished {
            let plan_execution = self.store().plan_executions.get(&execution.plan_execution_id).await?;
            let plan = self.plan_model(&plan_execution.plan_id).await?;
            self.resolve_dependents(&execution, &plan).await?;
            return self.plan_progress(&execution.plan_execution_id).await;
        }
        let execution = self.store().stage_executions.get(id).await?;
        self.plan_progress(&execution.plan_execution_id).await
    }

    // =========================================================================
    // Boxed entry points for spawned paths
    // =========================================================================

    pub(crate) fn boxed_arm_stage(&self, id: StageExecutionId) -> BoxFuture<'static, Result<()>> {
        let engine = self.clone();
        async move { engine.arm_stage(&id).await }.boxed()
    }

    pub(crate) fn boxed_start_stage(
        &self,
        id: StageExecutionId,
        from: &'static [ExecutionState],
    ) -> BoxFuture<'static, Result<()>> {
        let engine = self.clone();
        async move { engine.start_stage(&id, from).await }.boxed()
    }

    pub(crate) fn boxed_pause_stage(&self, id: StageExecutionId) -> BoxFuture<'static, Result<()>> {
        let engine = self.clone();
        async move { engine.pause_stage(&id).await }.boxed()
    }

    pub(crate) fn boxed_resume_stage(&self, id: StageExecutionId) -> BoxFuture<'static, Result<()>> {
        let engine = self.clone();
        async move { engine.resume_stage(&id).await }.boxed()
    }

    pub(crate) fn boxed_kill_stage(&self, id: StageExecutionId) -> BoxFuture<'static, Result<()>> {
        let engine = self.clone();
        async move { engine.kill_stage(&id).await }.boxed()
    }
}
