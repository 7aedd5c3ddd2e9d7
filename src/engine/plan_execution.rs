//! Plan execution lifecycle. One plan execution binds a plan to one worker
//! and owns a stage execution per stage.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;

use super::{Engine, LOCK_PLAN};
use crate::state::{EntityKind, ExecutionState, StateMachine};
use crate::types::{PlanExecutionId, Result};

impl Engine {
    /// Create the evidence directory, move to RUNNING and arm every stage
    /// trigger on its own path.
    pub async fn start_plan_execution(&self, id: &PlanExecutionId) -> Result<()> {
        {
            let _guard = self.store().locks.lock(LOCK_PLAN, id).await;
            let execution = self.store().plan_executions.get(id).await?;
            StateMachine::for_kind(EntityKind::PlanExecution)
                .validate_state(execution.state, &[ExecutionState::Pending])?;

            let evidence_dir = self
                .config()
                .evidence_dir
                .join(format!("run_{}", execution.run_id))
                .join(format!("plan_{}", id));
            tokio::fs::create_dir_all(&evidence_dir).await?;
            self.store()
                .plan_executions
                .update(id, |execution| execution.evidence_dir = Some(evidence_dir))
                .await?;
            self.store()
                .plan_executions
                .transition(id, ExecutionState::Running)
                .await?;
        }
        tracing::info!(plan_execution_id = %id, "plan execution running");

        let arms: Vec<BoxFuture<'static, Result<()>>> = self
            .store()
            .stage_executions_of(id)
            .await?
            .into_iter()
            .map(|stage| self.boxed_arm_stage(stage.id))
            .collect();
        let failures = self.fan_out("arm_stage", arms).await;
        if failures > 0 {
            tracing::warn!(plan_execution_id = %id, failures, "some stages could not be armed");
        }
        self.plan_progress(id).await
    }

    /// RUNNING → PAUSING, pause every stage, then settle.
    pub async fn pause_plan_execution(&self, id: &PlanExecutionId) -> Result<()> {
        {
            let _guard = self.store().locks.lock(LOCK_PLAN, id).await;
            self.store()
                .plan_executions
                .transition_from(id, &[ExecutionState::Running], ExecutionState::Pausing)
                .await?;
        }
        tracing::info!(plan_execution_id = %id, "plan execution pausing");

        let pauses: Vec<BoxFuture<'static, Result<()>>> = self
            .store()
            .stage_executions_of(id)
            .await?
            .into_iter()
            .filter(|stage| !stage.state.is_terminal())
            .map(|stage| self.boxed_pause_stage(stage.id))
            .collect();
        self.fan_out("pause_stage", pauses).await;
        self.plan_progress(id).await
    }

    /// Back to RUNNING. Time spent PAUSED is added to the pause total so
    /// delta triggers shift accordingly.
    pub async fn resume_plan_execution(&self, id: &PlanExecutionId) -> Result<()> {
        {
            let _guard = self.store().locks.lock(LOCK_PLAN, id).await;
            let execution = self.store().plan_executions.get(id).await?;
            StateMachine::for_kind(EntityKind::PlanExecution)
                .validate_state(execution.state, &[ExecutionState::Paused, ExecutionState::Pausing])?;
            if execution.state == ExecutionState::Paused {
                if let Some(paused_at) = execution.times.pause_time {
                    let paused_ms = (Utc::now() - paused_at).num_milliseconds().max(0);
                    self.store()
                        .plan_executions
                        .update(id, |execution| execution.paused_total_ms += paused_ms)
                        .await?;
                }
            }
            self.store()
                .plan_executions
                .transition(id, ExecutionState::Running)
                .await?;
        }
        tracing::info!(plan_execution_id = %id, "plan execution resumed");

        let resumes: Vec<BoxFuture<'static, Result<()>>> = self
            .store()
            .stage_executions_of(id)
            .await?
            .into_iter()
            .filter(|stage| matches!(stage.state, ExecutionState::Paused | ExecutionState::Pausing))
            .map(|stage| self.boxed_resume_stage(stage.id))
            .collect();
        self.fan_out("resume_stage", resumes).await;
        self.plan_progress(id).await
    }

    /// Kill every non-terminal stage, then mark the plan execution
    /// TERMINATED whatever the children reported.
    pub async fn kill_plan_execution(&self, id: &PlanExecutionId) -> Result<()> {
        let run_id = {
            let _guard = self.store().locks.lock(LOCK_PLAN, id).await;
            let execution = self.store().plan_executions.get(id).await?;
            if execution.state == ExecutionState::Pending {
                StateMachine::for_kind(EntityKind::PlanExecution)
                    .validate_transition(execution.state, ExecutionState::Terminated)?;
            } else {
                self.store()
                    .plan_executions
                    .transition(id, ExecutionState::Terminating)
                    .await?;
            }
            execution.run_id
        };

        let kills: Vec<BoxFuture<'static, Result<()>>> = self
            .store()
            .stage_executions_of(id)
            .await?
            .into_iter()
            .filter(|stage| !stage.state.is_terminal())
            .map(|stage| self.boxed_kill_stage(stage.id))
            .collect();
        let failures = self.fan_out("kill_stage", kills).await;

        self.store()
            .plan_executions
            .transition(id, ExecutionState::Terminated)
            .await?;
        tracing::info!(plan_execution_id = %id, failures, "plan execution terminated");
        self.run_progress(&run_id).await
    }

    /// FINISHED once every stage execution is terminal; PAUSED once a
    /// pausing plan execution has no running or pausing stage. A plan
    /// execution without stages (a dynamic plan awaiting additions) keeps
    /// running.
    pub(crate) async fn plan_progress(&self, id: &PlanExecutionId) -> Result<()> {
        let run_id = {
            let _guard = self.store().locks.lock(LOCK_PLAN, id).await;
            let execution = self.store().plan_executions.get(id).await?;
            if !matches!(execution.state, ExecutionState::Running | ExecutionState::Pausing) {
                return Ok(());
            }
            let stages = self.store().stage_executions_of(id).await?;
            if !stages.is_empty() && stages.iter().all(|stage| stage.state.is_terminal()) {
                self.store()
                    .plan_executions
                    .transition(id, ExecutionState::Finished)
                    .await?;
                tracing::info!(plan_execution_id = %id, "plan execution finished");
            } else if execution.state == ExecutionState::Pausing
                && !stages
                    .iter()
                    .any(|stage| matches!(stage.state, ExecutionState::Running | ExecutionState::Pausing))
            {
                self.store()
                    .plan_executions
                    .transition(id, ExecutionState::Paused)
                    .await?;
                tracing::info!(plan_execution_id = %id, "plan execution paused");
            } else {
                return Ok(());
            }
            execution.run_id
        };
        self.run_progress(&run_id).await
    }

    pub(crate) fn boxed_start_plan_execution(&self, id: PlanExecutionId) -> BoxFuture<'static, Result<()>> {
        let engine = self.clone();
        async move { engine.start_plan_execution(&id).await }.boxed()
    }

    pub(crate) fn boxed_pause_plan_execution(&self, id: PlanExecutionId) -> BoxFuture<'static, Result<()>> {
        let engine = self.clone();
        async move { engine.pause_plan_execution(&id).await }.boxed()
    }

    pub(crate) fn boxed_resume_plan_execution(&self, id: PlanExecutionId) -> BoxFuture<'static, Result<()>> {
        let engine = self.clone();
        async move { engine.resume_plan_execution(&id).await }.boxed()
    }

    pub(crate) fn boxed_kill_plan_execution(&self, id: PlanExecutionId) -> BoxFuture<'static, Result<()>> {
        let engine = self.clone();
        async move { engine.kill_plan_execution(&id).await }.boxed()
    }
}
