//! Runs: one plan executed on one or more workers.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::{Engine, LOCK_PLAN, LOCK_RUN};
use crate::rpc::{events, EventMessage, JobSpec};
use crate::state::{EntityKind, ExecutionState, StateMachine};
use crate::store::{ExecutionVariableRecord, Filter, PlanExecutionRecord, RunRecord, WorkerState};
use crate::types::{Error, JobId, PlanExecutionId, PlanId, Result, RunId, WorkerId};

impl Engine {
    // =========================================================================
    // Creation and scheduling
    // =========================================================================

    /// Create a PENDING run with one plan execution per worker. Every stage
    /// and step execution is created up front.
    pub async fn create_run(&self, plan_id: &PlanId, worker_ids: &[WorkerId]) -> Result<RunRecord> {
        if worker_ids.is_empty() {
            return Err(Error::validation("a run needs at least one worker"));
        }
        let plan = self.store().plans.get(plan_id).await?;
        for (i, worker_id) in worker_ids.iter().enumerate() {
            self.store().workers.get(worker_id).await?;
            if worker_ids[..i].contains(worker_id) {
                return Err(Error::validation(format!("worker {} bound twice", worker_id)));
            }
        }

        let run = self
            .store()
            .runs
            .create(RunRecord {
                plan_id: plan_id.clone(),
                worker_ids: worker_ids.to_vec(),
                ..Default::default()
            })
            .await?;
        for worker_id in worker_ids {
            let plan_execution = self
                .store()
                .plan_executions
                .create(PlanExecutionRecord {
                    run_id: run.id.clone(),
                    plan_id: plan_id.clone(),
                    worker_id: worker_id.clone(),
                    ..Default::default()
                })
                .await?;
            for stage in &plan.model.stages {
                self.create_stage_execution(&plan_execution.id, stage).await?;
            }
        }
        tracing::info!(run_id = %run.id, plan = %plan.name, workers = worker_ids.len(), "run created");
        Ok(run)
    }

    /// Have the scheduler start the run at `at`.
    pub async fn schedule_run(&self, id: &RunId, at: DateTime<Utc>) -> Result<RunRecord> {
        let _guard = self.store().locks.lock(LOCK_RUN, id).await;
        let run = self.store().runs.get(id).await?;
        StateMachine::for_kind(EntityKind::Run).validate_state(run.state, &[ExecutionState::Pending])?;

        let event = EventMessage::new(events::SCHEDULED_RUN, json!({"run_id": id}));
        let job_id = self
            .scheduler()
            .add_job(JobSpec::once(at, self.config().event_queue.clone(), event.to_body()?))
            .await?;
        self.store()
            .runs
            .update(id, |run| {
                run.trigger_id = Some(job_id.to_string());
                run.times.schedule_time = Some(at);
            })
            .await?;
        self.store().runs.transition(id, ExecutionState::Scheduled).await?;
        tracing::info!(run_id = %id, job_id = %job_id, %at, "run scheduled");
        self.store().runs.get(id).await
    }

    /// Cancel the scheduled start; the run goes back to PENDING.
    pub async fn unschedule_run(&self, id: &RunId) -> Result<RunRecord> {
        let _guard = self.store().locks.lock(LOCK_RUN, id).await;
        let run = self.store().runs.get(id).await?;
        StateMachine::for_kind(EntityKind::Run).validate_state(run.state, &[ExecutionState::Scheduled])?;
        if let Some(job_id) = &run.trigger_id {
            self.scheduler().remove_job(&parse_job_id(job_id)?).await?;
        }
        self.store().runs.update(id, |run| run.trigger_id = None).await?;
        self.store().runs.transition(id, ExecutionState::Pending).await?;
        tracing::info!(run_id = %id, "run unscheduled");
        self.store().runs.get(id).await
    }

    pub async fn reschedule_run(&self, id: &RunId, at: DateTime<Utc>) -> Result<RunRecord> {
        let _guard = self.store().locks.lock(LOCK_RUN, id).await;
        let run = self.store().runs.get(id).await?;
        StateMachine::for_kind(EntityKind::Run).validate_state(run.state, &[ExecutionState::Scheduled])?;
        let Some(job_id) = &run.trigger_id else {
            return Err(Error::invalid_state(format!("run {} has no scheduler job", id)));
        };
        self.scheduler().reschedule_job(&parse_job_id(job_id)?, at).await?;
        tracing::info!(run_id = %id, %at, "run rescheduled");
        self.store()
            .runs
            .update(id, |run| run.times.schedule_time = Some(at))
            .await
    }

    /// The scheduler fired. A start failure leaves the run PENDING.
    pub async fn on_scheduled_run(&self, id: &RunId) -> Result<()> {
        {
            let _guard = self.store().locks.lock(LOCK_RUN, id).await;
            let run = self.store().runs.get(id).await?;
            if run.state != ExecutionState::Scheduled {
                tracing::debug!(run_id = %id, state = %run.state, "scheduled start skipped");
                return Ok(());
            }
            self.store().runs.update(id, |run| run.trigger_id = None).await?;
        }
        if let Err(e) = self.start_run(id).await {
            tracing::error!(run_id = %id, error = %e, "scheduled run failed to start");
            self.store()
                .runs
                .transition_from(id, &[ExecutionState::Scheduled], ExecutionState::Pending)
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Check every bound worker and every module, then start all plan
    /// executions. Nothing starts when a worker is down or a module is
    /// missing.
    pub async fn start_run(&self, id: &RunId) -> Result<()> {
        let run = self.store().runs.get(id).await?;
        let machine = StateMachine::for_kind(EntityKind::Run);
        machine.validate_state(run.state, &[ExecutionState::Pending, ExecutionState::Scheduled])?;

        for worker_id in &run.worker_ids {
            if self.healthcheck_worker(worker_id).await? == WorkerState::Down {
                let worker = self.store().workers.get(worker_id).await?;
                return Err(Error::invalid_state(format!("worker '{}' is down", worker.name)));
            }
        }
        self.validate_run_modules(&run).await?;

        {
            let _guard = self.store().locks.lock(LOCK_RUN, id).await;
            let run = self.store().runs.get(id).await?;
            if let (ExecutionState::Scheduled, Some(job_id)) = (run.state, &run.trigger_id) {
                if let Err(e) = self.scheduler().remove_job(&parse_job_id(job_id)?).await {
                    tracing::warn!(run_id = %id, error = %e, "scheduler job not removed");
                }
            }
            self.store()
                .runs
                .transition_from(
                    id,
                    &[ExecutionState::Pending, ExecutionState::Scheduled],
                    ExecutionState::Running,
                )
                .await?;
        }
        tracing::info!(run_id = %id, "run running");

        let starts: Vec<BoxFuture<'static, Result<()>>> = self
            .plan_executions_of_run(id)
            .await?
            .into_iter()
            .map(|execution| self.boxed_start_plan_execution(execution.id))
            .collect();
        self.fan_out("start_plan_execution", starts).await;
        self.run_progress(id).await
    }

    /// Ask each worker about each module of the plan, record the answer on
    /// the step executions, and fail listing everything invalid.
    async fn validate_run_modules(&self, run: &RunRecord) -> Result<()> {
        let plan = self.plan_model(&run.plan_id).await?;
        let mut invalid = Vec::new();
        for plan_execution in self.plan_executions_of_run(&run.id).await? {
            let worker = self.store().workers.get(&plan_execution.worker_id).await?;
            let mut verdicts: HashMap<String, bool> = HashMap::new();
            for stage_execution in self.store().stage_executions_of(&plan_execution.id).await? {
                let Some(stage) = plan.stage(&stage_execution.stage_id) else {
                    continue;
                };
                for step_execution in self.store().step_executions_of(&stage_execution.id).await? {
                    let Some(step) = stage.step(&step_execution.step_id) else {
                        continue;
                    };
                    let valid = match verdicts.get(&step.module) {
                        Some(valid) => *valid,
                        None => {
                            let valid = self.validate_module(&worker, &step.module).await?;
                            verdicts.insert(step.module.clone(), valid);
                            valid
                        }
                    };
                    self.store()
                        .step_executions
                        .update(&step_execution.id, |execution| execution.valid = Some(valid))
                        .await?;
                    if !valid {
                        invalid.push(format!("{}/{} ({} on {})", stage.name, step.name, step.module, worker.name));
                    }
                }
            }
        }
        if invalid.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(format!("invalid modules: {}", invalid.join(", "))))
        }
    }

    pub async fn pause_run(&self, id: &RunId) -> Result<()> {
        {
            let _guard = self.store().locks.lock(LOCK_RUN, id).await;
            self.store()
                .runs
                .transition_from(id, &[ExecutionState::Running], ExecutionState::Pausing)
                .await?;
        }
        tracing::info!(run_id = %id, "run pausing");
        let pauses: Vec<BoxFuture<'static, Result<()>>> = self
            .plan_executions_of_run(id)
            .await?
            .into_iter()
            .filter(|execution| execution.state == ExecutionState::Running)
            .map(|execution| self.boxed_pause_plan_execution(execution.id))
            .collect();
        self.fan_out("pause_plan_execution", pauses).await;
        self.run_progress(id).await
    }

    pub async fn resume_run(&self, id: &RunId) -> Result<()> {
        {
            let _guard = self.store().locks.lock(LOCK_RUN, id).await;
            self.store()
                .runs
                .transition_from(
                    id,
                    &[ExecutionState::Paused, ExecutionState::Pausing],
                    ExecutionState::Running,
                )
                .await?;
        }
        tracing::info!(run_id = %id, "run resumed");
        let resumes: Vec<BoxFuture<'static, Result<()>>> = self
            .plan_executions_of_run(id)
            .await?
            .into_iter()
            .filter(|execution| matches!(execution.state, ExecutionState::Paused | ExecutionState::Pausing))
            .map(|execution| self.boxed_resume_plan_execution(execution.id))
            .collect();
        self.fan_out("resume_plan_execution", resumes).await;
        self.run_progress(id).await
    }

    /// Kill every non-terminal plan execution, then mark the run
    /// TERMINATED. A scheduled run loses its scheduler job first.
    pub async fn kill_run(&self, id: &RunId) -> Result<()> {
        {
            let _guard = self.store().locks.lock(LOCK_RUN, id).await;
            let run = self.store().runs.get(id).await?;
            match run.state {
                ExecutionState::Pending => {}
                ExecutionState::Scheduled => {
                    if let Some(job_id) = &run.trigger_id {
                        if let Err(e) = self.scheduler().remove_job(&parse_job_id(job_id)?).await {
                            tracing::warn!(run_id = %id, error = %e, "scheduler job not removed");
                        }
                    }
                }
                _ => {
                    self.store().runs.transition(id, ExecutionState::Terminating).await?;
                }
            }
        }

        let kills: Vec<BoxFuture<'static, Result<()>>> = self
            .plan_executions_of_run(id)
            .await?
            .into_iter()
            .filter(|execution| !execution.state.is_terminal())
            .map(|execution| self.boxed_kill_plan_execution(execution.id))
            .collect();
        let failures = self.fan_out("kill_plan_execution", kills).await;

        self.store().runs.transition(id, ExecutionState::Terminated).await?;
        tracing::info!(run_id = %id, failures, "run terminated");
        Ok(())
    }

    /// FINISHED once every plan execution is terminal; PAUSED once a pausing
    /// run has nothing running or pausing.
    pub(crate) async fn run_progress(&self, id: &RunId) -> Result<()> {
        let _guard = self.store().locks.lock(LOCK_RUN, id).await;
        let run = self.store().runs.get(id).await?;
        if !matches!(run.state, ExecutionState::Running | ExecutionState::Pausing) {
            return Ok(());
        }
        let executions = self.plan_executions_of_run(id).await?;
        if executions.iter().all(|execution| execution.state.is_terminal()) {
            self.store().runs.transition(id, ExecutionState::Finished).await?;
            tracing::info!(run_id = %id, "run finished");
        } else if run.state == ExecutionState::Pausing
            && !executions
                .iter()
                .any(|execution| matches!(execution.state, ExecutionState::Running | ExecutionState::Pausing))
        {
            self.store().runs.transition(id, ExecutionState::Paused).await?;
            tracing::info!(run_id = %id, "run paused");
        }
        Ok(())
    }

    pub(crate) async fn plan_executions_of_run(&self, id: &RunId) -> Result<Vec<PlanExecutionRecord>> {
        self.store()
            .plan_executions
            .filter(&Filter::new().field("run_id", id))
            .await
    }

    // =========================================================================
    // Execution variables
    // =========================================================================

    /// Set `{{ name }}` for one plan execution. Only allowed before it starts.
    pub async fn add_execution_variable(
        &self,
        plan_execution_id: &PlanExecutionId,
        name: &str,
        value: Value,
    ) -> Result<ExecutionVariableRecord> {
        if name.is_empty() {
            return Err(Error::validation("variable name cannot be empty"));
        }
        let _guard = self.store().locks.lock(LOCK_PLAN, plan_execution_id).await;
        let execution = self.store().plan_executions.get(plan_execution_id).await?;
        StateMachine::for_kind(EntityKind::PlanExecution)
            .validate_state(execution.state, &[ExecutionState::Pending])?;

        let existing = self
            .store()
            .variables
            .filter(
                &Filter::new()
                    .field("plan_execution_id", plan_execution_id)
                    .field("name", name),
            )
            .await?;
        match existing.into_iter().next() {
            Some(variable) => {
                self.store()
                    .variables
                    .update(&variable.id, |variable| variable.value = value)
                    .await
            }
            None => {
                self.store()
                    .variables
                    .create(ExecutionVariableRecord {
                        plan_execution_id: plan_execution_id.clone(),
                        name: name.to_string(),
                        value,
                        ..Default::default()
                    })
                    .await
            }
        }
    }
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    JobId::from_string(raw.to_string()).map_err(Error::validation)
}

#[cfg(test)]
mod tests {
    use super::super::tests::{engine, fixture};
    use super::*;
    use pretty_assertions::assert_eq;

    const PLAN: &str = r#"
plan:
  name: run
  stages:
    - name: a
      steps: [{name: s, module: m, is_init: true}]
    - name: b
      depends_on: [a]
      steps: [{name: s, module: m, is_init: true}]
"#;

    #[tokio::test]
    async fn test_create_run_builds_every_execution() {
        let engine = engine();
        let (_, _, run) = fixture(&engine, PLAN).await;
        assert_eq!(run.state, ExecutionState::Pending);
        assert_eq!(engine.plan_executions_of_run(&run.id).await.unwrap().len(), 1);
        assert_eq!(engine.store().stage_executions.all().await.len(), 2);
        assert_eq!(engine.store().step_executions.all().await.len(), 2);
        assert!(engine
            .store()
            .step_executions
            .all()
            .await
            .iter()
            .all(|step| step.state == ExecutionState::Pending));
    }

    #[tokio::test]
    async fn test_create_run_requires_workers() {
        let engine = engine();
        let (plan, worker, _) = fixture(&engine, PLAN).await;
        let err = engine.create_run(&plan.id, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = engine.create_run(&plan.id, &[WorkerId::new()]).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = engine
            .create_run(&plan.id, &[worker.id.clone(), worker.id.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_variables_only_before_start() {
        let engine = engine();
        let (_, _, run) = fixture(&engine, PLAN).await;
        let execution = engine.plan_executions_of_run(&run.id).await.unwrap().remove(0);

        engine
            .add_execution_variable(&execution.id, "target", json!("10.0.0.1"))
            .await
            .unwrap();
        let updated = engine
            .add_execution_variable(&execution.id, "target", json!("10.0.0.2"))
            .await
            .unwrap();
        assert_eq!(updated.value, json!("10.0.0.2"));
        assert_eq!(engine.store().variables.all().await.len(), 1);

        engine
            .store()
            .plan_executions
            .update(&execution.id, |e| e.state = ExecutionState::Running)
            .await
            .unwrap();
        let err = engine
            .add_execution_variable(&execution.id, "late", json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_kill_pending_run() {
        let engine = engine();
        let (_, _, run) = fixture(&engine, PLAN).await;
        engine.kill_run(&run.id).await.unwrap();

        assert_eq!(engine.store().runs.get(&run.id).await.unwrap().state, ExecutionState::Terminated);
        assert!(engine
            .store()
            .stage_executions
            .all()
            .await
            .iter()
            .all(|stage| stage.state == ExecutionState::Terminated));
        assert!(engine
            .store()
            .step_executions
            .all()
            .await
            .iter()
            .all(|step| step.state == ExecutionState::Terminated));

        let err = engine.kill_run(&run.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_) | Error::StateTransition(_)));
    }

    #[tokio::test]
    async fn test_start_run_with_unreachable_worker_fails() {
        let engine = {
            let mut config = crate::types::OrchestratorConfig::default();
            config.rpc_timeout = std::time::Duration::from_millis(50);
            let handle: crate::broker::BrokerHandle = std::sync::Arc::new(crate::broker::MemoryBroker::new());
            let rpc = crate::rpc::RpcClient::new(
                handle.clone(),
                crate::rpc::Outbox::new(handle, crate::types::ReconnectPolicy::default()),
            );
            Engine::new(crate::store::Store::new(), rpc, config)
        };
        let (_, _, run) = fixture(&engine, PLAN).await;
        let err = engine.start_run(&run.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(engine.store().runs.get(&run.id).await.unwrap().state, ExecutionState::Pending);
    }
}
