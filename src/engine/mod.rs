//! Orchestration engine.
//!
//! Drives Run → PlanExecution → StageExecution → StepExecution through
//! their state machines:
//!   - **Runs** own one plan execution per bound worker
//!   - **Plan executions** arm every stage trigger independently
//!   - **Stage executions** start through the dependency resolver and
//!     dispatch their initial steps
//!   - **Step executions** are dispatched over the broker; replies drive the
//!     successor resolver
//!
//! The engine is a cheaply clonable context object. Compound check-then-write
//! sections take the per-entity guard from [`crate::store::LockTable`];
//! cascades (pause, kill) spawn one task per child and join on all of them.

pub mod arguments;
mod dependencies;
mod plan_execution;
mod report;
mod run;
mod stage_execution;
mod step_execution;
mod successors;

pub use dependencies::dependencies_met;
pub use report::{PlanExecutionReport, RunReport, StageExecutionReport, StepExecutionReport};
pub use successors::select_successors;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::definition::{self, PlanModel, PlanTemplate, StageDefinition, StepDefinition};
use crate::rpc::{events, worker_control_queue, CorrelationRegistry, EventMessage, RpcClient, SchedulerClient};
use crate::state::ExecutionState;
use crate::store::{
    Filter, PlanExecutionRecord, PlanRecord, StageExecutionRecord, StepExecutionRecord, Store, WorkerRecord,
    WorkerState,
};
use crate::trigger::TriggerContext;
use crate::types::{Error, OrchestratorConfig, PlanId, Result, StepExecutionId, WorkerId};

pub(crate) const LOCK_RUN: &str = "run";
pub(crate) const LOCK_PLAN: &str = "plan_execution";
pub(crate) const LOCK_STAGE: &str = "stage_execution";
pub(crate) const LOCK_STEP: &str = "step_execution";

/// Orchestration context shared by every handler.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Store,
    rpc: RpcClient,
    scheduler: SchedulerClient,
    correlations: CorrelationRegistry,
    config: OrchestratorConfig,
    /// Reply deadlines of running steps.
    watchdogs: Mutex<HashMap<StepExecutionId, JoinHandle<()>>>,
}

impl Engine {
    pub fn new(store: Store, rpc: RpcClient, config: OrchestratorConfig) -> Self {
        let scheduler = SchedulerClient::new(rpc.clone(), config.scheduler_queue.clone(), config.rpc_timeout);
        let correlations = CorrelationRegistry::new(
            store.clone(),
            config.correlation_grace,
            config.correlation_retry_interval,
        );
        Self {
            inner: Arc::new(Inner {
                store,
                rpc,
                scheduler,
                correlations,
                config,
                watchdogs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.inner.rpc
    }

    pub fn scheduler(&self) -> &SchedulerClient {
        &self.inner.scheduler
    }

    pub fn correlations(&self) -> &CorrelationRegistry {
        &self.inner.correlations
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    // =========================================================================
    // Plans
    // =========================================================================

    /// Validate, compile and store a plan. Nothing is stored on failure.
    pub async fn create_plan(&self, template: &PlanTemplate) -> Result<PlanRecord> {
        let model = template.compile()?;
        let record = PlanRecord {
            id: model.id.clone(),
            name: model.name.clone(),
            definition: template.plan.clone(),
            model,
            created_at: Some(Utc::now()),
        };
        let record = self.store().plans.create(record).await?;
        tracing::info!(plan_id = %record.id, name = %record.name, "plan created");
        Ok(record)
    }

    /// Append a stage to a dynamic plan and give every existing plan
    /// execution its PENDING stage execution.
    pub async fn add_stage(&self, plan_id: &PlanId, stage: StageDefinition) -> Result<PlanRecord> {
        let plan = self.store().plans.get(plan_id).await?;
        let stage_name = stage.name.clone();
        let (definition, model) = definition::add_stage(&plan.definition, &plan.model, stage)?;
        let plan = self.replace_model(plan_id, definition, model).await?;

        let Some(stage_model) = plan.model.stage_by_name(&stage_name) else {
            return Err(Error::internal(format!("stage '{}' missing after compile", stage_name)));
        };
        for plan_execution in self.plan_executions_of(plan_id).await? {
            let stage_execution = self
                .create_stage_execution(&plan_execution.id, stage_model)
                .await?;
            if plan_execution.state == ExecutionState::Running {
                self.spawn_logged("arm_stage", self.boxed_arm_stage(stage_execution.id));
            }
        }
        Ok(plan)
    }

    /// Append a step to a stage of a dynamic plan and give every existing
    /// stage execution its PENDING step execution.
    pub async fn add_step(&self, plan_id: &PlanId, stage_name: &str, step: StepDefinition) -> Result<PlanRecord> {
        let plan = self.store().plans.get(plan_id).await?;
        let step_name = step.name.clone();
        let (definition, model) = definition::add_step(&plan.definition, &plan.model, stage_name, step)?;
        let plan = self.replace_model(plan_id, definition, model).await?;

        let Some(stage_model) = plan.model.stage_by_name(stage_name) else {
            return Err(Error::internal(format!("stage '{}' missing after compile", stage_name)));
        };
        let Some(step_model) = stage_model.step_by_name(&step_name) else {
            return Err(Error::internal(format!("step '{}' missing after compile", step_name)));
        };
        for plan_execution in self.plan_executions_of(plan_id).await? {
            let stage_executions = self
                .store()
                .stage_executions
                .filter(
                    &Filter::new()
                        .field("plan_execution_id", &plan_execution.id)
                        .field("stage_id", &stage_model.id),
                )
                .await?;
            for stage_execution in stage_executions {
                let step_execution = self
                    .store()
                    .step_executions
                    .create(StepExecutionRecord {
                        stage_execution_id: stage_execution.id.clone(),
                        step_id: step_model.id.clone(),
                        ..Default::default()
                    })
                    .await?;
                if step_model.is_init && stage_execution.state == ExecutionState::Running {
                    self.execute_step(&step_execution.id, None).await?;
                }
            }
        }
        Ok(plan)
    }

    async fn replace_model(
        &self,
        plan_id: &PlanId,
        definition: crate::definition::PlanDefinition,
        model: PlanModel,
    ) -> Result<PlanRecord> {
        self.store()
            .plans
            .update(plan_id, |plan| {
                plan.definition = definition;
                plan.model = model;
            })
            .await
    }

    async fn plan_executions_of(&self, plan_id: &PlanId) -> Result<Vec<PlanExecutionRecord>> {
        self.store()
            .plan_executions
            .filter(&Filter::new().field("plan_id", plan_id))
            .await
    }

    pub(crate) async fn plan_model(&self, plan_id: &PlanId) -> Result<PlanModel> {
        Ok(self.store().plans.get(plan_id).await?.model)
    }

    pub(crate) async fn create_stage_execution(
        &self,
        plan_execution_id: &crate::types::PlanExecutionId,
        stage: &crate::definition::StageModel,
    ) -> Result<StageExecutionRecord> {
        let stage_execution = self
            .store()
            .stage_executions
            .create(StageExecutionRecord {
                plan_execution_id: plan_execution_id.clone(),
                stage_id: stage.id.clone(),
                ..Default::default()
            })
            .await?;
        for step in &stage.steps {
            self.store()
                .step_executions
                .create(StepExecutionRecord {
                    stage_execution_id: stage_execution.id.clone(),
                    step_id: step.id.clone(),
                    ..Default::default()
                })
                .await?;
        }
        Ok(stage_execution)
    }

    // =========================================================================
    // Workers
    // =========================================================================

    pub async fn register_worker(&self, name: &str, description: &str) -> Result<WorkerRecord> {
        if name.is_empty() {
            return Err(Error::validation("worker name cannot be empty"));
        }
        let existing = self
            .store()
            .workers
            .filter(&Filter::new().field("name", name))
            .await?;
        if !existing.is_empty() {
            return Err(Error::validation(format!("worker '{}' already exists", name)));
        }
        let worker = self
            .store()
            .workers
            .create(WorkerRecord {
                id: WorkerId::new(),
                name: name.to_string(),
                description: description.to_string(),
                state: WorkerState::Down,
            })
            .await?;
        tracing::info!(worker_id = %worker.id, name, "worker registered");
        Ok(worker)
    }

    /// Ask the worker for a heartbeat and record UP or DOWN.
    pub async fn healthcheck_worker(&self, worker_id: &WorkerId) -> Result<WorkerState> {
        let worker = self.store().workers.get(worker_id).await?;
        let event = EventMessage::new(events::HEALTH_CHECK, json!({}));
        let state = match self
            .rpc()
            .call_control(
                &worker_control_queue(&worker.name),
                &event,
                self.config().rpc_timeout,
                Error::connection,
            )
            .await
        {
            Ok(_) => WorkerState::Up,
            Err(e) => {
                tracing::warn!(worker = %worker.name, error = %e, "worker health check failed");
                WorkerState::Down
            }
        };
        self.store()
            .workers
            .update(worker_id, |worker| worker.state = state)
            .await?;
        Ok(state)
    }

    /// Ask the worker whether it can run `module`.
    pub(crate) async fn validate_module(&self, worker: &WorkerRecord, module: &str) -> Result<bool> {
        let event = EventMessage::new(events::VALIDATE_MODULE, json!({"module": module}));
        match self
            .rpc()
            .call_control(
                &worker_control_queue(&worker.name),
                &event,
                self.config().rpc_timeout,
                Error::validation,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::Validation(message)) => {
                tracing::warn!(worker = %worker.name, module, %message, "module rejected");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    pub(crate) fn trigger_context<'a>(
        &'a self,
        stage_execution: &'a StageExecutionRecord,
        plan_execution: &PlanExecutionRecord,
        worker: &'a WorkerRecord,
    ) -> TriggerContext<'a> {
        TriggerContext {
            stage_execution_id: &stage_execution.id,
            worker: &worker.name,
            plan_start: plan_execution.times.start_time,
            paused_total: plan_execution.paused_total(),
            event_queue: &self.config().event_queue,
            scheduler: self.scheduler(),
            rpc: self.rpc(),
            rpc_timeout: self.config().rpc_timeout,
        }
    }

    /// Run `task` on its own execution path; failures are logged.
    pub(crate) fn spawn_logged(&self, action: &'static str, task: BoxFuture<'static, Result<()>>) {
        tokio::spawn(async move {
            if let Err(e) = task.await {
                tracing::warn!(action, error = %e, "background operation failed");
            }
        });
    }

    /// Run every task on its own path and wait for all of them. Returns the
    /// number of failures; they never stop the siblings.
    pub(crate) async fn fan_out(&self, action: &'static str, tasks: Vec<BoxFuture<'static, Result<()>>>) -> usize {
        let handles: Vec<JoinHandle<Result<()>>> = tasks.into_iter().map(tokio::spawn).collect();
        let mut failures = 0;
        for outcome in futures::future::join_all(handles).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(action, error = %e, "child operation failed");
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(action, error = %e, "child task aborted");
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerHandle, MemoryBroker};
    use crate::rpc::Outbox;
    use crate::types::ReconnectPolicy;

    pub(crate) fn engine() -> Engine {
        let handle: BrokerHandle = Arc::new(MemoryBroker::new());
        let rpc = RpcClient::new(handle.clone(), Outbox::new(handle, ReconnectPolicy::default()));
        Engine::new(Store::new(), rpc, OrchestratorConfig::default())
    }

    /// Store `yaml`, register one worker and create a run bound to it.
    pub(crate) async fn fixture(engine: &Engine, yaml: &str) -> (PlanRecord, WorkerRecord, crate::store::RunRecord) {
        let plan = engine
            .create_plan(&PlanTemplate::from_yaml(yaml).unwrap())
            .await
            .unwrap();
        let worker = engine.register_worker("w", "").await.unwrap();
        let run = engine.create_run(&plan.id, &[worker.id.clone()]).await.unwrap();
        (plan, worker, run)
    }

    const PLAN: &str = r#"
plan:
  name: p
  dynamic: true
  stages:
    - name: a
      steps:
        - {name: init, module: m, is_init: true}
"#;

    #[tokio::test]
    async fn test_invalid_plan_is_not_stored() {
        let engine = engine();
        let template = PlanTemplate::from_yaml("plan: {name: broken, stages: []}").unwrap();
        assert!(engine.create_plan(&template).await.is_err());
        assert!(engine.store().plans.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_worker_rejected() {
        let engine = engine();
        engine.register_worker("w1", "first").await.unwrap();
        let err = engine.register_worker("w1", "again").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_health_check_without_worker_marks_down() {
        let mut config = OrchestratorConfig::default();
        config.rpc_timeout = std::time::Duration::from_millis(50);
        let handle: BrokerHandle = Arc::new(MemoryBroker::new());
        let rpc = RpcClient::new(handle.clone(), Outbox::new(handle, ReconnectPolicy::default()));
        let engine = Engine::new(Store::new(), rpc, config);

        let worker = engine.register_worker("ghost", "").await.unwrap();
        assert_eq!(engine.healthcheck_worker(&worker.id).await.unwrap(), WorkerState::Down);
    }

    #[tokio::test]
    async fn test_add_stage_extends_existing_executions() {
        let engine = engine();
        let plan = engine
            .create_plan(&PlanTemplate::from_yaml(PLAN).unwrap())
            .await
            .unwrap();
        let worker = engine.register_worker("w", "").await.unwrap();
        let run = engine.create_run(&plan.id, &[worker.id.clone()]).await.unwrap();
        assert_eq!(run.worker_ids.len(), 1);

        engine
            .add_stage(
                &plan.id,
                StageDefinition {
                    name: "b".into(),
                    trigger_type: crate::definition::TriggerKind::Immediate,
                    trigger_args: serde_json::Value::Null,
                    depends_on: vec!["a".into()],
                    steps: vec![StepDefinition {
                        name: "only".into(),
                        module: "m".into(),
                        arguments: serde_json::Value::Null,
                        is_init: true,
                        next: vec![],
                    }],
                },
            )
            .await
            .unwrap();

        let stage_executions = engine.store().stage_executions.all().await;
        assert_eq!(stage_executions.len(), 2);
        assert_eq!(engine.store().step_executions.all().await.len(), 2);
    }
}
