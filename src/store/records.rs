//! Persisted entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use super::table::{Record, Stateful};
use crate::definition::{PlanDefinition, PlanModel};
use crate::rpc::ResultCode;
use crate::state::{EntityKind, ExecutionState, ExecutionTimes};
use crate::types::{
    CorrelationId, PlanExecutionId, PlanId, RunId, SessionRecordId, StageExecutionId, StageId,
    StepExecutionId, StepId, VariableId, WorkerId,
};

macro_rules! stateful {
    ($record:ty, $entity:expr) => {
        impl Stateful for $record {
            const ENTITY: EntityKind = $entity;

            fn state(&self) -> ExecutionState {
                self.state
            }

            fn set_state(&mut self, state: ExecutionState) {
                self.state = state;
            }

            fn times_mut(&mut self) -> &mut ExecutionTimes {
                &mut self.times
            }
        }
    };
}

macro_rules! record {
    ($record:ty, $kind:literal, $id:ty) => {
        impl Record for $record {
            const KIND: &'static str = $kind;
            type Id = $id;

            fn id(&self) -> &$id {
                &self.id
            }
        }
    };
}

// =============================================================================
// Definitions
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanRecord {
    pub id: PlanId,
    pub name: String,
    pub definition: PlanDefinition,
    pub model: PlanModel,
    pub created_at: Option<DateTime<Utc>>,
}

record!(PlanRecord, "plan", PlanId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Up,
    #[default]
    Down,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    /// Name used to address the worker's queues.
    pub name: String,
    pub description: String,
    pub state: WorkerState,
}

record!(WorkerRecord, "worker", WorkerId);

// =============================================================================
// Executions
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub plan_id: PlanId,
    pub worker_ids: Vec<WorkerId>,
    pub state: ExecutionState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    /// Scheduler job starting the run, when scheduled.
    pub trigger_id: Option<String>,
}

record!(RunRecord, "run", RunId);
stateful!(RunRecord, EntityKind::Run);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanExecutionRecord {
    pub id: PlanExecutionId,
    pub run_id: RunId,
    pub plan_id: PlanId,
    pub worker_id: WorkerId,
    pub state: ExecutionState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub evidence_dir: Option<PathBuf>,
    /// Total time spent paused, in milliseconds.
    pub paused_total_ms: i64,
}

record!(PlanExecutionRecord, "plan execution", PlanExecutionId);
stateful!(PlanExecutionRecord, EntityKind::PlanExecution);

impl PlanExecutionRecord {
    pub fn paused_total(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.paused_total_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageExecutionRecord {
    pub id: StageExecutionId,
    pub plan_execution_id: PlanExecutionId,
    pub stage_id: StageId,
    pub state: ExecutionState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    /// Handle of the armed trigger (scheduler job or worker trigger).
    pub trigger_id: Option<String>,
    /// Parameters captured by the firing event trigger.
    pub trigger_output: Option<Value>,
    /// Outputs of finished steps, by step name.
    pub output: Map<String, Value>,
    /// State the stage left when it was paused; decides how it resumes.
    pub paused_from: Option<ExecutionState>,
}

record!(StageExecutionRecord, "stage execution", StageExecutionId);
stateful!(StageExecutionRecord, EntityKind::StageExecution);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub id: StepExecutionId,
    pub stage_execution_id: StageExecutionId,
    pub step_id: StepId,
    pub state: ExecutionState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub result: Option<ResultCode>,
    pub output: Option<String>,
    pub serialized_output: Option<Value>,
    /// Predecessor that authorized this execution.
    pub parent_id: Option<StepExecutionId>,
    /// Module validity as reported by the worker.
    pub valid: Option<bool>,
    pub correlation_id: Option<CorrelationId>,
    /// Arguments as sent after resolution.
    pub arguments: Option<Value>,
}

record!(StepExecutionRecord, "step execution", StepExecutionId);
stateful!(StepExecutionRecord, EntityKind::StepExecution);

// =============================================================================
// Auxiliary
// =============================================================================

/// Named remote-session handle scoped to a plan execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionRecordId,
    pub plan_execution_id: PlanExecutionId,
    pub name: String,
    pub session_id: Value,
}

record!(SessionRecord, "session", SessionRecordId);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionVariableRecord {
    pub id: VariableId,
    pub plan_execution_id: PlanExecutionId,
    pub name: String,
    pub value: Value,
}

record!(ExecutionVariableRecord, "execution variable", VariableId);

/// In-flight unit of work awaiting a reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingCorrelation {
    pub id: CorrelationId,
    pub step_execution_id: StepExecutionId,
    pub worker_id: WorkerId,
    pub created_at: Option<DateTime<Utc>>,
}

record!(PendingCorrelation, "pending correlation", CorrelationId);
