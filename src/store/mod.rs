//! Persistence boundary.
//!
//! Repository of immutable snapshots. Reads return owned copies; every
//! mutation is an explicit `update`/`transition` call. State writes are
//! validated against the entity's [`StateMachine`](crate::state::StateMachine)
//! under the table's write guard, and [`LockTable`] provides per-entity
//! guards for compound check-then-write sections.

mod locks;
mod records;
mod table;

pub use locks::LockTable;
pub use records::{
    ExecutionVariableRecord, PendingCorrelation, PlanExecutionRecord, PlanRecord, RunRecord,
    SessionRecord, StageExecutionRecord, StepExecutionRecord, WorkerRecord, WorkerState,
};
pub use table::{Filter, Record, Stateful, Table};

use crate::types::{PlanExecutionId, Result, StageExecutionId};

/// All tables of the orchestrator. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct Store {
    pub plans: Table<PlanRecord>,
    pub workers: Table<WorkerRecord>,
    pub runs: Table<RunRecord>,
    pub plan_executions: Table<PlanExecutionRecord>,
    pub stage_executions: Table<StageExecutionRecord>,
    pub step_executions: Table<StepExecutionRecord>,
    pub sessions: Table<SessionRecord>,
    pub variables: Table<ExecutionVariableRecord>,
    pub correlations: Table<PendingCorrelation>,
    pub locks: LockTable,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stage_executions_of(&self, plan_execution: &PlanExecutionId) -> Result<Vec<StageExecutionRecord>> {
        self.stage_executions
            .filter(&Filter::new().field("plan_execution_id", plan_execution))
            .await
    }

    pub async fn step_executions_of(&self, stage_execution: &StageExecutionId) -> Result<Vec<StepExecutionRecord>> {
        self.step_executions
            .filter(&Filter::new().field("stage_execution_id", stage_execution))
            .await
    }
}
