//! Dependency resolution between stages of one plan execution.

use super::{Engine, LOCK_STAGE};
use crate::definition::{PlanModel, StageModel};
use crate::state::ExecutionState;
use crate::store::StageExecutionRecord;
use crate::types::{Result, StageExecutionId};

/// Whether every stage `stage` depends on has a FINISHED execution among
/// `siblings` (the stage executions of the same plan execution).
pub fn dependencies_met(stage: &StageModel, siblings: &[StageExecutionRecord]) -> bool {
    stage.depends_on.iter().all(|dependency| {
        siblings
            .iter()
            .any(|sibling| &sibling.stage_id == dependency && sibling.state == ExecutionState::Finished)
    })
}

impl Engine {
    /// Re-attempt the start of every WAITING stage execution that depends on
    /// the finished one. Each subject starts on its own path, so one failing
    /// start does not hold back the others.
    pub(crate) async fn resolve_dependents(&self, finished: &StageExecutionRecord, plan: &PlanModel) -> Result<()> {
        let subjects = plan.dependents_of(&finished.stage_id);
        if subjects.is_empty() {
            return Ok(());
        }

        let siblings = self.store().stage_executions_of(&finished.plan_execution_id).await?;
        for subject in subjects {
            let Some(execution) = siblings.iter().find(|s| s.stage_id == subject.id) else {
                continue;
            };
            tracing::debug!(
                stage_execution_id = %execution.id,
                dependency = %finished.id,
                "re-attempting waiting stage"
            );
            self.spawn_logged(
                "resolve_dependents",
                self.boxed_start_stage(execution.id.clone(), &[ExecutionState::Waiting]),
            );
        }
        Ok(())
    }

    /// Names of the stages execution `id` still waits for.
    pub async fn waiting_on(&self, id: &StageExecutionId) -> Result<Vec<String>> {
        let _guard = self.store().locks.lock(LOCK_STAGE, id).await;
        let execution = self.store().stage_executions.get(id).await?;
        let plan_execution = self.store().plan_executions.get(&execution.plan_execution_id).await?;
        let plan = self.plan_model(&plan_execution.plan_id).await?;
        let Some(stage) = plan.stage(&execution.stage_id) else {
            return Ok(Vec::new());
        };
        let siblings = self.store().stage_executions_of(&execution.plan_execution_id).await?;
        Ok(stage
            .depends_on
            .iter()
            .filter(|dependency| {
                !siblings
                    .iter()
                    .any(|s| &s.stage_id == *dependency && s.state == ExecutionState::Finished)
            })
            .filter_map(|dependency| plan.stage(dependency).map(|s| s.name.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::PlanTemplate;

    const PLAN: &str = r#"
plan:
  name: deps
  stages:
    - name: a
      steps: [{name: s, module: m, is_init: true}]
    - name: b
      steps: [{name: s, module: m, is_init: true}]
    - name: c
      depends_on: [a, b]
      steps: [{name: s, module: m, is_init: true}]
"#;

    fn execution(stage: &StageModel, state: ExecutionState) -> StageExecutionRecord {
        StageExecutionRecord {
            stage_id: stage.id.clone(),
            state,
            ..Default::default()
        }
    }

    #[test]
    fn test_all_dependencies_must_finish() {
        let plan = PlanTemplate::from_yaml(PLAN).unwrap().compile().unwrap();
        let (a, b, c) = (&plan.stages[0], &plan.stages[1], &plan.stages[2]);

        let siblings = vec![
            execution(a, ExecutionState::Finished),
            execution(b, ExecutionState::Running),
        ];
        assert!(!dependencies_met(c, &siblings));

        let siblings = vec![
            execution(a, ExecutionState::Finished),
            execution(b, ExecutionState::Finished),
        ];
        assert!(dependencies_met(c, &siblings));
        assert!(dependencies_met(a, &[]));
    }

    #[test]
    fn test_errored_dependency_is_not_met() {
        let plan = PlanTemplate::from_yaml(PLAN).unwrap().compile().unwrap();
        let (a, b, c) = (&plan.stages[0], &plan.stages[1], &plan.stages[2]);
        let siblings = vec![
            execution(a, ExecutionState::Error),
            execution(b, ExecutionState::Finished),
        ];
        assert!(!dependencies_met(c, &siblings));
    }
}
