//! Read-only run report: the execution tree of one run with definition
//! names resolved.

use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

use super::Engine;
use crate::rpc::ResultCode;
use crate::state::{ExecutionState, ExecutionTimes};
use crate::types::{
    PlanExecutionId, PlanId, Result, RunId, StageExecutionId, StepExecutionId, WorkerId,
};

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub id: RunId,
    pub plan_id: PlanId,
    pub plan_name: String,
    pub state: ExecutionState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub plan_executions: Vec<PlanExecutionReport>,
}

impl RunReport {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ExecutionState::Finished | ExecutionState::Error | ExecutionState::Terminated
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanExecutionReport {
    pub id: PlanExecutionId,
    pub worker_id: WorkerId,
    pub worker_name: String,
    pub state: ExecutionState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub evidence_dir: Option<PathBuf>,
    pub stage_executions: Vec<StageExecutionReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageExecutionReport {
    pub id: StageExecutionId,
    pub stage_name: String,
    pub state: ExecutionState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub step_executions: Vec<StepExecutionReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepExecutionReport {
    pub id: StepExecutionId,
    pub step_name: String,
    pub state: ExecutionState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub result: Option<ResultCode>,
    pub output: Option<String>,
    pub serialized_output: Option<Value>,
    pub parent_id: Option<StepExecutionId>,
    pub valid: Option<bool>,
}

impl Engine {
    /// Stages and steps appear in definition order.
    pub async fn run_report(&self, id: &RunId) -> Result<RunReport> {
        let run = self.store().runs.get(id).await?;
        let plan = self.store().plans.get(&run.plan_id).await?;

        let mut plan_executions = Vec::new();
        for plan_execution in self.plan_executions_of_run(id).await? {
            let worker_name = self
                .store()
                .workers
                .get(&plan_execution.worker_id)
                .await
                .map(|worker| worker.name)
                .unwrap_or_default();
            let stage_records = self.store().stage_executions_of(&plan_execution.id).await?;

            let mut stage_executions = Vec::new();
            for stage in &plan.model.stages {
                for stage_execution in stage_records.iter().filter(|s| s.stage_id == stage.id) {
                    let step_records = self.store().step_executions_of(&stage_execution.id).await?;
                    let step_executions = stage
                        .steps
                        .iter()
                        .flat_map(|step| {
                            step_records
                                .iter()
                                .filter(move |s| s.step_id == step.id)
                                .map(move |s| StepExecutionReport {
                                    id: s.id.clone(),
                                    step_name: step.name.clone(),
                                    state: s.state,
                                    times: s.times.clone(),
                                    result: s.result,
                                    output: s.output.clone(),
                                    serialized_output: s.serialized_output.clone(),
                                    parent_id: s.parent_id.clone(),
                                    valid: s.valid,
                                })
                        })
                        .collect();
                    stage_executions.push(StageExecutionReport {
                        id: stage_execution.id.clone(),
                        stage_name: stage.name.clone(),
                        state: stage_execution.state,
                        times: stage_execution.times.clone(),
                        step_executions,
                    });
                }
            }

            plan_executions.push(PlanExecutionReport {
                id: plan_execution.id,
                worker_id: plan_execution.worker_id,
                worker_name,
                state: plan_execution.state,
                times: plan_execution.times,
                evidence_dir: plan_execution.evidence_dir,
                stage_executions,
            });
        }

        Ok(RunReport {
            id: run.id,
            plan_id: run.plan_id,
            plan_name: plan.name,
            state: run.state,
            times: run.times,
            plan_executions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{engine, fixture};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_report_follows_definition_order() {
        let engine = engine();
        let (_, worker, run) = fixture(
            &engine,
            r#"
plan:
  name: report
  stages:
    - name: recon
      steps:
        - {name: scan, module: nmap, is_init: true, next: [{type: any, step: grab}]}
        - {name: grab, module: banner}
    - name: exploit
      depends_on: [recon]
      steps: [{name: shell, module: ssh, is_init: true}]
"#,
        )
        .await;

        let report = engine.run_report(&run.id).await.unwrap();
        assert_eq!(report.plan_name, "report");
        assert!(!report.is_terminal());
        let execution = &report.plan_executions[0];
        assert_eq!(execution.worker_name, worker.name);
        let stages: Vec<&str> = execution.stage_executions.iter().map(|s| s.stage_name.as_str()).collect();
        assert_eq!(stages, vec!["recon", "exploit"]);
        let steps: Vec<&str> = execution.stage_executions[0]
            .step_executions
            .iter()
            .map(|s| s.step_name.as_str())
            .collect();
        assert_eq!(steps, vec!["scan", "grab"]);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "PENDING");
    }
}
