//! Successor resolution.
//!
//! When a step finishes, its selected successors are dispatched and the
//! declared-but-unselected ones are ignored. Ignoring walks an explicit
//! worklist over the stage's in-memory adjacency: a candidate is only skipped
//! when none of its other parents is still running or would select it, so
//! steps reachable through more than one path survive out-of-order finishes.

use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

use super::{Engine, LOCK_STAGE};
use crate::definition::{StageModel, SuccessorEdge, SuccessorKind};
use crate::state::ExecutionState;
use crate::store::{StageExecutionRecord, StepExecutionRecord};
use crate::types::{Result, StageExecutionId, StepId};

/// Targets selected by a step's outcome, in declaration order, deduplicated.
///
/// Only FINISHED steps select anything:
///   - `any` always matches
///   - `result` matches when the value equals the result code
///   - `output` / `serialized_output` match when the value (a regex) is
///     found in the corresponding field
pub fn select_successors(edges: &[SuccessorEdge], record: &StepExecutionRecord) -> Vec<StepId> {
    if record.state != ExecutionState::Finished {
        return Vec::new();
    }

    let mut selected: Vec<StepId> = Vec::new();
    for edge in edges {
        if selected.contains(&edge.target) || !edge_matches(edge, record) {
            continue;
        }
        selected.push(edge.target.clone());
    }
    selected
}

fn edge_matches(edge: &SuccessorEdge, record: &StepExecutionRecord) -> bool {
    let value = edge.value.as_deref().unwrap_or_default();
    match edge.kind {
        SuccessorKind::Any => true,
        SuccessorKind::Result => record.result.map(|r| r.as_str() == value).unwrap_or(false),
        SuccessorKind::Output => record
            .output
            .as_deref()
            .map(|output| regex_search(value, output))
            .unwrap_or(false),
        SuccessorKind::SerializedOutput => match &record.serialized_output {
            None | Some(Value::Null) => false,
            Some(Value::String(text)) => regex_search(value, text),
            Some(other) => regex_search(value, &other.to_string()),
        },
    }
}

fn regex_search(pattern: &str, haystack: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(haystack),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "invalid successor pattern");
            false
        }
    }
}

/// Whether `candidate`, reached from `via` (a parent that did not select it),
/// may be marked IGNORED.
///
/// | candidate | any other parent                      | result |
/// |-----------|---------------------------------------|--------|
/// | not PENDING | -                                   | keep   |
/// | PENDING   | non-terminal                          | keep   |
/// | PENDING   | FINISHED and selects candidate        | keep   |
/// | PENDING   | all terminal, none selecting          | ignore |
pub(crate) fn can_ignore(
    stage: &StageModel,
    candidate: &StepId,
    via: Option<&StepId>,
    records: &HashMap<StepId, StepExecutionRecord>,
) -> bool {
    match records.get(candidate) {
        Some(record) if record.state == ExecutionState::Pending => {}
        _ => return false,
    }

    stage
        .graph
        .parents(candidate)
        .iter()
        .filter(|parent| Some(*parent) != via)
        .all(|parent| {
            let Some(record) = records.get(parent) else {
                return true;
            };
            if !record.state.is_terminal() {
                return false;
            }
            let edges = stage
                .step(parent)
                .map(|step| step.successors.as_slice())
                .unwrap_or_default();
            !select_successors(edges, record).contains(candidate)
        })
}

impl Engine {
    /// Dispatch the successors `finished` selects and ignore the rest of its
    /// declared children.
    pub(crate) async fn execute_successors(
        &self,
        stage_execution: &StageExecutionRecord,
        stage: &StageModel,
        finished: &StepExecutionRecord,
    ) -> Result<()> {
        let Some(step) = stage.step(&finished.step_id) else {
            return Ok(());
        };
        let selected = select_successors(&step.successors, finished);
        let executions: HashMap<StepId, StepExecutionRecord> = self
            .store()
            .step_executions_of(&stage_execution.id)
            .await?
            .into_iter()
            .map(|record| (record.step_id.clone(), record))
            .collect();

        for target in &selected {
            let Some(target_execution) = executions.get(target) else {
                continue;
            };
            if let Err(e) = self
                .execute_step(&target_execution.id, Some(finished.id.clone()))
                .await
            {
                tracing::warn!(
                    step_execution_id = %target_execution.id,
                    error = %e,
                    "successor dispatch failed"
                );
            }
        }

        let unselected: Vec<(StepId, Option<StepId>)> = stage
            .graph
            .children(&finished.step_id)
            .iter()
            .filter(|child| !selected.contains(child))
            .map(|child| (child.clone(), Some(finished.step_id.clone())))
            .collect();
        if !unselected.is_empty() {
            self.ignore_branch(&stage_execution.id, stage, unselected).await?;
        }
        Ok(())
    }

    /// Ignore every candidate of `start` that no other parent can still
    /// reach, then their children, transitively. Returns how many steps were
    /// marked IGNORED. Re-running it is a no-op.
    pub(crate) async fn ignore_branch(
        &self,
        stage_execution_id: &StageExecutionId,
        stage: &StageModel,
        start: Vec<(StepId, Option<StepId>)>,
    ) -> Result<usize> {
        let _guard = self.store().locks.lock(LOCK_STAGE, stage_execution_id).await;
        let mut records: HashMap<StepId, StepExecutionRecord> = self
            .store()
            .step_executions_of(stage_execution_id)
            .await?
            .into_iter()
            .map(|record| (record.step_id.clone(), record))
            .collect();

        let mut worklist: VecDeque<(StepId, Option<StepId>)> = start.into();
        let mut ignored = 0;
        while let Some((candidate, via)) = worklist.pop_front() {
            if !can_ignore(stage, &candidate, via.as_ref(), &records) {
                continue;
            }
            let Some(record) = records.get_mut(&candidate) else {
                continue;
            };
            let won = self
                .store()
                .step_executions
                .compare_and_set_state(&record.id, ExecutionState::Pending, ExecutionState::Ignored)
                .await?;
            if !won {
                // Dispatched concurrently by another parent.
                *record = self.store().step_executions.get(&record.id).await?;
                continue;
            }
            record.state = ExecutionState::Ignored;
            ignored += 1;
            tracing::info!(step_execution_id = %record.id, step = %candidate, "step ignored");

            for child in stage.graph.children(&candidate) {
                worklist.push_back((child.clone(), Some(candidate.clone())));
            }
        }
        Ok(ignored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::PlanTemplate;
    use crate::rpc::ResultCode;

    const DIAMOND: &str = r#"
plan:
  name: diamond
  stages:
    - name: s
      steps:
        - name: a
          module: m
          is_init: true
          next:
            - {type: result, value: ok, step: b}
            - {type: result, value: fail, step: c}
        - name: b
          module: m
          next: [{type: any, step: d}]
        - name: c
          module: m
          next: [{type: any, step: d}]
        - name: d
          module: m
"#;

    fn diamond() -> StageModel {
        PlanTemplate::from_yaml(DIAMOND)
            .unwrap()
            .compile()
            .unwrap()
            .stages
            .remove(0)
    }

    fn snapshot(stage: &StageModel, states: &[(&str, ExecutionState)]) -> HashMap<StepId, StepExecutionRecord> {
        stage
            .steps
            .iter()
            .map(|step| {
                let state = states
                    .iter()
                    .find(|(name, _)| *name == step.name)
                    .map(|(_, state)| *state)
                    .unwrap_or(ExecutionState::Pending);
                let record = StepExecutionRecord {
                    step_id: step.id.clone(),
                    state,
                    result: (state == ExecutionState::Finished).then_some(ResultCode::Ok),
                    ..Default::default()
                };
                (step.id.clone(), record)
            })
            .collect()
    }

    fn id(stage: &StageModel, name: &str) -> StepId {
        stage.step_by_name(name).unwrap().id.clone()
    }

    fn finished(result: ResultCode, output: &str) -> StepExecutionRecord {
        StepExecutionRecord {
            state: ExecutionState::Finished,
            result: Some(result),
            output: Some(output.to_string()),
            ..Default::default()
        }
    }

    fn edge(kind: SuccessorKind, value: Option<&str>, target: &StepId) -> SuccessorEdge {
        SuccessorEdge {
            kind,
            value: value.map(str::to_string),
            target: target.clone(),
        }
    }

    #[test]
    fn test_select_by_kind() {
        let (t1, t2, t3, t4) = (StepId::new(), StepId::new(), StepId::new(), StepId::new());
        let edges = vec![
            edge(SuccessorKind::Any, None, &t1),
            edge(SuccessorKind::Result, Some("fail"), &t2),
            edge(SuccessorKind::Output, Some(r"port \d+ open"), &t3),
            edge(SuccessorKind::Result, Some("ok"), &t4),
        ];
        let record = finished(ResultCode::Ok, "scan: port 22 open");
        assert_eq!(select_successors(&edges, &record), vec![t1, t3, t4]);
    }

    #[test]
    fn test_select_serialized_output() {
        let target = StepId::new();
        let edges = vec![edge(SuccessorKind::SerializedOutput, Some("\"session_id\":\\s*7"), &target)];
        let mut record = finished(ResultCode::Ok, "");
        record.serialized_output = Some(serde_json::json!({"session_id": 7}));
        assert_eq!(select_successors(&edges, &record), vec![target.clone()]);

        record.serialized_output = Some(Value::Null);
        assert!(select_successors(&edges, &record).is_empty());
    }

    #[test]
    fn test_unfinished_step_selects_nothing() {
        let target = StepId::new();
        let edges = vec![edge(SuccessorKind::Any, None, &target)];
        let mut record = finished(ResultCode::Ok, "");
        record.state = ExecutionState::Error;
        assert!(select_successors(&edges, &record).is_empty());
    }

    #[test]
    fn test_select_deduplicates_targets() {
        let target = StepId::new();
        let edges = vec![
            edge(SuccessorKind::Any, None, &target),
            edge(SuccessorKind::Result, Some("ok"), &target),
        ];
        assert_eq!(select_successors(&edges, &finished(ResultCode::Ok, "")), vec![target]);
    }

    #[test]
    fn test_diamond_guard_waits_for_other_parent() {
        let stage = diamond();
        let (b, c, d) = (id(&stage, "b"), id(&stage, "c"), id(&stage, "d"));

        // c ignored, b still running: d must survive
        let records = snapshot(
            &stage,
            &[
                ("a", ExecutionState::Finished),
                ("b", ExecutionState::Running),
                ("c", ExecutionState::Ignored),
            ],
        );
        assert!(!can_ignore(&stage, &d, Some(&c), &records));

        // b finished and selects d: d must survive
        let records = snapshot(
            &stage,
            &[
                ("a", ExecutionState::Finished),
                ("b", ExecutionState::Finished),
                ("c", ExecutionState::Ignored),
            ],
        );
        assert!(!can_ignore(&stage, &d, Some(&c), &records));

        // b failed: d is unreachable
        let records = snapshot(
            &stage,
            &[
                ("a", ExecutionState::Finished),
                ("b", ExecutionState::Error),
                ("c", ExecutionState::Ignored),
            ],
        );
        assert!(can_ignore(&stage, &d, Some(&c), &records));
        assert!(!can_ignore(&stage, &b, Some(&c), &records));
    }

    #[test]
    fn test_ignored_candidate_is_not_ignored_twice() {
        let stage = diamond();
        let c = id(&stage, "c");
        let a = id(&stage, "a");
        let records = snapshot(&stage, &[("a", ExecutionState::Finished), ("c", ExecutionState::Ignored)]);
        assert!(!can_ignore(&stage, &c, Some(&a), &records));
    }
}
