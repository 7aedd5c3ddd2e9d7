//! Definition document types and the compiled, id-carrying plan model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::trigger::TriggerSpec;
use crate::types::{PlanId, Result, StageId, StepId};

// =============================================================================
// Definition document
// =============================================================================

/// Root of a definition document: `plan: {...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTemplate {
    pub plan: PlanDefinition,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub name: String,

    #[serde(default)]
    pub settings: Map<String, Value>,

    /// Dynamic plans accept stages and steps after creation.
    #[serde(default)]
    pub dynamic: bool,

    #[serde(default)]
    pub stages: Vec<StageDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,

    #[serde(default)]
    pub trigger_type: TriggerKind,

    #[serde(default)]
    pub trigger_args: Value,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,

    /// Module executed by the worker.
    pub module: String,

    #[serde(default)]
    pub arguments: Value,

    #[serde(default)]
    pub is_init: bool,

    #[serde(default)]
    pub next: Vec<SuccessorDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessorDefinition {
    #[serde(rename = "type")]
    pub kind: SuccessorKind,

    #[serde(default)]
    pub value: Option<String>,

    pub step: StepTargets,
}

/// `step: name` or `step: [name, ...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepTargets {
    One(String),
    Many(Vec<String>),
}

impl StepTargets {
    pub fn names(&self) -> Vec<&str> {
        match self {
            StepTargets::One(name) => vec![name.as_str()],
            StepTargets::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessorKind {
    Any,
    Result,
    Output,
    SerializedOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    #[default]
    Immediate,
    Delta,
    Datetime,
    Http,
    Session,
}

// =============================================================================
// Compiled model
// =============================================================================

/// Validated plan with stable ids. Immutable once stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanModel {
    pub id: PlanId,
    pub name: String,
    pub settings: Map<String, Value>,
    pub dynamic: bool,
    pub stages: Vec<StageModel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageModel {
    pub id: StageId,
    pub name: String,
    pub trigger: TriggerSpec,
    pub depends_on: Vec<StageId>,
    pub steps: Vec<StepModel>,
    pub graph: SuccessorGraph,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepModel {
    pub id: StepId,
    pub name: String,
    pub module: String,
    pub arguments: Value,
    pub is_init: bool,
    pub successors: Vec<SuccessorEdge>,
}

/// Conditional edge `(kind, value) → target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessorEdge {
    pub kind: SuccessorKind,
    pub value: Option<String>,
    pub target: StepId,
}

/// In-memory adjacency of a stage's successor DAG.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuccessorGraph {
    children: HashMap<StepId, Vec<StepId>>,
    parents: HashMap<StepId, Vec<StepId>>,
}

impl SuccessorGraph {
    pub fn build(steps: &[StepModel]) -> Self {
        let mut graph = Self::default();
        for step in steps {
            for edge in &step.successors {
                let children = graph.children.entry(step.id.clone()).or_default();
                if !children.contains(&edge.target) {
                    children.push(edge.target.clone());
                }
                let parents = graph.parents.entry(edge.target.clone()).or_default();
                if !parents.contains(&step.id) {
                    parents.push(step.id.clone());
                }
            }
        }
        graph
    }

    /// Distinct declared successor targets of `step`.
    pub fn children(&self, step: &StepId) -> &[StepId] {
        self.children.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct steps that declare `step` as a successor.
    pub fn parents(&self, step: &StepId) -> &[StepId] {
        self.parents.get(step).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl PlanModel {
    /// Compile a validated definition. Stages and steps already present in
    /// `previous` keep their ids so existing executions stay bound.
    pub(crate) fn compile(definition: &PlanDefinition, previous: Option<&PlanModel>) -> Result<Self> {
        let id = previous.map(|p| p.id.clone()).unwrap_or_default();

        let stage_ids: HashMap<&str, StageId> = definition
            .stages
            .iter()
            .map(|stage| {
                let id = previous
                    .and_then(|p| p.stage_by_name(&stage.name))
                    .map(|s| s.id.clone())
                    .unwrap_or_default();
                (stage.name.as_str(), id)
            })
            .collect();

        let mut stages = Vec::with_capacity(definition.stages.len());
        for stage in &definition.stages {
            let prior = previous.and_then(|p| p.stage_by_name(&stage.name));
            let step_ids: HashMap<&str, StepId> = stage
                .steps
                .iter()
                .map(|step| {
                    let id = prior
                        .and_then(|s| s.step_by_name(&step.name))
                        .map(|s| s.id.clone())
                        .unwrap_or_default();
                    (step.name.as_str(), id)
                })
                .collect();

            let steps: Vec<StepModel> = stage
                .steps
                .iter()
                .map(|step| StepModel {
                    id: step_ids[step.name.as_str()].clone(),
                    name: step.name.clone(),
                    module: step.module.clone(),
                    arguments: step.arguments.clone(),
                    is_init: step.is_init,
                    successors: successor_edges(step, &step_ids),
                })
                .collect();

            stages.push(StageModel {
                id: stage_ids[stage.name.as_str()].clone(),
                name: stage.name.clone(),
                trigger: TriggerSpec::parse(stage.trigger_type, &stage.trigger_args)?,
                depends_on: stage
                    .depends_on
                    .iter()
                    .filter_map(|name| stage_ids.get(name.as_str()).cloned())
                    .collect(),
                graph: SuccessorGraph::build(&steps),
                steps,
            });
        }

        Ok(Self {
            id,
            name: definition.name.clone(),
            settings: definition.settings.clone(),
            dynamic: definition.dynamic,
            stages,
        })
    }

    pub fn stage(&self, id: &StageId) -> Option<&StageModel> {
        self.stages.iter().find(|s| &s.id == id)
    }

    pub fn stage_by_name(&self, name: &str) -> Option<&StageModel> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stages that list `stage` in their `depends_on`.
    pub fn dependents_of(&self, stage: &StageId) -> Vec<&StageModel> {
        self.stages
            .iter()
            .filter(|s| s.depends_on.contains(stage))
            .collect()
    }
}

fn successor_edges(step: &StepDefinition, step_ids: &HashMap<&str, StepId>) -> Vec<SuccessorEdge> {
    let mut edges = Vec::new();
    for edge in &step.next {
        for target in edge.step.names() {
            if let Some(id) = step_ids.get(target) {
                edges.push(SuccessorEdge {
                    kind: edge.kind,
                    value: edge.value.clone(),
                    target: id.clone(),
                });
            }
        }
    }
    edges
}

impl StageModel {
    pub fn step(&self, id: &StepId) -> Option<&StepModel> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn step_by_name(&self, name: &str) -> Option<&StepModel> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn init_steps(&self) -> impl Iterator<Item = &StepModel> {
        self.steps.iter().filter(|s| s.is_init)
    }
}
