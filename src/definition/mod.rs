//! Plan/Stage/Step definitions.
//!
//! A definition document is parsed into a [`PlanTemplate`], validated
//! (names, successor values, trigger arguments, dependency and successor
//! graphs) and compiled into an immutable [`PlanModel`] carrying ids and
//! per-stage successor adjacency.

mod model;
mod validate;

pub use model::{
    PlanDefinition, PlanModel, PlanTemplate, StageDefinition, StageModel, StepDefinition, StepModel,
    StepTargets, SuccessorDefinition, SuccessorEdge, SuccessorGraph, SuccessorKind, TriggerKind,
};
pub use validate::validate;

use std::path::Path;

use crate::types::{Error, Result};

impl PlanTemplate {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| Error::validation(format!("invalid plan document: {}", e)))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::validation(format!("invalid plan document: {}", e)))
    }

    /// Load a document; `.json` files are parsed as JSON, everything else as YAML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&raw),
            _ => Self::from_yaml(&raw),
        }
    }

    /// Validate and compile into a fresh model.
    pub fn compile(&self) -> Result<PlanModel> {
        validate(&self.plan)?;
        PlanModel::compile(&self.plan, None)
    }
}

/// Append a stage to a dynamic plan. Returns the new definition and model;
/// existing stage and step ids are preserved.
pub fn add_stage(
    definition: &PlanDefinition,
    model: &PlanModel,
    stage: StageDefinition,
) -> Result<(PlanDefinition, PlanModel)> {
    if !definition.dynamic {
        return Err(Error::validation(format!(
            "plan '{}' is not dynamic",
            definition.name
        )));
    }
    let mut updated = definition.clone();
    updated.stages.push(stage);
    validate(&updated)?;
    let compiled = PlanModel::compile(&updated, Some(model))?;
    Ok((updated, compiled))
}

/// Append a step to a stage of a dynamic plan.
pub fn add_step(
    definition: &PlanDefinition,
    model: &PlanModel,
    stage_name: &str,
    step: StepDefinition,
) -> Result<(PlanDefinition, PlanModel)> {
    if !definition.dynamic {
        return Err(Error::validation(format!(
            "plan '{}' is not dynamic",
            definition.name
        )));
    }
    let mut updated = definition.clone();
    let stage = updated
        .stages
        .iter_mut()
        .find(|s| s.name == stage_name)
        .ok_or_else(|| Error::not_found(format!("stage '{}'", stage_name)))?;
    stage.steps.push(step);
    validate(&updated)?;
    let compiled = PlanModel::compile(&updated, Some(model))?;
    Ok((updated, compiled))
}
