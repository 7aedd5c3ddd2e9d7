//! Core types shared by every service.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (RunId, StepExecutionId, CorrelationId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for broker, orchestrator, worker and scheduler

mod config;
mod errors;
mod ids;

pub use config::{
    BrokerConfig, Config, ObservabilityConfig, OrchestratorConfig, ReconnectPolicy,
    SchedulerConfig, WorkerConfig,
};
pub use errors::{Error, Result};
pub use ids::{
    CorrelationId, JobId, PlanExecutionId, PlanId, RunId, SessionRecordId, StageExecutionId,
    StageId, StepExecutionId, StepId, TriggerId, VariableId, WorkerId,
};
