//! Execution state machines.
//!
//! Every execution entity (Run, PlanExecution, StageExecution, StepExecution)
//! shares one state vocabulary but has its own table of allowed transitions:
//! ```text
//! PENDING → {SCHEDULED | AWAITING | WAITING} → RUNNING → {PAUSING → PAUSED} → FINISHED
//!                                                  ↓
//!                                     TERMINATING → TERMINATED
//! ```
//! Writes go through [`StateMachine::validate_transition`]; `from == to` is a
//! no-op that tells the caller not to write.

mod tables;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Error, Result};

/// Lifecycle state of an execution entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    #[default]
    Pending,
    Scheduled,
    Starting,
    Running,
    Pausing,
    Paused,
    Waiting,
    Awaiting,
    Finished,
    Ignored,
    Error,
    Terminating,
    Terminated,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 13] = [
        ExecutionState::Pending,
        ExecutionState::Scheduled,
        ExecutionState::Starting,
        ExecutionState::Running,
        ExecutionState::Pausing,
        ExecutionState::Paused,
        ExecutionState::Waiting,
        ExecutionState::Awaiting,
        ExecutionState::Finished,
        ExecutionState::Ignored,
        ExecutionState::Error,
        ExecutionState::Terminating,
        ExecutionState::Terminated,
    ];

    /// No further transitions are expected (except ERROR → TERMINATING on kill).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Finished
                | ExecutionState::Ignored
                | ExecutionState::Error
                | ExecutionState::Terminated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Pending => "PENDING",
            ExecutionState::Scheduled => "SCHEDULED",
            ExecutionState::Starting => "STARTING",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Pausing => "PAUSING",
            ExecutionState::Paused => "PAUSED",
            ExecutionState::Waiting => "WAITING",
            ExecutionState::Awaiting => "AWAITING",
            ExecutionState::Finished => "FINISHED",
            ExecutionState::Ignored => "IGNORED",
            ExecutionState::Error => "ERROR",
            ExecutionState::Terminating => "TERMINATING",
            ExecutionState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity kinds with their own transition tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Run,
    PlanExecution,
    StageExecution,
    StepExecution,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Run => "run",
            EntityKind::PlanExecution => "plan execution",
            EntityKind::StageExecution => "stage execution",
            EntityKind::StepExecution => "step execution",
        };
        f.write_str(name)
    }
}

/// Outcome of a validated transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `from == to`: nothing to write.
    Unchanged,
    /// The pair is in the table: the caller may write.
    Apply,
}

/// Validated-transition engine for one entity kind.
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    kind: EntityKind,
    table: &'static [(ExecutionState, ExecutionState)],
}

impl StateMachine {
    pub fn for_kind(kind: EntityKind) -> Self {
        let table = match kind {
            EntityKind::Run => tables::RUN,
            EntityKind::PlanExecution => tables::PLAN_EXECUTION,
            EntityKind::StageExecution => tables::STAGE_EXECUTION,
            EntityKind::StepExecution => tables::STEP_EXECUTION,
        };
        Self { kind, table }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Fail with InvalidState if `current` is outside `allowed`.
    pub fn validate_state(&self, current: ExecutionState, allowed: &[ExecutionState]) -> Result<()> {
        if allowed.contains(&current) {
            return Ok(());
        }
        let expected: Vec<&str> = allowed.iter().map(|s| s.as_str()).collect();
        Err(Error::invalid_state(format!(
            "{} is {}, expected one of [{}]",
            self.kind,
            current,
            expected.join(", ")
        )))
    }

    pub fn can_transition(&self, from: ExecutionState, to: ExecutionState) -> bool {
        self.table.contains(&(from, to))
    }

    /// Check `(from, to)` against the table.
    pub fn validate_transition(&self, from: ExecutionState, to: ExecutionState) -> Result<Transition> {
        if from == to {
            return Ok(Transition::Unchanged);
        }
        if !self.can_transition(from, to) {
            return Err(Error::state_transition(format!(
                "{} cannot move from {} to {}",
                self.kind, from, to
            )));
        }
        Ok(Transition::Apply)
    }
}

/// Timestamps carried by every execution entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTimes {
    pub schedule_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub pause_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
}

impl ExecutionTimes {
    /// Stamp the timestamps implied by entering `to`.
    pub fn on_transition(&mut self, to: ExecutionState, now: DateTime<Utc>) {
        match to {
            ExecutionState::Running if self.start_time.is_none() => self.start_time = Some(now),
            ExecutionState::Paused => self.pause_time = Some(now),
            ExecutionState::Pending => self.schedule_time = None,
            s if s.is_terminal() => self.finish_time = Some(now),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_state() -> impl Strategy<Value = ExecutionState> {
        (0..ExecutionState::ALL.len()).prop_map(|i| ExecutionState::ALL[i])
    }

    fn any_kind() -> impl Strategy<Value = EntityKind> {
        prop_oneof![
            Just(EntityKind::Run),
            Just(EntityKind::PlanExecution),
            Just(EntityKind::StageExecution),
            Just(EntityKind::StepExecution),
        ]
    }

    proptest! {
        #[test]
        fn same_state_is_always_unchanged(kind in any_kind(), state in any_state()) {
            let machine = StateMachine::for_kind(kind);
            prop_assert_eq!(machine.validate_transition(state, state).unwrap(), Transition::Unchanged);
        }

        #[test]
        fn pairs_outside_table_fail(kind in any_kind(), from in any_state(), to in any_state()) {
            let machine = StateMachine::for_kind(kind);
            let result = machine.validate_transition(from, to);
            if from == to {
                prop_assert!(result.is_ok());
            } else if machine.can_transition(from, to) {
                prop_assert_eq!(result.unwrap(), Transition::Apply);
            } else {
                prop_assert!(matches!(result, Err(Error::StateTransition(_))));
            }
        }
    }

    #[test]
    fn test_step_transitions() {
        let machine = StateMachine::for_kind(EntityKind::StepExecution);
        assert!(machine.can_transition(ExecutionState::Pending, ExecutionState::Starting));
        assert!(machine.can_transition(ExecutionState::Pending, ExecutionState::Ignored));
        assert!(machine.can_transition(ExecutionState::Running, ExecutionState::Finished));
        assert!(!machine.can_transition(ExecutionState::Ignored, ExecutionState::Pending));
        assert!(!machine.can_transition(ExecutionState::Finished, ExecutionState::Running));
        assert!(!machine.can_transition(ExecutionState::Pending, ExecutionState::Waiting));
    }

    #[test]
    fn test_stage_transitions() {
        let machine = StateMachine::for_kind(EntityKind::StageExecution);
        assert!(machine.can_transition(ExecutionState::Pending, ExecutionState::Waiting));
        assert!(machine.can_transition(ExecutionState::Waiting, ExecutionState::Running));
        assert!(machine.can_transition(ExecutionState::Awaiting, ExecutionState::Running));
        assert!(machine.can_transition(ExecutionState::Paused, ExecutionState::Scheduled));
        assert!(!machine.can_transition(ExecutionState::Finished, ExecutionState::Running));
    }

    #[test]
    fn test_run_pause_cycle() {
        let machine = StateMachine::for_kind(EntityKind::Run);
        assert!(machine.can_transition(ExecutionState::Running, ExecutionState::Pausing));
        assert!(machine.can_transition(ExecutionState::Pausing, ExecutionState::Paused));
        assert!(machine.can_transition(ExecutionState::Paused, ExecutionState::Running));
        assert!(!machine.can_transition(ExecutionState::Paused, ExecutionState::Finished));
    }

    #[test]
    fn test_validate_state() {
        let machine = StateMachine::for_kind(EntityKind::Run);
        assert!(machine
            .validate_state(ExecutionState::Running, &[ExecutionState::Running])
            .is_ok());
        let err = machine
            .validate_state(ExecutionState::Finished, &[ExecutionState::Pending, ExecutionState::Scheduled])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(err.to_string().contains("PENDING, SCHEDULED"));
    }

    #[test]
    fn test_times_stamped() {
        let now = Utc::now();
        let mut times = ExecutionTimes::default();
        times.on_transition(ExecutionState::Running, now);
        assert_eq!(times.start_time, Some(now));

        let later = now + chrono::Duration::seconds(5);
        times.on_transition(ExecutionState::Running, later);
        assert_eq!(times.start_time, Some(now));

        times.on_transition(ExecutionState::Finished, later);
        assert_eq!(times.finish_time, Some(later));
    }

    #[test]
    fn test_state_serializes_uppercase() {
        assert_eq!(
            serde_json::to_value(ExecutionState::Terminating).unwrap(),
            serde_json::json!("TERMINATING")
        );
    }
}
