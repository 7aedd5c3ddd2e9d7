//! Allowed `(from, to)` pairs per entity kind.

use super::ExecutionState::{self, *};

pub(super) const RUN: &[(ExecutionState, ExecutionState)] = &[
    // PENDING
    (Pending, Scheduled),
    (Pending, Running),
    (Pending, Terminated),
    // SCHEDULED
    (Scheduled, Pending),
    (Scheduled, Running),
    (Scheduled, Terminated),
    // RUNNING
    (Running, Pausing),
    (Running, Paused),
    (Running, Finished),
    (Running, Terminating),
    (Running, Error),
    // PAUSING
    (Pausing, Paused),
    (Pausing, Running),
    (Pausing, Finished),
    (Pausing, Terminating),
    // PAUSED
    (Paused, Running),
    (Paused, Terminating),
    // TERMINATING
    (Terminating, Terminated),
    // ERROR
    (Error, Terminating),
];

// Plan executions follow the same lifecycle as runs.
pub(super) const PLAN_EXECUTION: &[(ExecutionState, ExecutionState)] = RUN;

pub(super) const STAGE_EXECUTION: &[(ExecutionState, ExecutionState)] = &[
    // PENDING
    (Pending, Scheduled),
    (Pending, Awaiting),
    (Pending, Waiting),
    (Pending, Running),
    (Pending, Paused),
    (Pending, Terminated),
    (Pending, Error),
    // SCHEDULED (time trigger armed)
    (Scheduled, Pending),
    (Scheduled, Waiting),
    (Scheduled, Running),
    (Scheduled, Paused),
    (Scheduled, Terminating),
    (Scheduled, Error),
    // AWAITING (event trigger armed)
    (Awaiting, Pending),
    (Awaiting, Waiting),
    (Awaiting, Running),
    (Awaiting, Paused),
    (Awaiting, Terminating),
    (Awaiting, Error),
    // WAITING (dependencies unmet)
    (Waiting, Running),
    (Waiting, Paused),
    (Waiting, Terminating),
    // RUNNING
    (Running, Pausing),
    (Running, Paused),
    (Running, Finished),
    (Running, Terminating),
    (Running, Error),
    // PAUSING
    (Pausing, Paused),
    (Pausing, Running),
    (Pausing, Finished),
    (Pausing, Terminating),
    // PAUSED
    (Paused, Scheduled),
    (Paused, Waiting),
    (Paused, Running),
    (Paused, Terminating),
    // TERMINATING
    (Terminating, Terminated),
    // ERROR
    (Error, Terminating),
];

pub(super) const STEP_EXECUTION: &[(ExecutionState, ExecutionState)] = &[
    // PENDING
    (Pending, Starting),
    (Pending, Ignored),
    (Pending, Terminated),
    // STARTING
    (Starting, Running),
    (Starting, Error),
    (Starting, Terminating),
    // RUNNING
    (Running, Finished),
    (Running, Error),
    (Running, Terminating),
    // TERMINATING: the payload may still report before the kill lands
    (Terminating, Terminated),
    (Terminating, Finished),
    (Terminating, Error),
];
