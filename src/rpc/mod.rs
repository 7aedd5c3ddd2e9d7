//! RPC over the message broker.
//!
//! Patterns:
//!   - **Calls**: private reply queue + correlation id, blocking or polled,
//!     bounded by a deadline (RpcTimeout, never a silent null)
//!   - **Dispatch**: payload requests whose replies come back on the
//!     orchestrator's shared payload-response queue, matched through durable
//!     correlation records
//!   - **Notifications**: fire-and-forget through the [`Outbox`]
//!   - **Scheduler delegation**: [`SchedulerClient`]

mod client;
mod correlation;
mod messages;
mod outbox;
mod scheduler;

pub use client::{PendingCall, RpcClient};
pub use correlation::CorrelationRegistry;
pub use messages::{events, ControlReply, EventMessage, PayloadReply, PayloadRequest, ResultCode};
pub use outbox::{Outbox, PublishOutcome};
pub use scheduler::{Job, JobSpec, JobState, SchedulerAction, SchedulerClient};

/// Queue carrying payload requests to worker `name`.
pub fn worker_payload_queue(name: &str) -> String {
    format!("sortie.worker.{}.payload.request", name)
}

/// Queue carrying control events to worker `name`.
pub fn worker_control_queue(name: &str) -> String {
    format!("sortie.worker.{}.control.request", name)
}
