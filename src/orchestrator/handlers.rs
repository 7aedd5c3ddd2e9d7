//! Routing of inbound orchestrator messages into the engine.

use serde::Deserialize;

use crate::broker::Message;
use crate::engine::Engine;
use crate::rpc::{events, EventMessage, PayloadReply};
use crate::trigger::TriggerFired;
use crate::types::{Result, RunId, StageExecutionId};

#[derive(Debug, Deserialize)]
struct ScheduledStage {
    stage_execution_id: StageExecutionId,
}

#[derive(Debug, Deserialize)]
struct ScheduledRun {
    run_id: RunId,
}

/// A payload reply from a worker. Replies without a correlation id, or whose
/// id stays unknown past the grace period, are discarded.
pub(crate) async fn handle_payload_reply(engine: &Engine, message: Message) -> Result<()> {
    let Some(correlation_id) = message.correlation_id else {
        tracing::warn!("payload reply without correlation id dropped");
        return Ok(());
    };
    let reply = PayloadReply::from_body(&message.body)?;
    let Some(pending) = engine.correlations().resolve(&correlation_id).await? else {
        return Ok(());
    };
    engine.handle_reply(pending, reply).await
}

/// An event on the orchestrator event queue.
pub(crate) async fn handle_event(engine: &Engine, message: Message) -> Result<()> {
    let event = EventMessage::from_body(&message.body)?;
    tracing::debug!(event_type = %event.event_type, "event received");
    match event.event_type.as_str() {
        events::TRIGGER_STAGE => engine.on_trigger_fired(event.payload::<TriggerFired>()?).await,
        events::SCHEDULED_STAGE => {
            let payload: ScheduledStage = event.payload()?;
            engine.on_scheduled_stage(&payload.stage_execution_id).await
        }
        events::SCHEDULED_RUN => {
            let payload: ScheduledRun = event.payload()?;
            engine.on_scheduled_run(&payload.run_id).await
        }
        other => {
            tracing::warn!(event_type = other, "unknown event dropped");
            Ok(())
        }
    }
}
