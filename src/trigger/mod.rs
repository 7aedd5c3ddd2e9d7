//! Stage triggers.
//!
//! A closed set of strategies sharing one contract: [`TriggerSpec::start`]
//! arms the trigger and returns its handle, [`TriggerSpec::stop`] disarms it.
//!
//!   - **Immediate**: nothing to arm, the caller starts the stage now
//!   - **Delta / Datetime**: a job on the scheduler service whose body is a
//!     `scheduled_stage` event on the orchestrator event queue
//!   - **Http / Session**: a listener on the bound worker, armed and disarmed
//!     through `add_trigger` / `remove_trigger` control calls; the worker
//!     publishes `trigger_stage` when it fires

mod event;
mod time;

pub use event::{
    HttpArgs, HttpParameter, HttpRoute, ListenerSpec, SessionArgs, TriggerFired, TriggerRegistration,
};
pub use time::{DatetimeArgs, DeltaArgs};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::definition::TriggerKind;
use crate::rpc::{events, worker_control_queue, EventMessage, JobSpec, RpcClient, SchedulerClient};
use crate::types::{Error, JobId, Result, StageExecutionId, TriggerId};

/// Parsed trigger of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    Immediate,
    Delta(DeltaArgs),
    Datetime(DatetimeArgs),
    Http(HttpArgs),
    Session(SessionArgs),
}

/// What arming produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerStart {
    /// Handle for [`TriggerSpec::stop`]; `None` for immediate triggers.
    pub trigger_id: Option<String>,
    /// Fire time of time-based triggers.
    pub schedule_time: Option<DateTime<Utc>>,
}

/// Collaborators and facts needed to arm or disarm a stage's trigger.
#[derive(Debug, Clone)]
pub struct TriggerContext<'a> {
    pub stage_execution_id: &'a StageExecutionId,
    /// Name of the worker bound to the plan execution.
    pub worker: &'a str,
    pub plan_start: Option<DateTime<Utc>>,
    pub paused_total: chrono::Duration,
    pub event_queue: &'a str,
    pub scheduler: &'a SchedulerClient,
    pub rpc: &'a RpcClient,
    pub rpc_timeout: Duration,
}

impl TriggerSpec {
    /// Parse `args` for `kind`. Argument errors are Validation.
    pub fn parse(kind: TriggerKind, args: &Value) -> Result<Self> {
        fn typed<T: serde::de::DeserializeOwned>(kind: &str, args: &Value) -> Result<T> {
            let args = if args.is_null() { json!({}) } else { args.clone() };
            serde_json::from_value(args)
                .map_err(|e| Error::validation(format!("invalid {} trigger arguments: {}", kind, e)))
        }

        let spec = match kind {
            TriggerKind::Immediate => TriggerSpec::Immediate,
            TriggerKind::Delta => TriggerSpec::Delta(typed("delta", args)?),
            TriggerKind::Datetime => {
                let parsed: DatetimeArgs = typed("datetime", args)?;
                parsed.resolve()?;
                TriggerSpec::Datetime(parsed)
            }
            TriggerKind::Http => TriggerSpec::Http(typed("http", args)?),
            TriggerKind::Session => TriggerSpec::Session(typed("session", args)?),
        };
        if let Some(listener) = spec.listener() {
            listener.check()?;
        }
        Ok(spec)
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerSpec::Immediate => TriggerKind::Immediate,
            TriggerSpec::Delta(_) => TriggerKind::Delta,
            TriggerSpec::Datetime(_) => TriggerKind::Datetime,
            TriggerSpec::Http(_) => TriggerKind::Http,
            TriggerSpec::Session(_) => TriggerKind::Session,
        }
    }

    pub fn is_time_based(&self) -> bool {
        matches!(self, TriggerSpec::Delta(_) | TriggerSpec::Datetime(_))
    }

    pub fn is_event_based(&self) -> bool {
        matches!(self, TriggerSpec::Http(_) | TriggerSpec::Session(_))
    }

    /// Worker listener realizing an event trigger.
    pub fn listener(&self) -> Option<ListenerSpec> {
        match self {
            TriggerSpec::Http(args) => Some(ListenerSpec::Http(args.clone())),
            TriggerSpec::Session(args) => Some(ListenerSpec::Session(args.clone())),
            _ => None,
        }
    }

    /// Fire time for time-based triggers.
    pub fn fire_time(
        &self,
        plan_start: Option<DateTime<Utc>>,
        paused_total: chrono::Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        match self {
            TriggerSpec::Delta(delta) => Ok(Some(
                delta.resolve(plan_start.unwrap_or_else(Utc::now), paused_total),
            )),
            TriggerSpec::Datetime(datetime) => datetime.resolve().map(Some),
            _ => Ok(None),
        }
    }

    pub async fn start(&self, ctx: &TriggerContext<'_>) -> Result<TriggerStart> {
        if let Some(run_at) = self.fire_time(ctx.plan_start, ctx.paused_total)? {
            let event = EventMessage::new(
                events::SCHEDULED_STAGE,
                json!({"stage_execution_id": ctx.stage_execution_id}),
            );
            let job_id = ctx
                .scheduler
                .add_job(JobSpec::once(run_at, ctx.event_queue, event.to_body()?))
                .await?;
            tracing::info!(
                stage_execution_id = %ctx.stage_execution_id,
                job_id = %job_id,
                %run_at,
                "time trigger armed"
            );
            return Ok(TriggerStart {
                trigger_id: Some(job_id.to_string()),
                schedule_time: Some(run_at),
            });
        }

        if let Some(listener) = self.listener() {
            let registration = TriggerRegistration {
                trigger_id: TriggerId::new(),
                reply_queue: ctx.event_queue.to_string(),
                listener,
            };
            let event = EventMessage::new(events::ADD_TRIGGER, serde_json::to_value(&registration)?);
            ctx.rpc
                .call_control(&worker_control_queue(ctx.worker), &event, ctx.rpc_timeout, |message| {
                    Error::validation(format!("worker {} rejected trigger: {}", ctx.worker, message))
                })
                .await?;
            tracing::info!(
                stage_execution_id = %ctx.stage_execution_id,
                trigger_id = %registration.trigger_id,
                worker = ctx.worker,
                "event trigger armed"
            );
            return Ok(TriggerStart {
                trigger_id: Some(registration.trigger_id.to_string()),
                schedule_time: None,
            });
        }

        Ok(TriggerStart::default())
    }

    pub async fn stop(&self, ctx: &TriggerContext<'_>, trigger_id: &str) -> Result<()> {
        if self.is_time_based() {
            let job_id = JobId::from_string(trigger_id.to_string()).map_err(Error::validation)?;
            ctx.scheduler.remove_job(&job_id).await?;
        } else if self.is_event_based() {
            let event = EventMessage::new(events::REMOVE_TRIGGER, json!({"trigger_id": trigger_id}));
            ctx.rpc
                .call_control(&worker_control_queue(ctx.worker), &event, ctx.rpc_timeout, |message| {
                    Error::internal(format!("worker {} failed to remove trigger: {}", ctx.worker, message))
                })
                .await?;
        }
        tracing::info!(stage_execution_id = %ctx.stage_execution_id, trigger_id, "trigger disarmed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_immediate_ignores_null_args() {
        assert_eq!(
            TriggerSpec::parse(TriggerKind::Immediate, &Value::Null).unwrap(),
            TriggerSpec::Immediate
        );
    }

    #[test]
    fn test_parse_delta() {
        let spec = TriggerSpec::parse(TriggerKind::Delta, &json!({"minutes": 5})).unwrap();
        assert_eq!(
            spec,
            TriggerSpec::Delta(DeltaArgs {
                hours: 0,
                minutes: 5,
                seconds: 0
            })
        );
        assert!(spec.is_time_based());
    }

    #[test]
    fn test_parse_rejects_bad_args() {
        assert!(matches!(
            TriggerSpec::parse(TriggerKind::Delta, &json!({"weeks": 1})),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            TriggerSpec::parse(TriggerKind::Datetime, &json!({"datetime": "soon"})),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            TriggerSpec::parse(TriggerKind::Http, &json!({"port": 8080, "routes": []})),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            TriggerSpec::parse(TriggerKind::Session, &json!({"filter": {}})),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_parse_http() {
        let spec = TriggerSpec::parse(
            TriggerKind::Http,
            &json!({"port": 8080, "routes": [{"path": "/go", "parameters": [{"name": "id"}]}]}),
        )
        .unwrap();
        let TriggerSpec::Http(args) = &spec else {
            panic!("expected http trigger");
        };
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.routes[0].method, "GET");
        assert!(spec.is_event_based());
        assert_eq!(spec.kind(), TriggerKind::Http);
    }

    #[test]
    fn test_fire_time_of_delta_uses_plan_start() {
        let start = Utc::now();
        let spec = TriggerSpec::Delta(DeltaArgs {
            hours: 0,
            minutes: 0,
            seconds: 30,
        });
        let at = spec
            .fire_time(Some(start), chrono::Duration::seconds(5))
            .unwrap()
            .unwrap();
        assert_eq!(at, start + chrono::Duration::seconds(35));
        assert_eq!(TriggerSpec::Immediate.fire_time(None, chrono::Duration::zero()).unwrap(), None);
    }
}
