//! Message bodies exchanged over the broker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::{Error, Result};

/// Event types carried by [`EventMessage`].
pub mod events {
    // Orchestrator event queue
    pub const TRIGGER_STAGE: &str = "trigger_stage";
    pub const SCHEDULED_STAGE: &str = "scheduled_stage";
    pub const SCHEDULED_RUN: &str = "scheduled_run";

    // Worker control queue
    pub const HEALTH_CHECK: &str = "health_check";
    pub const VALIDATE_MODULE: &str = "validate_module";
    pub const ADD_TRIGGER: &str = "add_trigger";
    pub const REMOVE_TRIGGER: &str = "remove_trigger";
    pub const LIST_TRIGGERS: &str = "list_triggers";
    pub const KILL_STEP_EXECUTION: &str = "kill_step_execution";
}

/// Outcome of a payload run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultCode {
    Ok,
    Fail,
    Error,
    Stopped,
}

impl ResultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Ok => "ok",
            ResultCode::Fail => "fail",
            ResultCode::Error => "error",
            ResultCode::Stopped => "stopped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ok" => Some(ResultCode::Ok),
            "fail" => Some(ResultCode::Fail),
            "error" => Some(ResultCode::Error),
            "stopped" => Some(ResultCode::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{event_type, event_payload}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event_type: String,
    #[serde(default)]
    pub event_payload: Value,
}

impl EventMessage {
    pub fn new(event_type: impl Into<String>, event_payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            event_payload,
        }
    }

    pub fn to_body(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_body(body: &Value) -> Result<Self> {
        Self::deserialize(body).map_err(|e| Error::validation(format!("invalid event message: {}", e)))
    }

    /// Typed view of the payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.event_payload).map_err(|e| {
            Error::validation(format!("invalid {} payload: {}", self.event_type, e))
        })
    }
}

/// `{module, arguments, ack_queue?}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadRequest {
    pub module: String,
    #[serde(default)]
    pub arguments: Value,
    /// Queue receiving an early acknowledgement once the task is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_queue: Option<String>,
}

impl PayloadRequest {
    pub fn from_body(body: &Value) -> Result<Self> {
        Self::deserialize(body).map_err(|e| Error::validation(format!("invalid payload request: {}", e)))
    }
}

/// Reply to a [`PayloadRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadReply {
    pub result: ResultCode,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub serialized_output: Value,
}

impl PayloadReply {
    pub fn new(result: ResultCode, output: impl Into<String>) -> Self {
        Self {
            result,
            output: output.into(),
            serialized_output: Value::Null,
        }
    }

    pub fn from_body(body: &Value) -> Result<Self> {
        Self::deserialize(body).map_err(|e| Error::validation(format!("invalid payload reply: {}", e)))
    }
}

/// Reply to a control event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: String,
}

impl ControlReply {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result,
            error: String::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: error.into(),
        }
    }

    pub fn from_outcome(outcome: Result<Value>) -> Self {
        match outcome {
            Ok(result) => Self::ok(result),
            Err(e) => Self::failure(e.to_string()),
        }
    }

    pub fn from_body(body: &Value) -> Result<Self> {
        Self::deserialize(body).map_err(|e| Error::validation(format!("invalid control reply: {}", e)))
    }

    /// `Ok(result)` on success, the reported error text otherwise.
    pub fn into_result(self) -> std::result::Result<Value, String> {
        if self.success {
            Ok(self.result)
        } else {
            Err(self.error)
        }
    }
}
