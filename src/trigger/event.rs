//! Event-based trigger arguments and the worker-side registration contract.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::types::{Error, Result, TriggerId};

/// Parameter a request must carry for a route to match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpParameter {
    pub name: String,
    /// Required value; `None` accepts any value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRoute {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub parameters: Vec<HttpParameter>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl HttpRoute {
    /// Whether `method path` with `params` satisfies this route. Returns the
    /// captured parameters on a match.
    pub fn matches(&self, method: &str, path: &str, params: &BTreeMap<String, String>) -> Option<Map<String, Value>> {
        if !self.method.eq_ignore_ascii_case(method) || self.path != path {
            return None;
        }
        let mut captured = Map::new();
        for required in &self.parameters {
            let actual = params.get(&required.name)?;
            if let Some(expected) = &required.value {
                if expected != actual {
                    return None;
                }
            }
            captured.insert(required.name.clone(), Value::String(actual.clone()));
        }
        Some(captured)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpArgs {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    pub routes: Vec<HttpRoute>,
}

/// Session detection filter: every key must equal the session's field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionArgs {
    pub filter: BTreeMap<String, String>,
}

impl SessionArgs {
    pub fn matches(&self, session: &Value) -> bool {
        self.filter.iter().all(|(key, expected)| match session.get(key) {
            Some(Value::String(actual)) => actual == expected,
            Some(other) => other.to_string() == *expected,
            None => false,
        })
    }
}

/// Listener family and arguments realized on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ListenerSpec {
    Http(HttpArgs),
    Session(SessionArgs),
}

impl ListenerSpec {
    pub(crate) fn check(&self) -> Result<()> {
        match self {
            ListenerSpec::Http(args) => {
                if args.routes.is_empty() {
                    return Err(Error::validation("http trigger needs at least one route"));
                }
                if let Some(route) = args.routes.iter().find(|r| !r.path.starts_with('/')) {
                    return Err(Error::validation(format!(
                        "http route '{}' must start with '/'",
                        route.path
                    )));
                }
                Ok(())
            }
            ListenerSpec::Session(args) if args.filter.is_empty() => {
                Err(Error::validation("session trigger needs a non-empty filter"))
            }
            ListenerSpec::Session(_) => Ok(()),
        }
    }
}

/// `add_trigger` payload sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRegistration {
    pub trigger_id: TriggerId,
    /// Queue receiving the `trigger_stage` notification.
    pub reply_queue: String,
    pub listener: ListenerSpec,
}

/// `trigger_stage` payload published by a worker when a trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerFired {
    pub trigger_id: TriggerId,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn route() -> HttpRoute {
        HttpRoute {
            path: "/hook".into(),
            method: "POST".into(),
            parameters: vec![
                HttpParameter {
                    name: "token".into(),
                    value: Some("s3cret".into()),
                },
                HttpParameter {
                    name: "host".into(),
                    value: None,
                },
            ],
        }
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_route_match_captures_parameters() {
        let captured = route()
            .matches("post", "/hook", &params(&[("token", "s3cret"), ("host", "10.0.0.9"), ("x", "1")]))
            .unwrap();
        assert_eq!(Value::Object(captured), json!({"token": "s3cret", "host": "10.0.0.9"}));
    }

    #[test]
    fn test_route_mismatch() {
        let r = route();
        assert!(r.matches("GET", "/hook", &params(&[("token", "s3cret"), ("host", "a")])).is_none());
        assert!(r.matches("POST", "/other", &params(&[("token", "s3cret"), ("host", "a")])).is_none());
        assert!(r.matches("POST", "/hook", &params(&[("token", "wrong"), ("host", "a")])).is_none());
        assert!(r.matches("POST", "/hook", &params(&[("token", "s3cret")])).is_none());
    }

    #[test]
    fn test_session_filter() {
        let args = SessionArgs {
            filter: [("type".to_string(), "shell".to_string())].into_iter().collect(),
        };
        assert!(args.matches(&json!({"id": 4, "type": "shell"})));
        assert!(!args.matches(&json!({"id": 4, "type": "meterpreter"})));
        assert!(!args.matches(&json!({"id": 4})));
    }

    #[test]
    fn test_listener_spec_tagged() {
        let spec = ListenerSpec::Session(SessionArgs {
            filter: [("via_exploit".to_string(), "ssh".to_string())].into_iter().collect(),
        });
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["kind"], json!("session"));
        assert_eq!(serde_json::from_value::<ListenerSpec>(value).unwrap(), spec);
    }
}
