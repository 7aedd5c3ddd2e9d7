//! Step argument resolution.
//!
//! Before dispatch, a step's arguments are rewritten:
//!   - `{{ name }}` placeholders take execution variables
//!   - string values `$parent`, `$trigger` and `$<step>` (optionally followed
//!     by `.field.path`) take the output of the authorizing parent, the
//!     firing trigger's parameters, or a finished step of the same stage
//!   - `use_named_session: <name>` becomes `session_id: <stored handle>`

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::types::{Error, Result};

pub const USE_NAMED_SESSION: &str = "use_named_session";
pub const CREATE_NAMED_SESSION: &str = "create_named_session";
pub const SESSION_ID: &str = "session_id";

fn placeholder() -> Option<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").ok())
        .as_ref()
}

/// Values available to a step's arguments.
#[derive(Debug, Default)]
pub struct ResolveContext<'a> {
    pub variables: HashMap<String, Value>,
    pub parent_output: Option<Value>,
    pub trigger_output: Option<&'a Value>,
    /// Outputs of finished steps of the stage, by step name.
    pub step_outputs: Option<&'a Map<String, Value>>,
    /// Session handles of the plan execution, by name.
    pub sessions: HashMap<String, Value>,
}

pub fn resolve(arguments: &Value, ctx: &ResolveContext<'_>) -> Result<Value> {
    let mut resolved = substitute(arguments, ctx)?;
    if let Value::Object(map) = &mut resolved {
        if let Some(name) = map.remove(USE_NAMED_SESSION) {
            let name = name
                .as_str()
                .ok_or_else(|| Error::validation("use_named_session must be a string"))?;
            let session = ctx
                .sessions
                .get(name)
                .ok_or_else(|| Error::validation(format!("unknown named session '{}'", name)))?;
            map.insert(SESSION_ID.to_string(), session.clone());
        }
    }
    Ok(resolved)
}

fn substitute(value: &Value, ctx: &ResolveContext<'_>) -> Result<Value> {
    match value {
        Value::String(text) => substitute_str(text, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, ctx))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), substitute(item, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_str(text: &str, ctx: &ResolveContext<'_>) -> Result<Value> {
    if let Some(reference) = text.strip_prefix('$') {
        if let Some(value) = reference_value(reference, ctx)? {
            return Ok(value);
        }
    }

    let Some(re) = placeholder() else {
        return Ok(Value::String(text.to_string()));
    };
    // A lone placeholder keeps the variable's JSON type.
    if let Some(caps) = re.captures(text) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(text.len()) {
            if let Some(value) = ctx.variables.get(&caps[1]) {
                return Ok(value.clone());
            }
        }
    }

    let replaced = re.replace_all(text, |caps: &Captures<'_>| match ctx.variables.get(&caps[1]) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => caps[0].to_string(),
    });
    Ok(Value::String(replaced.into_owned()))
}

/// `None` when the reference names nothing known, so the string is kept
/// literally.
fn reference_value(reference: &str, ctx: &ResolveContext<'_>) -> Result<Option<Value>> {
    let mut parts = reference.split('.');
    let head = parts.next().unwrap_or_default();
    let root = match head {
        "parent" => ctx
            .parent_output
            .clone()
            .ok_or_else(|| Error::validation("$parent used by a step without a parent"))?,
        "trigger" => ctx
            .trigger_output
            .cloned()
            .ok_or_else(|| Error::validation("$trigger used before the trigger fired"))?,
        name => match ctx.step_outputs.and_then(|outputs| outputs.get(name)) {
            Some(output) => output.clone(),
            None => return Ok(None),
        },
    };

    let mut current = &root;
    for segment in parts {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| {
            Error::validation(format!("reference ${} does not resolve", reference))
        })?;
    }
    Ok(Some(current.clone()))
}
