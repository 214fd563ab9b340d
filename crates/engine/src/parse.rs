//! Turning free-form model output into typed values.
//!
//! Models wrap JSON in prose and code fences, pick their own key names, and
//! nest arguments one level too deep. Extraction and the small repairs here
//! run before deserialization; anything still invalid is returned as a
//! reason string that goes back to the model verbatim.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use turnkeep_core::action::StepAction;

/// Locate the JSON object in a model reply.
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let body = match trimmed.find("```") {
        Some(start) => {
            let after = &trimmed[start + 3..];
            // Skip a language tag such as ```json
            let after = after.find('\n').map_or(after, |nl| &after[nl + 1..]);
            after.find("```").map_or(after, |end| &after[..end])
        }
        None => trimmed,
    };
    let open = body.find('{')?;
    let close = body.rfind('}')?;
    (close > open).then(|| &body[open..=close])
}

/// Extract and deserialize, reporting a reason the model can act on.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let value = parse_value(text)?;
    serde_json::from_value(value).map_err(|e| format!("JSON did not match the expected shape: {e}"))
}

pub fn parse_value(text: &str) -> Result<Value, String> {
    let raw = extract_json(text).ok_or_else(|| "no JSON object found in the reply".to_string())?;
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))
}

/// Parse a step action, repairing common near-misses first.
pub fn parse_step_action(text: &str) -> Result<StepAction, String> {
    let mut value = parse_value(text)?;
    repair_action(&mut value);
    serde_json::from_value(value).map_err(|e| {
        format!(
            "not a valid action ({e}); use one of tool_call, step_complete, request_schema, \
             ask_user, blocked, fail"
        )
    })
}

/// Normalize an action object in place.
///
/// - `"type"` or `"name"` used instead of `"action"`
/// - action names in any case
/// - a bare datastore request without an `action` key
/// - tool arguments nested under `arguments`, `args`, `params` or `input`
/// - blocked details nested under `blocked`
pub fn repair_action(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };

    if !obj.contains_key("action") {
        for alias in ["type", "name", "kind"] {
            if let Some(v) = obj.remove(alias) {
                obj.insert("action".into(), v);
                break;
            }
        }
    }
    if !obj.contains_key("action") && obj.contains_key("op") {
        obj.insert("action".into(), Value::String("tool_call".into()));
    }
    if let Some(Value::String(action)) = obj.get_mut("action") {
        *action = action.trim().to_lowercase().replace(['-', ' '], "_");
    }

    for nested in ["arguments", "args", "params", "input", "blocked"] {
        let inner = match obj.get(nested) {
            Some(Value::Object(_)) => match obj.remove(nested) {
                Some(Value::Object(inner)) => inner,
                _ => continue,
            },
            // Arguments sent as a JSON string
            Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(inner)) => {
                    obj.remove(nested);
                    inner
                }
                _ => continue,
            },
            _ => continue,
        };
        hoist(obj, inner);
    }

    if let Some(Value::String(code)) = obj.get_mut("reason_code") {
        *code = code.trim().to_uppercase().replace([' ', '-'], "_");
    }
}

fn hoist(target: &mut Map<String, Value>, inner: Map<String, Value>) {
    for (k, v) in inner {
        target.entry(k).or_insert(v);
    }
}
