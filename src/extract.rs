//! Recovers a JSON value from free-form model output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)```").expect("fence pattern compiles"));

/// Keys that conventionally hold the row list of a wrapper object, in priority order.
const CONTAINER_KEYS: [&str; 6] = ["data", "items", "rows", "list", "results", "values"];

/// First successful strategy wins: a json-tagged fence, then the outermost
/// `[...]`, then the outermost `{...}`. The result is unwrapped to its row list
/// when it is a container object.
pub fn extract(text: &str) -> Option<Value> {
    extract_raw(text).map(normalize_to_tabular)
}

/// Same strategies as [`extract`] without container unwrapping.
pub fn extract_raw(text: &str) -> Option<Value> {
    if let Some(caps) = FENCED_JSON.captures(text)
        && let Ok(value) = serde_json::from_str::<Value>(caps[1].trim())
    {
        return Some(value);
    }
    if let Some(value) = between(text, '[', ']') {
        return Some(value);
    }
    between(text, '{', '}')
}

fn between(text: &str, open: char, close: char) -> Option<Value> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Unwraps `{ "data": [...] }`-style wrappers into their list.
pub fn normalize_to_tabular(value: Value) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };
    for key in CONTAINER_KEYS {
        if matches!(map.get(key), Some(Value::Array(_))) {
            return map.remove(key).unwrap_or(Value::Null);
        }
    }
    let first_list = map
        .iter()
        .find(|(_, v)| v.is_array())
        .map(|(k, _)| k.clone());
    match first_list {
        Some(key) => map.remove(&key).unwrap_or(Value::Null),
        None => Value::Object(map),
    }
}

/// Pretty JSON for json-mode responses, or `{"result": text}` when nothing parses.
pub fn json_or_result(text: &str) -> Value {
    extract_raw(text).unwrap_or_else(|| serde_json::json!({ "result": text }))
}
