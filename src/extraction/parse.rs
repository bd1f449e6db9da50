//! Parsing of model output into raw record objects.

use serde_json::{Map, Value};

use super::ExtractionError;

/// Object keys that may wrap the record array.
const WRAPPER_KEYS: &[&str] = &["deals", "data", "items", "results"];

fn strip_fences(text: &str) -> &str {
    let mut raw = text.trim();
    for prefix in ["```json", "```JSON", "```"] {
        if let Some(rest) = raw.strip_prefix(prefix) {
            raw = rest.trim_start();
            break;
        }
    }
    if let Some(rest) = raw.strip_suffix("```") {
        raw = rest.trim_end();
    }
    raw.trim()
}

fn objects(items: Vec<Value>) -> Vec<Map<String, Value>> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

fn from_value(value: Value) -> Option<Vec<Map<String, Value>>> {
    match value {
        Value::Array(items) => Some(objects(items)),
        Value::Object(mut map) => {
            for key in WRAPPER_KEYS {
                if let Some(Value::Array(_)) = map.get(*key) {
                    if let Some(Value::Array(items)) = map.remove(*key) {
                        return Some(objects(items));
                    }
                }
            }
            Some(vec![map])
        }
        _ => None,
    }
}

/// Slice from the first `open` to the last `close`, if both exist in order.
fn enclosed(raw: &str, open: char, close: char) -> Option<&str> {
    let start = raw.find(open)?;
    let end = raw.rfind(close)?;
    (end > start).then(|| &raw[start..=end])
}

/// Turn model text into raw record objects.
///
/// Accepts a JSON array, an object wrapping an array under one of the usual
/// keys, or a single record object, optionally inside markdown fences or
/// surrounded by prose. Empty text means no records. Anything else is
/// `Malformed`.
pub fn parse_records(text: &str) -> Result<Vec<Map<String, Value>>, ExtractionError> {
    let raw = strip_fences(text);
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if let Some(records) = from_value(value) {
            return Ok(records);
        }
    }

    let candidates = [enclosed(raw, '[', ']'), enclosed(raw, '{', '}')];
    for candidate in candidates.into_iter().flatten() {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if let Some(records) = from_value(value) {
                return Ok(records);
            }
        }
    }

    let preview: String = raw.chars().take(120).collect();
    Err(ExtractionError::Malformed(preview))
}
