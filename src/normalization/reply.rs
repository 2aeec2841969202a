//! Seller reply extraction.
//!
//! The `reply` field arrives in five shapes, tried in this order:
//! an object, a JSON-encoded object, a Python-literal object, plain text,
//! and null/empty.

use serde_json::Value;

use super::literal;

/// Reply text and time (seconds since epoch) of a review.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyInfo {
    pub text: String,
    pub time: Option<i64>,
}

impl ReplyInfo {
    fn from_object(map: &serde_json::Map<String, Value>) -> Self {
        let text = match map.get("comment") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let time = map.get("ctime").and_then(epoch_seconds);
        Self { text, time }
    }

    fn plain(text: &str) -> Self {
        Self {
            text: text.to_string(),
            time: None,
        }
    }
}

/// Extract `(text, time)` from whatever shape `reply` arrived in.
pub fn extract_reply(raw: &Value) -> ReplyInfo {
    match raw {
        Value::Object(map) => ReplyInfo::from_object(map),
        Value::String(s) => from_text(s),
        Value::Null => ReplyInfo::default(),
        Value::Number(n) => ReplyInfo::plain(&n.to_string()),
        Value::Bool(_) | Value::Array(_) => ReplyInfo::default(),
    }
}

fn from_text(raw: &str) -> ReplyInfo {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "None" || trimmed == "null" {
        return ReplyInfo::default();
    }

    if trimmed.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
            return ReplyInfo::from_object(&map);
        }
        if let Some(Value::Object(map)) = literal::parse(trimmed) {
            return ReplyInfo::from_object(&map);
        }
    }

    ReplyInfo::plain(raw)
}

fn epoch_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}
