use serde_json::Value;

use crate::errors::{Error, Result};

/// Field names that may carry the alcohol level, in priority order.
pub const LEVEL_FIELDS: [&str; 6] = [
    "alcohol_level",
    "alcoholLevel",
    "alcohol",
    "level",
    "value",
    "sensor_value",
];

/// Extracts the alcohol level from a broker payload.
///
/// JSON objects are searched for the first recognised field; anything that is
/// not an object (or has no usable field) is retried as a bare number.
pub fn decode_alcohol_level(payload: &[u8]) -> Result<i32> {
    if let Ok(value) = serde_json::from_slice::<Value>(payload) {
        if let Some(level) = level_from_value(&value) {
            return Ok(level);
        }
    }

    let text = std::str::from_utf8(payload)
        .map_err(|e| Error::Decode(format!("payload is not UTF-8: {}", e)))?;
    parse_number(text.trim().trim_matches('"'))
        .ok_or_else(|| Error::Decode(format!("no alcohol level in payload '{}'", preview(text))))
}

fn level_from_value(value: &Value) -> Option<i32> {
    let object = value.as_object()?;
    LEVEL_FIELDS
        .iter()
        .find_map(|field| object.get(*field).and_then(number_from_field))
}

fn number_from_field(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .and_then(|n| i32::try_from(n).ok()),
        Value::String(s) => parse_number(s.trim()),
        _ => None,
    }
}

fn parse_number(text: &str) -> Option<i32> {
    if text.is_empty() {
        return None;
    }
    if let Ok(n) = text.parse::<i32>() {
        return Some(n);
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite() && *f >= i32::MIN as f64 && *f <= i32::MAX as f64)
        .map(|f| f.round() as i32)
}

fn preview(text: &str) -> String {
    text.chars().take(64).collect()
}
