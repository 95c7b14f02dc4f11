use chrono::NaiveDateTime;
use serde_json::Value;

use crate::types::{MAX_VALID_TEMP_C, MIN_VALID_TEMP_C};

pub const MAX_TELEMETRY_PAYLOAD_BYTES: usize = 1024;
pub const MAX_PLAUSIBLE_POWER_W: f32 = 100_000.0;

pub fn parse_reading(payload: &str, key: Option<&str>) -> Option<f32> {
    let trimmed = payload.trim();
    if trimmed.len() > MAX_TELEMETRY_PAYLOAD_BYTES {
        return None;
    }

    if let Ok(value) = trimmed.parse::<f32>() {
        return value.is_finite().then_some(value);
    }

    let document: Value = serde_json::from_str(trimmed).ok()?;
    let node = match key.map(str::trim).filter(|key| !key.is_empty()) {
        Some(path) if path.contains('.') => path
            .split('.')
            .try_fold(&document, |node, segment| node.get(segment))?,
        Some(name) => find_key(&document, name)?,
        None => &document,
    };

    number_from(node)
}

pub fn parse_power(payload: &str, key: Option<&str>) -> Option<f32> {
    parse_reading(payload, key).filter(|watts| (0.0..=MAX_PLAUSIBLE_POWER_W).contains(watts))
}

pub fn parse_temperature(payload: &str, key: Option<&str>) -> Option<f32> {
    parse_reading(payload, key)
        .filter(|celsius| (MIN_VALID_TEMP_C..=MAX_VALID_TEMP_C).contains(celsius))
}

pub const TIMESTAMP_KEY: &str = "Time";

pub fn parse_timestamp(payload: &str) -> Option<NaiveDateTime> {
    let document: Value = serde_json::from_str(payload.trim()).ok()?;
    let text = document.get(TIMESTAMP_KEY)?.as_str()?.trim();
    text.parse::<NaiveDateTime>()
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

// Age of a dated reading against the local wall clock. Readings dated in the
// future count as fresh.
pub fn reading_age_ms(payload: &str, now: NaiveDateTime) -> Option<u64> {
    let measured = parse_timestamp(payload)?;
    let age_ms = now.signed_duration_since(measured).num_milliseconds();
    Some(u64::try_from(age_ms).unwrap_or(0))
}

fn find_key<'a>(node: &'a Value, name: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map
            .get(name)
            .or_else(|| map.values().find_map(|child| find_key(child, name))),
        Value::Array(items) => items.iter().find_map(|child| find_key(child, name)),
        _ => None,
    }
}

fn number_from(node: &Value) -> Option<f32> {
    let value = match node {
        Value::Number(number) => number.as_f64()? as f32,
        Value::String(text) => text.trim().parse::<f32>().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}
