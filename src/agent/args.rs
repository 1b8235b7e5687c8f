//! Lenient argument decoding.
//!
//! Arguments arrive either as proper JSON from the driver or as strings from
//! the CLI (`--pids=12,13 --timeout=30`). These helpers accept both shapes.

use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// PIDs as a list, a single number, or a comma-separated string.
pub fn pids<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    parse_pids(value.unwrap_or(Value::Null)).map_err(D::Error::custom)
}

/// Strings as a list, a single string, or a comma-separated string.
pub fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    parse_string_list(value.unwrap_or(Value::Null)).map_err(D::Error::custom)
}

/// Seconds as a number or numeric string. Anything else decodes to `None`
/// and the command falls back to its default.
pub fn seconds<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| parse_seconds(&v)))
}

/// A count as a number or numeric string, kept raw so the command can
/// report the malformed value itself.
pub fn raw_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

pub fn parse_pids(value: Value) -> Result<Vec<u32>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Number(n) => pid_from_number(&n).map(|p| vec![p]),
        Value::String(s) => split_csv(&s)
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| format!("Can't parse \"pids\" argument. Value: {}", s))
            })
            .collect(),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Number(n) => pid_from_number(&n),
                Value::String(s) => s
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| format!("Can't parse pid \"{}\"", s)),
                other => Err(format!("Can't parse pid {}", other)),
            })
            .collect(),
        other => Err(format!("Can't parse \"pids\" argument. Value: {}", other)),
    }
}

fn pid_from_number(n: &serde_json::Number) -> Result<u32, String> {
    n.as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| format!("Can't parse pid {}", n))
}

pub fn parse_string_list(value: Value) -> Result<Vec<String>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(split_csv(&s).map(str::to_string).collect()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(format!("Can't parse arguments. Value: {}", other)),
            })
            .collect(),
        other => Err(format!("Can't parse arguments. Value: {}", other)),
    }
}

pub fn parse_seconds(value: &Value) -> Option<f64> {
    let secs = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (secs.is_finite() && secs >= 0.0).then_some(secs)
}

/// Longest wait any command accepts; keeps deadline arithmetic in range.
const MAX_WAIT: Duration = Duration::from_secs(u32::MAX as u64);

/// Turn decoded seconds into a duration, using `default` when absent.
pub fn duration_or(secs: Option<f64>, default: f64) -> Duration {
    Duration::try_from_secs_f64(secs.unwrap_or(default))
        .map_or(MAX_WAIT, |d| d.min(MAX_WAIT))
}

fn split_csv(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty())
}
