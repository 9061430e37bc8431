//! Serde helpers for durations written as `"250ms"`, `"10s"`, `"5m"`, `"1h"`
//! or `"1d"`. Bare integers are read as milliseconds.

use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}ms", duration.as_millis()))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
        Raw::Text(s) => parse_duration_str(&s).map_err(serde::de::Error::custom),
    }
}

pub fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit_ms) = if let Some(val) = s.strip_suffix("ms") {
        (val, 1)
    } else if let Some(val) = s.strip_suffix('s') {
        (val, 1_000)
    } else if let Some(val) = s.strip_suffix('m') {
        (val, 60_000)
    } else if let Some(val) = s.strip_suffix('h') {
        (val, 3_600_000)
    } else if let Some(val) = s.strip_suffix('d') {
        (val, 86_400_000)
    } else {
        return Err(format!("unknown duration format: {}", s));
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|e| format!("invalid duration '{}': {}", s, e))?;
    Ok(Duration::from_millis(n.saturating_mul(unit_ms)))
}
