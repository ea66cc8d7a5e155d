use chrono::{SecondsFormat, Utc};
use serde_json::Value;

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn get_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub fn get_i64(params: &Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn get_opt_trimmed(params: &Value, key: &str) -> Result<Option<String>, String> {
    opt_trimmed(params.get(key), key)
}

/// Trimmed string, `None` for absent, null or blank values.
pub fn opt_trimmed(value: Option<&Value>, key: &str) -> Result<Option<String>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(format!("{} must be a string or null", key)),
    }
}
