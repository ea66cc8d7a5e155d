use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ledger::BillingSettings;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Billing,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "billing" => Some(Self::Billing),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Billing => "setup.billing",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Billing => {
            serde_json::to_value(BillingSettings::default()).unwrap_or_else(|_| json!({}))
        }
    }
}

fn as_object_mut(v: &mut Value) -> Result<&mut Map<String, Value>, String> {
    v.as_object_mut()
        .ok_or_else(|| "section value must be an object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let Some(n) = v.as_i64() else {
        return Err(format!("{} must be an integer", key));
    };
    if n < min || n > max {
        return Err(format!("{} must be between {} and {}", key, min, max));
    }
    Ok(n)
}

fn parse_label(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let Some(s) = v.as_str() else {
        return Err(format!("{} must be a string", key));
    };
    let s = s.trim();
    if s.is_empty() {
        return Err(format!("{} must not be empty", key));
    }
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Billing => match k.as_str() {
                "recentActivityLimit" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 10)?));
                }
                "unknownTypeLabel" | "unknownFamilyLabel" => {
                    obj.insert(k.clone(), Value::String(parse_label(v, k, 32)?));
                }
                _ => return Err(format!("unknown billing field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Apply saved fields individually; an invalid one keeps its default.
            for (k, v) in saved_obj {
                let mut single = Map::new();
                single.insert(k.clone(), v.clone());
                let _ = merge_section_patch(section, &mut current, &single);
            }
        }
    }
    Ok(current)
}

pub fn billing_settings(conn: &rusqlite::Connection) -> anyhow::Result<BillingSettings> {
    let value = load_section(conn, SetupSection::Billing)?;
    Ok(serde_json::from_value(value)?)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let billing = match load_section(conn, SetupSection::Billing) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "billing": billing }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section.key(), "setup section updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
