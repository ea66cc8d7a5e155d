use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_opt_trimmed, now_rfc3339};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use serde_json::json;
use uuid::Uuid;

fn handle_seasons_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "seasons": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.name,
           s.starts_on,
           s.ends_on,
           (SELECT COUNT(*) FROM balances b WHERE b.season_id = s.id) AS balance_count
         FROM seasons s
         ORDER BY s.created_at DESC, s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let starts_on: Option<String> = row.get(2)?;
            let ends_on: Option<String> = row.get(3)?;
            let balance_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "startsOn": starts_on,
                "endsOn": ends_on,
                "balanceCount": balance_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(seasons) => ok(&req.id, json!({ "seasons": seasons })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn parse_date_param(params: &serde_json::Value, key: &str) -> Result<Option<String>, String> {
    let Some(raw) = get_opt_trimmed(params, key)? else {
        return Ok(None);
    };
    match NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
        Ok(d) => Ok(Some(d.format("%Y-%m-%d").to_string())),
        Err(_) => Err(format!("{} must be YYYY-MM-DD", key)),
    }
}

fn handle_seasons_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let starts_on = match parse_date_param(&req.params, "startsOn") {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let ends_on = match parse_date_param(&req.params, "endsOn") {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    if let (Some(s), Some(e)) = (&starts_on, &ends_on) {
        if e < s {
            return err(&req.id, "bad_params", "endsOn must not precede startsOn", None);
        }
    }

    let season_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO seasons(id, name, starts_on, ends_on, created_at) VALUES(?, ?, ?, ?, ?)",
        (&season_id, &name, &starts_on, &ends_on, now_rfc3339()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "seasons" })),
        );
    }

    ok(&req.id, json!({ "seasonId": season_id, "name": name }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "seasons.list" => Some(handle_seasons_list(state, req)),
        "seasons.create" => Some(handle_seasons_create(state, req)),
        _ => None,
    }
}
