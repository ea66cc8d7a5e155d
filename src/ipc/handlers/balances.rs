use crate::billing::money;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_i64, get_str, now_rfc3339};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{amount_from_json, parse_timestamp, MAX_AMOUNT_MAGNITUDE};
use chrono::SecondsFormat;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

fn row_exists(conn: &Connection, sql: &str, id: &dyn rusqlite::ToSql) -> rusqlite::Result<bool> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
}

fn handle_types_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "types": [] }));
    };
    let mut stmt = match conn.prepare("SELECT id, label FROM balance_types ORDER BY label") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: i64 = row.get(0)?;
            let label: String = row.get(1)?;
            Ok(json!({ "id": id, "label": label }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(types) => ok(&req.id, json!({ "types": types })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_types_create(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let label = match get_str(&req.params, "label") {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing label", None),
    };
    if label.is_empty() {
        return err(&req.id, "bad_params", "label must not be empty", None);
    }
    if let Err(e) = conn.execute("INSERT INTO balance_types(label) VALUES(?)", [&label]) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "balance_types" })),
        );
    }
    ok(
        &req.id,
        json!({ "typeId": conn.last_insert_rowid(), "label": label }),
    )
}

fn amount_message() -> String {
    format!(
        "amount must be a decimal number with magnitude <= {}",
        MAX_AMOUNT_MAGNITUDE
    )
}

/// `Ok(None)` when the key is absent, `Ok(Some(None))` for an explicit null.
fn parse_type_id(params: &Value) -> Result<Option<Option<i64>>, String> {
    match params.get("typeId") {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(v) => match v.as_i64() {
            Some(n) => Ok(Some(Some(n))),
            None => Err("typeId must be an integer or null".into()),
        },
    }
}

fn check_type(conn: &Connection, req: &Request, type_id: Option<i64>) -> Option<Value> {
    let type_id = type_id?;
    match row_exists(conn, "SELECT 1 FROM balance_types WHERE id = ?", &type_id) {
        Ok(true) => None,
        Ok(false) => Some(err(&req.id, "not_found", "balance type not found", None)),
        Err(e) => Some(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn handle_balances_create(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(season_id) = get_str(&req.params, "seasonId") else {
        return err(&req.id, "bad_params", "missing seasonId", None);
    };
    let Some(family_id) = get_i64(&req.params, "familyId") else {
        return err(&req.id, "bad_params", "missing familyId", None);
    };
    let Some(raw_amount) = req.params.get("amount") else {
        return err(&req.id, "bad_params", "missing amount", None);
    };
    let Some(amount) = amount_from_json(raw_amount) else {
        return err(&req.id, "bad_params", amount_message(), None);
    };
    let type_id = match parse_type_id(&req.params) {
        Ok(v) => v.flatten(),
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let timestamp = match get_str(&req.params, "timestamp") {
        None => now_rfc3339(),
        Some(raw) => match parse_timestamp(raw) {
            Some(ts) => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => return err(&req.id, "bad_params", "timestamp must be RFC 3339", None),
        },
    };

    match row_exists(conn, "SELECT 1 FROM seasons WHERE id = ?", &season_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "season not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match row_exists(conn, "SELECT 1 FROM families WHERE id = ?", &family_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "family not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Some(resp) = check_type(conn, req, type_id) {
        return resp;
    }

    if let Err(e) = conn.execute(
        "INSERT INTO balances(season_id, family_id, type_id, amount, updated_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            season_id,
            family_id,
            type_id,
            money(amount).to_string(),
            &timestamp,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "balances" })),
        );
    }

    let transaction_id = conn.last_insert_rowid();
    tracing::debug!(transaction_id, season_id, family_id, %amount, "balance recorded");
    ok(
        &req.id,
        json!({ "transactionId": transaction_id, "timestamp": timestamp }),
    )
}

fn handle_balances_update(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(transaction_id) = get_i64(&req.params, "transactionId") else {
        return err(&req.id, "bad_params", "missing transactionId", None);
    };
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };
    if let Some(key) = patch
        .as_object()
        .and_then(|o| o.keys().find(|k| *k != "amount" && *k != "typeId"))
    {
        return err(&req.id, "bad_params", format!("unknown balance field: {}", key), None);
    }

    let amount = match patch.get("amount") {
        None => None,
        Some(v) => match amount_from_json(v) {
            Some(a) => Some(a),
            None => return err(&req.id, "bad_params", amount_message(), None),
        },
    };
    let type_id = match parse_type_id(patch) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    if amount.is_none() && type_id.is_none() {
        return err(&req.id, "bad_params", "patch must not be empty", None);
    }

    match row_exists(conn, "SELECT 1 FROM balances WHERE id = ?", &transaction_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "balance not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Some(resp) = check_type(conn, req, type_id.flatten()) {
        return resp;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Some(a) = amount {
        if let Err(e) = tx.execute(
            "UPDATE balances SET amount = ? WHERE id = ?",
            (money(a).to_string(), transaction_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(t) = type_id {
        if let Err(e) = tx.execute(
            "UPDATE balances SET type_id = ? WHERE id = ?",
            (t, transaction_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.execute(
        "UPDATE balances SET updated_at = ? WHERE id = ?",
        (now_rfc3339(), transaction_id),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_balances_delete(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(transaction_id) = get_i64(&req.params, "transactionId") else {
        return err(&req.id, "bad_params", "missing transactionId", None);
    };
    match conn.execute("DELETE FROM balances WHERE id = ?", [transaction_id]) {
        Ok(0) => err(&req.id, "not_found", "balance not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "balances" })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "balanceTypes.list" => Some(handle_types_list(state, req)),
        "balanceTypes.create" => Some(handle_types_create(state, req)),
        "balances.create" => Some(handle_balances_create(state, req)),
        "balances.update" => Some(handle_balances_update(state, req)),
        "balances.delete" => Some(handle_balances_delete(state, req)),
        _ => None,
    }
}
