use crate::billing::Ledger;
use crate::ipc::error::{billing_err, err, ok};
use crate::ipc::handlers::setup::billing_settings;
use crate::ipc::helpers::{get_i64, get_str};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{compute_season_ledger, LedgerContext};
use serde_json::{json, Value};

fn load_ledger(state: &AppState, req: &Request) -> Result<(String, Ledger), Value> {
    let Some(conn) = state.db.as_ref() else {
        return Err(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let Some(season_id) = get_str(&req.params, "seasonId") else {
        return Err(err(&req.id, "bad_params", "missing seasonId", None));
    };
    let settings = billing_settings(conn)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let ctx = LedgerContext { conn, season_id };
    let ledger = compute_season_ledger(&ctx, &settings).map_err(|e| billing_err(&req.id, e))?;
    Ok((season_id.to_string(), ledger))
}

fn handle_billing_ledger(state: &mut AppState, req: &Request) -> Value {
    let (season_id, ledger) = match load_ledger(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mut result = match serde_json::to_value(&ledger) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "serialize_failed", e.to_string(), None),
    };
    result["seasonId"] = json!(season_id);
    ok(&req.id, result)
}

fn handle_billing_summary(state: &mut AppState, req: &Request) -> Value {
    let (season_id, ledger) = match load_ledger(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    ok(
        &req.id,
        json!({
            "seasonId": season_id,
            "summary": ledger.summary,
            "familyCount": ledger.family_rows.len(),
            "transactionCount": ledger.global_rows.len()
        }),
    )
}

fn handle_billing_family(state: &mut AppState, req: &Request) -> Value {
    if state.db.is_none() {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    }
    let Some(family_id) = get_i64(&req.params, "familyId") else {
        return err(&req.id, "bad_params", "missing familyId", None);
    };
    let (season_id, ledger) = match load_ledger(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match ledger
        .family_rows
        .into_iter()
        .find(|f| f.family_id == family_id)
    {
        Some(family) => ok(&req.id, json!({ "seasonId": season_id, "family": family })),
        None => err(
            &req.id,
            "not_found",
            "family has no balances in this season",
            Some(json!({ "familyId": family_id })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "billing.ledger" => Some(handle_billing_ledger(state, req)),
        "billing.summary" => Some(handle_billing_summary(state, req)),
        "billing.family" => Some(handle_billing_family(state, req)),
        _ => None,
    }
}
