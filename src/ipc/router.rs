use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "ipc request");

    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::seasons::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::families::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::balances::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::billing::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::setup::try_handle(state, &req) {
        return resp;
    }

    tracing::warn!(method = %req.method, "unknown ipc method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
