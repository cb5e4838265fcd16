use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");
    let families: [TryHandle; 13] = [
        handlers::core::try_handle,
        handlers::auth::try_handle,
        handlers::setup::try_handle,
        handlers::departments::try_handle,
        handlers::halls::try_handle,
        handlers::students::try_handle,
        handlers::teachers::try_handle,
        handlers::exams::try_handle,
        handlers::allocation::try_handle,
        handlers::seating::try_handle,
        handlers::invigilation::try_handle,
        handlers::attendance::try_handle,
        handlers::dashboard::try_handle,
    ];
    for try_handle in families {
        if let Some(resp) = try_handle(state, &req) {
            return resp;
        }
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
