use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type Family = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: &[Family] = &[
    handlers::core::try_handle,
    handlers::auth::try_handle,
    handlers::registration::try_handle,
    handlers::users::try_handle,
    handlers::org::try_handle,
    handlers::assignments::try_handle,
    handlers::lookups::try_handle,
    handlers::attendance::try_handle,
    handlers::tasks::try_handle,
    handlers::scores::try_handle,
    handlers::progress::try_handle,
    handlers::messages::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");

    let resp = FAMILIES
        .iter()
        .find_map(|family| family(state, &req))
        .unwrap_or_else(|| {
            err(
                &req.id,
                "not_implemented",
                format!("unknown method: {}", req.method),
                None,
            )
        });

    if resp.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = resp
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        tracing::warn!(id = %req.id, method = %req.method, code, "request failed");
    }
    resp
}
