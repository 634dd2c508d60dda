use crate::config::LIST_SETTINGS;
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_required_str, with_session, with_user, HandlerResult};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::Connection;
use serde_json::json;
use std::path::{Path, PathBuf};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "authenticated": state.session.is_some()
        }),
    )
}

/// Opens (creating if needed) the workspace at `path`; the previous session ends.
pub fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path)?;
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    state.session = None;
    tracing::info!(workspace = %path.display(), "workspace opened");
    Ok(())
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match open_workspace(state, &path) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn settings_get(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let key = get_required_str(params, "key")?;
    let value = db::settings_get_json(conn, &key)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:?}")))?;
    Ok(json!({ "key": key, "value": value }))
}

fn settings_set(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let key = get_required_str(params, "key")?;
    if key.is_empty() {
        return Err(HandlerErr::bad_params("key must not be empty"));
    }
    let value = params
        .get("value")
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params("missing value"))?;
    if LIST_SETTINGS.iter().any(|(k, _)| *k == key) {
        let valid = value
            .as_array()
            .map(|items| !items.is_empty() && items.iter().all(|v| v.is_string()))
            .unwrap_or(false);
        if !valid {
            return Err(HandlerErr::bad_params(format!(
                "{} must be a non-empty list of strings",
                key
            )));
        }
    }
    db::settings_set_json(conn, &key, &value).map_err(|e| {
        HandlerErr::new("db_update_failed", format!("{e:?}"))
            .with_details(json!({ "table": "settings" }))
    })?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "settings.get" => Some(with_session(state, req, settings_get)),
        "settings.set" => Some(with_user(state, req, settings_set)),
        _ => None,
    }
}
