use crate::backup;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn path_param(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn handle_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(out_path) = path_param(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if state.session.is_none() {
        return err(&req.id, "not_authenticated", "sign in first", None);
    }

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                format!("{e:#}"),
                Some(json!({ "path": out_path })),
            )
        }
    };
    tracing::info!(path = %out_path, "workspace bundle exported");

    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256
        }),
    )
}

fn handle_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(in_path) = path_param(req, "inPath") else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    let workspace_path = path_param(req, "workspacePath")
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if state.session.is_none() {
        return err(&req.id, "not_authenticated", "sign in first", None);
    }

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }

    let path_details = Some(json!({ "path": src.to_string_lossy() }));
    let staged = match backup::read_backup(&src) {
        Ok(verified) => match backup::stage_backup(verified, &workspace_path) {
            Ok(staged) => staged,
            Err(e) => return err(&req.id, "io_failed", format!("{e:#}"), path_details),
        },
        Err(e) => return err(&req.id, "bad_params", format!("{e:#}"), path_details),
    };
    if let Err(e) = staged.check_integrity() {
        return err(&req.id, "bad_params", format!("{e:#}"), path_details);
    }

    let is_active = state.workspace.as_deref() == Some(workspace_path.as_path());
    if is_active {
        // The open handle must go before its file is replaced.
        state.db = None;
        state.session = None;
    }

    let import = staged.commit();
    let reopened = if is_active {
        open_workspace(state, &workspace_path)
    } else {
        Ok(())
    };

    let import = match import {
        Ok(v) => v,
        Err(e) => return err(&req.id, "io_failed", format!("{e:#}"), path_details),
    };
    if let Err(e) = reopened {
        return err(&req.id, "db_open_failed", format!("{e:?}"), None);
    }
    tracing::info!(
        path = %in_path,
        format = %import.bundle_format_detected,
        "workspace bundle imported"
    );

    ok(
        &req.id,
        json!({
            "ok": true,
            "workspacePath": workspace_path.to_string_lossy(),
            "bundleFormatDetected": import.bundle_format_detected,
            "reopened": is_active
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import(state, req)),
        _ => None,
    }
}
