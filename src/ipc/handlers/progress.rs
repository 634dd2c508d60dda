use crate::db::now_utc;
use crate::ipc::error::{query_err, write_err, HandlerErr};
use crate::ipc::helpers::{
    collect_rows, configured_statuses, get_required_str, get_text, new_id, require_user_row,
    with_session, with_user, HandlerResult,
};
use crate::ipc::types::{AppState, Request, Session};
use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const TIMEZONE_MAX: usize = 16;

fn progress_add(conn: &Connection, session: &Session, params: &serde_json::Value) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    let note = get_text(params, "note", 2000)?;
    require_user_row(conn, &user_id)?;

    let id = new_id();
    let now = now_utc();
    conn.execute(
        "INSERT INTO progress_records(id, user_id, note, created_by, created_at, updated_by,
           updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![&id, &user_id, &note, &session.user_id, &now, &session.user_id, &now],
    )
    .map_err(write_err("db_insert_failed", "progress_records"))?;
    Ok(json!({ "progressId": id }))
}

fn progress_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    require_user_row(conn, &user_id)?;
    let records = collect_rows(
        conn,
        "SELECT p.id, p.note, p.created_by, u.username, p.created_at
         FROM progress_records p
         JOIN users u ON u.id = p.created_by
         WHERE p.user_id = ?
         ORDER BY p.created_at DESC, p.rowid DESC",
        [&user_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "note": r.get::<_, String>(1)?,
                "createdBy": r.get::<_, String>(2)?,
                "createdByName": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            }))
        },
    )?;
    Ok(json!({ "records": records }))
}

fn reg_status_set(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    let status = get_text(params, "status", 32)?;
    let statuses = configured_statuses(conn)?;
    if !statuses.iter().any(|s| *s == status) {
        return Err(HandlerErr::bad_params(format!("{} is not a configured status", status))
            .with_details(json!({ "statuses": statuses })));
    }
    require_user_row(conn, &user_id)?;

    let id = new_id();
    let now = now_utc();
    conn.execute(
        "INSERT INTO user_reg_statuses(id, user_id, status, created_by, created_at, updated_by,
           updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![&id, &user_id, &status, &session.user_id, &now, &session.user_id, &now],
    )
    .map_err(write_err("db_insert_failed", "user_reg_statuses"))?;
    Ok(json!({ "regStatusId": id }))
}

fn reg_status_history(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    require_user_row(conn, &user_id)?;
    let history = collect_rows(
        conn,
        "SELECT s.id, s.status, s.created_by, u.username, s.created_at
         FROM user_reg_statuses s
         JOIN users u ON u.id = s.created_by
         WHERE s.user_id = ?
         ORDER BY s.created_at DESC, s.rowid DESC",
        [&user_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "status": r.get::<_, String>(1)?,
                "createdBy": r.get::<_, String>(2)?,
                "createdByName": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            }))
        },
    )?;
    Ok(json!({ "history": history }))
}

// --- call-out times ---

/// Stores when a student prefers to be called, replacing any earlier choice.
fn call_out_set(conn: &Connection, session: &Session, params: &serde_json::Value) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    let hours = get_required_str(params, "hours")?;
    let hours = NaiveTime::parse_from_str(&hours, "%H:%M")
        .map_err(|_| HandlerErr::bad_params("hours must be a 24-hour HH:MM time"))?
        .format("%H:%M")
        .to_string();
    let timezone = get_text(params, "timezone", TIMEZONE_MAX)?;
    require_user_row(conn, &user_id)?;

    let now = now_utc();
    conn.execute(
        "INSERT INTO call_out_times(user_id, hours, timezone, created_by, created_at, updated_by,
           updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET
           hours = excluded.hours,
           timezone = excluded.timezone,
           updated_by = excluded.updated_by,
           updated_at = excluded.updated_at",
        rusqlite::params![
            &user_id,
            &hours,
            &timezone,
            &session.user_id,
            &now,
            &session.user_id,
            &now
        ],
    )
    .map_err(write_err("db_update_failed", "call_out_times"))?;
    Ok(json!({ "userId": user_id, "hours": hours, "timezone": timezone }))
}

fn call_out_get(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    require_user_row(conn, &user_id)?;
    let call_out = conn
        .query_row(
            "SELECT hours, timezone, updated_by, updated_at FROM call_out_times WHERE user_id = ?",
            [&user_id],
            |r| {
                Ok(json!({
                    "hours": r.get::<_, String>(0)?,
                    "timezone": r.get::<_, String>(1)?,
                    "updatedBy": r.get::<_, String>(2)?,
                    "updatedAt": r.get::<_, String>(3)?,
                }))
            },
        )
        .optional()
        .map_err(query_err)?;
    Ok(json!({ "callOut": call_out }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "progress.add" => with_user(state, req, progress_add),
        "progress.list" => with_session(state, req, progress_list),
        "regStatus.set" => with_user(state, req, reg_status_set),
        "regStatus.history" => with_session(state, req, reg_status_history),
        "callOut.set" => with_user(state, req, call_out_set),
        "callOut.get" => with_session(state, req, call_out_get),
        _ => return None,
    };
    Some(resp)
}
