use crate::db::now_utc;
use crate::ipc::error::{write_err, HandlerErr};
use crate::ipc::helpers::{
    collect_rows, get_date, get_optional_text, get_required_str, get_text, new_id, require_row,
    require_user_row, with_session, with_user, HandlerResult,
};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::Connection;
use serde_json::json;

fn create(conn: &Connection, session: &Session, params: &serde_json::Value) -> HandlerResult {
    let class_batch_id = get_required_str(params, "classBatchId")?;
    let name = get_text(params, "name", 64)?;
    let description = get_optional_text(params, "description", 2000)?;
    let due_date = get_date(params, "dueDate")?;
    require_row(conn, "class_batches", &class_batch_id, "class batch")?;

    let id = new_id();
    let now = now_utc();
    conn.execute(
        "INSERT INTO tasks(id, name, description, class_batch_id, due_date, created_by,
           created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &name,
            &description,
            &class_batch_id,
            &due_date,
            &session.user_id,
            &now,
            &session.user_id,
            &now
        ],
    )
    .map_err(write_err("db_insert_failed", "tasks"))?;
    Ok(json!({ "taskId": id }))
}

fn list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_batch_id = get_required_str(params, "classBatchId")?;
    let tasks = collect_rows(
        conn,
        "SELECT t.id, t.name, t.description, t.due_date,
                (SELECT COUNT(*) FROM user_tasks ut WHERE ut.task_id = t.id AND ut.done = 1),
                (SELECT COUNT(*) FROM user_tasks ut WHERE ut.task_id = t.id)
         FROM tasks t
         WHERE t.class_batch_id = ?
         ORDER BY t.due_date, t.name",
        [&class_batch_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "dueDate": r.get::<_, String>(3)?,
                "done": r.get::<_, i64>(4)?,
                "total": r.get::<_, i64>(5)?,
            }))
        },
    )?;
    Ok(json!({ "tasks": tasks }))
}

fn set_status(conn: &Connection, session: &Session, params: &serde_json::Value) -> HandlerResult {
    let task_id = get_required_str(params, "taskId")?;
    let user_id = get_required_str(params, "userId")?;
    let done = params
        .get("done")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params("missing done"))?;
    let note = get_optional_text(params, "note", 255)?;
    require_row(conn, "tasks", &task_id, "task")?;
    require_user_row(conn, &user_id)?;

    let now = now_utc();
    conn.execute(
        "INSERT INTO user_tasks(id, user_id, task_id, done, note, created_by, created_at,
           updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(user_id, task_id) DO UPDATE SET
           done = excluded.done,
           note = excluded.note,
           updated_by = excluded.updated_by,
           updated_at = excluded.updated_at",
        rusqlite::params![
            new_id(),
            &user_id,
            &task_id,
            done as i64,
            &note,
            &session.user_id,
            &now,
            &session.user_id,
            &now
        ],
    )
    .map_err(write_err("db_update_failed", "user_tasks"))?;
    Ok(json!({ "ok": true }))
}

fn for_user(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    require_user_row(conn, &user_id)?;
    // Tasks of the user's batch plus any task they already have a status on.
    let tasks = collect_rows(
        conn,
        "SELECT t.id, t.name, t.description, t.due_date, t.class_batch_id,
                COALESCE(ut.done, 0), ut.note
         FROM tasks t
         LEFT JOIN user_tasks ut ON ut.task_id = t.id AND ut.user_id = ?1
         WHERE ut.id IS NOT NULL
            OR t.class_batch_id = (SELECT class_batch_id FROM users WHERE id = ?1)
         ORDER BY t.due_date, t.name",
        [&user_id],
        |r| {
            Ok(json!({
                "taskId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "dueDate": r.get::<_, String>(3)?,
                "classBatchId": r.get::<_, String>(4)?,
                "done": r.get::<_, i64>(5)? != 0,
                "note": r.get::<_, Option<String>>(6)?,
            }))
        },
    )?;
    Ok(json!({ "tasks": tasks }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "tasks.create" => with_user(state, req, create),
        "tasks.list" => with_session(state, req, list),
        "tasks.setStatus" => with_user(state, req, set_status),
        "tasks.forUser" => with_session(state, req, for_user),
        _ => return None,
    };
    Some(resp)
}
