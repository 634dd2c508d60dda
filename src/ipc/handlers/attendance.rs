use crate::db::now_utc;
use crate::ipc::error::{query_err, write_err, HandlerErr};
use crate::ipc::helpers::{
    begin, collect_rows, commit, get_date, get_optional_i64, get_optional_str,
    get_optional_text, get_required_str, new_id, require_row, require_user_row, with_session,
    with_user, HandlerResult,
};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct Mark {
    status: String,
    note: Option<String>,
    late_by_min: Option<i64>,
    left_early_by_min: Option<i64>,
}

fn sessions_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let class_batch_id = get_required_str(params, "classBatchId")?;
    let session_date = get_date(params, "sessionDate")?;
    let teacher_id =
        get_optional_str(params, "teacherId").unwrap_or_else(|| session.user_id.clone());
    require_row(conn, "class_batches", &class_batch_id, "class batch")?;
    require_user_row(conn, &teacher_id)?;

    let id = new_id();
    let now = now_utc();
    conn.execute(
        "INSERT INTO class_sessions(id, class_batch_id, session_date, teacher_id, created_by,
           created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &class_batch_id,
            &session_date,
            &teacher_id,
            &session.user_id,
            &now,
            &session.user_id,
            &now
        ],
    )
    .map_err(write_err("db_insert_failed", "class_sessions"))?;
    Ok(json!({ "classSessionId": id }))
}

fn sessions_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_batch_id = get_required_str(params, "classBatchId")?;
    let sessions = collect_rows(
        conn,
        "SELECT s.id, s.session_date, s.teacher_id, u.username,
                (SELECT COUNT(*) FROM user_attendance a WHERE a.class_session_id = s.id)
         FROM class_sessions s
         JOIN users u ON u.id = s.teacher_id
         WHERE s.class_batch_id = ?
         ORDER BY s.session_date",
        [&class_batch_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "sessionDate": r.get::<_, String>(1)?,
                "teacherId": r.get::<_, String>(2)?,
                "teacherName": r.get::<_, String>(3)?,
                "recorded": r.get::<_, i64>(4)?,
            }))
        },
    )?;
    Ok(json!({ "sessions": sessions }))
}

fn statuses(conn: &Connection, _params: &serde_json::Value) -> HandlerResult {
    let statuses = collect_rows(
        conn,
        "SELECT code, label, counts_present FROM attendance_statuses ORDER BY rowid",
        [],
        |r| {
            Ok(json!({
                "code": r.get::<_, String>(0)?,
                "label": r.get::<_, String>(1)?,
                "countsPresent": r.get::<_, i64>(2)? != 0,
            }))
        },
    )?;
    Ok(json!({ "statuses": statuses }))
}

fn status_code(conn: &Connection, params: &serde_json::Value) -> Result<String, HandlerErr> {
    let code = get_required_str(params, "status")?.to_uppercase();
    let known = conn
        .query_row(
            "SELECT 1 FROM attendance_statuses WHERE code = ?",
            [&code],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(query_err)?
        .is_some();
    if !known {
        return Err(HandlerErr::bad_params(format!("unknown attendance status {}", code)));
    }
    Ok(code)
}

fn minutes(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    let v = get_optional_i64(params, key)?;
    if v.is_some_and(|m| m < 0) {
        return Err(HandlerErr::bad_params(format!("{} must not be negative", key)));
    }
    Ok(v)
}

fn upsert_mark(
    conn: &Connection,
    session: &Session,
    class_session_id: &str,
    user_id: &str,
    mark: &Mark,
    now: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO user_attendance(id, user_id, class_session_id, status_code, note,
           late_by_min, left_early_by_min, created_by, created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(user_id, class_session_id) DO UPDATE SET
           status_code = excluded.status_code,
           note = excluded.note,
           late_by_min = excluded.late_by_min,
           left_early_by_min = excluded.left_early_by_min,
           updated_by = excluded.updated_by,
           updated_at = excluded.updated_at",
        rusqlite::params![
            new_id(),
            user_id,
            class_session_id,
            &mark.status,
            &mark.note,
            mark.late_by_min,
            mark.left_early_by_min,
            &session.user_id,
            now,
            &session.user_id,
            now
        ],
    )
    .map_err(write_err("db_insert_failed", "user_attendance"))?;
    Ok(())
}

fn mark(conn: &Connection, session: &Session, params: &serde_json::Value) -> HandlerResult {
    let class_session_id = get_required_str(params, "classSessionId")?;
    let user_id = get_required_str(params, "userId")?;
    let mark = Mark {
        status: status_code(conn, params)?,
        note: get_optional_text(params, "note", 255)?,
        late_by_min: minutes(params, "lateByMin")?,
        left_early_by_min: minutes(params, "leftEarlyByMin")?,
    };
    require_row(conn, "class_sessions", &class_session_id, "class session")?;
    require_user_row(conn, &user_id)?;
    upsert_mark(conn, session, &class_session_id, &user_id, &mark, &now_utc())?;
    Ok(json!({ "ok": true }))
}

fn bulk_mark(conn: &Connection, session: &Session, params: &serde_json::Value) -> HandlerResult {
    let class_session_id = get_required_str(params, "classSessionId")?;
    let mark = Mark {
        status: status_code(conn, params)?,
        note: None,
        late_by_min: None,
        left_early_by_min: None,
    };
    let user_ids: Vec<String> = params
        .get("userIds")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("missing userIds"))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| HandlerErr::bad_params("userIds must be strings"))
        })
        .collect::<Result<_, _>>()?;
    require_row(conn, "class_sessions", &class_session_id, "class session")?;

    let now = now_utc();
    let tx = begin(conn)?;
    for user_id in &user_ids {
        require_user_row(&tx, user_id)
            .map_err(|e| e.with_details(json!({ "userId": user_id })))?;
        upsert_mark(&tx, session, &class_session_id, user_id, &mark, &now)?;
    }
    commit(tx)?;
    Ok(json!({ "updated": user_ids.len() }))
}

fn for_session(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_session_id = get_required_str(params, "classSessionId")?;
    require_row(conn, "class_sessions", &class_session_id, "class session")?;
    let rows = collect_rows(
        conn,
        "SELECT a.user_id, u.username, u.student_no, a.status_code, st.label, a.note,
                a.late_by_min, a.left_early_by_min
         FROM user_attendance a
         JOIN users u ON u.id = a.user_id
         JOIN attendance_statuses st ON st.code = a.status_code
         WHERE a.class_session_id = ?
         ORDER BY u.student_no",
        [&class_session_id],
        |r| {
            Ok(json!({
                "userId": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "studentNo": r.get::<_, i64>(2)?,
                "status": r.get::<_, String>(3)?,
                "label": r.get::<_, String>(4)?,
                "note": r.get::<_, Option<String>>(5)?,
                "lateByMin": r.get::<_, Option<i64>>(6)?,
                "leftEarlyByMin": r.get::<_, Option<i64>>(7)?,
            }))
        },
    )?;
    Ok(json!({ "rows": rows }))
}

fn summary(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    let class_batch_id = get_optional_str(params, "classBatchId");
    require_user_row(conn, &user_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT st.code, st.counts_present,
                    (SELECT COUNT(*) FROM user_attendance a
                     JOIN class_sessions s ON s.id = a.class_session_id
                     WHERE a.user_id = ?1 AND a.status_code = st.code
                       AND (?2 IS NULL OR s.class_batch_id = ?2))
             FROM attendance_statuses st
             ORDER BY st.rowid",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map((&user_id, &class_batch_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)? != 0,
                r.get::<_, i64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut counts = serde_json::Map::new();
    let mut recorded = 0i64;
    let mut present = 0i64;
    for (code, counts_present, n) in rows {
        recorded += n;
        if counts_present {
            present += n;
        }
        counts.insert(code, json!(n));
    }
    let rate = (recorded > 0).then(|| present as f64 / recorded as f64);

    Ok(json!({
        "userId": user_id,
        "counts": counts,
        "recorded": recorded,
        "attendanceRate": rate,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "sessions.create" => with_user(state, req, sessions_create),
        "sessions.list" => with_session(state, req, sessions_list),
        "attendance.statuses" => with_session(state, req, statuses),
        "attendance.mark" => with_user(state, req, mark),
        "attendance.bulkMark" => with_user(state, req, bulk_mark),
        "attendance.forSession" => with_session(state, req, for_session),
        "attendance.summary" => with_session(state, req, summary),
        _ => return None,
    };
    Some(resp)
}
