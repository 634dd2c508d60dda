use crate::db::now_utc;
use crate::ipc::error::{query_err, write_err, HandlerErr};
use crate::ipc::helpers::{
    collect_rows, delete_row, get_date, get_optional_i64, get_optional_str, get_optional_text,
    get_required_str, get_text, new_id, require_row, require_user_row, with_session, with_user,
    HandlerResult, BATCH_CODE_SQL,
};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

// --- class names ---

fn class_names_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let name = get_text(params, "name", 8)?;
    let id = new_id();
    let now = now_utc();
    conn.execute(
        "INSERT INTO class_names(id, name, created_by, created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &name, &session.user_id, &now, &session.user_id, &now),
    )
    .map_err(write_err("db_insert_failed", "class_names"))?;
    Ok(json!({ "classNameId": id }))
}

fn class_names_list(conn: &Connection, _params: &serde_json::Value) -> HandlerResult {
    let items = collect_rows(
        conn,
        "SELECT id, name FROM class_names ORDER BY name",
        [],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        },
    )?;
    Ok(json!({ "classNames": items }))
}

fn class_names_delete(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let id = get_required_str(params, "id")?;
    delete_row(conn, "class_names", &id, "class name")
}

// --- batch statuses ---

fn batch_statuses_create(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let status = get_text(params, "status", 16)?;
    let id = new_id();
    conn.execute(
        "INSERT INTO class_batch_statuses(id, status) VALUES(?, ?)",
        (&id, &status),
    )
    .map_err(write_err("db_insert_failed", "class_batch_statuses"))?;
    Ok(json!({ "statusId": id }))
}

fn batch_statuses_list(conn: &Connection, _params: &serde_json::Value) -> HandlerResult {
    let items = collect_rows(
        conn,
        "SELECT id, status FROM class_batch_statuses ORDER BY status",
        [],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "status": r.get::<_, String>(1)?,
            }))
        },
    )?;
    Ok(json!({ "statuses": items }))
}

fn batch_statuses_delete(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let id = get_required_str(params, "id")?;
    delete_row(conn, "class_batch_statuses", &id, "batch status")
}

// --- batches ---

fn batches_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let class_name_id = get_required_str(params, "classNameId")?;
    let batch_no = get_text(params, "batchNo", 3)?.to_uppercase();
    let start_date = get_date(params, "startDate")?;
    let status_id = get_required_str(params, "statusId")?;
    require_row(conn, "class_names", &class_name_id, "class name")?;
    require_row(conn, "class_batch_statuses", &status_id, "batch status")?;

    let id = new_id();
    let now = now_utc();
    conn.execute(
        "INSERT INTO class_batches(id, class_name_id, batch_no, start_date, status_id, created_by,
           created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &class_name_id,
            &batch_no,
            &start_date,
            &status_id,
            &session.user_id,
            &now,
            &session.user_id,
            &now
        ],
    )
    .map_err(write_err("db_insert_failed", "class_batches"))?;
    Ok(json!({ "classBatchId": id }))
}

fn batches_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_name_id = get_optional_str(params, "classNameId");
    let items = collect_rows(
        conn,
        &format!(
            "SELECT cb.id, cb.class_name_id, cn.name, cb.batch_no, {}, cb.start_date,
               cb.status_id, s.status
             FROM class_batches cb
             JOIN class_names cn ON cn.id = cb.class_name_id
             JOIN class_batch_statuses s ON s.id = cb.status_id
             WHERE ?1 IS NULL OR cb.class_name_id = ?1
             ORDER BY cn.name, cb.batch_no",
            BATCH_CODE_SQL
        ),
        [&class_name_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classNameId": r.get::<_, String>(1)?,
                "className": r.get::<_, String>(2)?,
                "batchNo": r.get::<_, String>(3)?,
                "code": r.get::<_, String>(4)?,
                "startDate": r.get::<_, String>(5)?,
                "statusId": r.get::<_, String>(6)?,
                "status": r.get::<_, String>(7)?,
            }))
        },
    )?;
    Ok(json!({ "batches": items }))
}

fn batches_set_status(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let class_batch_id = get_required_str(params, "classBatchId")?;
    let status_id = get_required_str(params, "statusId")?;
    require_row(conn, "class_batches", &class_batch_id, "class batch")?;
    require_row(conn, "class_batch_statuses", &status_id, "batch status")?;
    conn.execute(
        "UPDATE class_batches SET status_id = ?, updated_by = ?, updated_at = ? WHERE id = ?",
        (&status_id, &session.user_id, now_utc(), &class_batch_id),
    )
    .map_err(write_err("db_update_failed", "class_batches"))?;
    Ok(json!({ "ok": true }))
}

fn batches_delete(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let id = get_required_str(params, "id")?;
    delete_row(conn, "class_batches", &id, "class batch")
}

// --- regions ---

fn regions_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let class_batch_id = get_required_str(params, "classBatchId")?;
    let section = get_text(params, "section", 1)?.to_uppercase();
    let description = get_optional_text(params, "description", 255)?;
    require_row(conn, "class_batches", &class_batch_id, "class batch")?;

    let id = new_id();
    let now = now_utc();
    conn.execute(
        "INSERT INTO class_regions(id, class_batch_id, section, description, created_by,
           created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &class_batch_id,
            &section,
            &description,
            &session.user_id,
            &now,
            &session.user_id,
            &now
        ],
    )
    .map_err(write_err("db_insert_failed", "class_regions"))?;
    Ok(json!({ "classRegionId": id }))
}

fn regions_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_batch_id = get_optional_str(params, "classBatchId");
    let items = collect_rows(
        conn,
        "SELECT id, class_batch_id, section, description FROM class_regions
         WHERE ?1 IS NULL OR class_batch_id = ?1
         ORDER BY section",
        [&class_batch_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classBatchId": r.get::<_, String>(1)?,
                "section": r.get::<_, String>(2)?,
                "description": r.get::<_, Option<String>>(3)?,
            }))
        },
    )?;
    Ok(json!({ "regions": items }))
}

fn regions_delete(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let id = get_required_str(params, "id")?;
    delete_row(conn, "class_regions", &id, "class region")
}

// --- groups ---

fn groups_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let class_region_id = get_required_str(params, "classRegionId")?;
    let name = get_text(params, "name", 64)?;
    let description = get_optional_text(params, "description", 255)?;
    let start_index = get_optional_i64(params, "startIndex")?;
    let end_index = get_optional_i64(params, "endIndex")?;
    if let (Some(s), Some(e)) = (start_index, end_index) {
        if s > e {
            return Err(HandlerErr::bad_params("startIndex must not exceed endIndex"));
        }
    }
    if start_index.is_some_and(|s| s < 1) || end_index.is_some_and(|e| e < 1) {
        return Err(HandlerErr::bad_params("group indexes start at 1"));
    }
    require_row(conn, "class_regions", &class_region_id, "class region")?;

    let id = new_id();
    let now = now_utc();
    conn.execute(
        "INSERT INTO class_groups(id, class_region_id, name, description, start_index, end_index,
           created_by, created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &class_region_id,
            &name,
            &description,
            start_index,
            end_index,
            &session.user_id,
            &now,
            &session.user_id,
            &now
        ],
    )
    .map_err(write_err("db_insert_failed", "class_groups"))?;
    Ok(json!({ "classGroupId": id }))
}

fn groups_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_region_id = get_optional_str(params, "classRegionId");
    let items = collect_rows(
        conn,
        "SELECT g.id, g.class_region_id, g.name, g.description, g.start_index, g.end_index,
                (SELECT COUNT(*) FROM student_groups sg WHERE sg.class_group_id = g.id)
         FROM class_groups g
         WHERE ?1 IS NULL OR g.class_region_id = ?1
         ORDER BY g.name",
        [&class_region_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classRegionId": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "description": r.get::<_, Option<String>>(3)?,
                "startIndex": r.get::<_, Option<i64>>(4)?,
                "endIndex": r.get::<_, Option<i64>>(5)?,
                "memberCount": r.get::<_, i64>(6)?,
            }))
        },
    )?;
    Ok(json!({ "groups": items }))
}

fn groups_delete(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let id = get_required_str(params, "id")?;
    delete_row(conn, "class_groups", &id, "class group")
}

// --- user statuses ---

fn user_statuses_create(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let status = get_text(params, "status", 16)?;
    let description = get_optional_text(params, "description", 255)?;
    let id = new_id();
    conn.execute(
        "INSERT INTO user_statuses(id, status, description) VALUES(?, ?, ?)",
        (&id, &status, &description),
    )
    .map_err(write_err("db_insert_failed", "user_statuses"))?;
    Ok(json!({ "userStatusId": id }))
}

fn user_statuses_list(conn: &Connection, _params: &serde_json::Value) -> HandlerResult {
    let items = collect_rows(
        conn,
        "SELECT id, status, description FROM user_statuses ORDER BY status",
        [],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "status": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
            }))
        },
    )?;
    Ok(json!({ "statuses": items }))
}

fn user_statuses_delete(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let id = get_required_str(params, "id")?;
    delete_row(conn, "user_statuses", &id, "user status")
}

// --- student groups ---

/// The lowest unused index in a group, or `None` when a bounded group is full.
fn next_index(
    conn: &Connection,
    class_group_id: &str,
    start: Option<i64>,
    end: Option<i64>,
) -> Result<Option<i64>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT index_no FROM student_groups
             WHERE class_group_id = ? AND index_no >= ?
             ORDER BY index_no",
        )
        .map_err(query_err)?;
    let first = start.unwrap_or(1);
    let used = stmt
        .query_map((class_group_id, first), |r| r.get::<_, i64>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut candidate = first;
    for taken in used {
        if taken > candidate {
            break;
        }
        candidate = taken + 1;
    }
    Ok(match end {
        Some(e) if candidate > e => None,
        _ => Some(candidate),
    })
}

fn student_groups_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    let class_group_id = get_required_str(params, "classGroupId")?;
    let status_id = get_required_str(params, "statusId")?;
    let index_no = get_optional_i64(params, "indexNo")?;
    require_user_row(conn, &user_id)?;
    require_row(conn, "user_statuses", &status_id, "user status")?;

    let (start, end): (Option<i64>, Option<i64>) = conn
        .query_row(
            "SELECT start_index, end_index FROM class_groups WHERE id = ?",
            [&class_group_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("class group"))?;

    let index_no = match index_no {
        Some(i) => {
            let below = i < start.unwrap_or(1);
            let above = end.is_some_and(|e| i > e);
            if below || above {
                return Err(HandlerErr::bad_params("indexNo is outside the group's range")
                    .with_details(json!({ "startIndex": start, "endIndex": end })));
            }
            i
        }
        None => next_index(conn, &class_group_id, start, end)?
            .ok_or_else(|| HandlerErr::new("conflict", "group has no free index"))?,
    };

    let id = new_id();
    let now = now_utc();
    conn.execute(
        "INSERT INTO student_groups(id, user_id, class_group_id, index_no, status_id, created_by,
           created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &user_id,
            &class_group_id,
            index_no,
            &status_id,
            &session.user_id,
            &now,
            &session.user_id,
            &now
        ],
    )
    .map_err(write_err("db_insert_failed", "student_groups"))?;
    Ok(json!({ "studentGroupId": id, "indexNo": index_no }))
}

fn student_groups_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_group_id = get_optional_str(params, "classGroupId");
    let user_id = get_optional_str(params, "userId");
    let items = collect_rows(
        conn,
        "SELECT sg.id, sg.user_id, u.username, u.student_no, sg.class_group_id, sg.index_no,
                sg.status_id, us.status
         FROM student_groups sg
         JOIN users u ON u.id = sg.user_id
         JOIN user_statuses us ON us.id = sg.status_id
         WHERE (?1 IS NULL OR sg.class_group_id = ?1)
           AND (?2 IS NULL OR sg.user_id = ?2)
         ORDER BY sg.class_group_id, sg.index_no",
        [&class_group_id, &user_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "userId": r.get::<_, String>(1)?,
                "username": r.get::<_, String>(2)?,
                "studentNo": r.get::<_, i64>(3)?,
                "classGroupId": r.get::<_, String>(4)?,
                "indexNo": r.get::<_, i64>(5)?,
                "statusId": r.get::<_, String>(6)?,
                "status": r.get::<_, String>(7)?,
            }))
        },
    )?;
    Ok(json!({ "members": items }))
}

fn student_groups_delete(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let id = get_required_str(params, "id")?;
    delete_row(conn, "student_groups", &id, "student group")
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "classNames.create" => with_user(state, req, class_names_create),
        "classNames.list" => with_session(state, req, class_names_list),
        "classNames.delete" => with_user(state, req, class_names_delete),
        "batchStatuses.create" => with_user(state, req, batch_statuses_create),
        "batchStatuses.list" => with_session(state, req, batch_statuses_list),
        "batchStatuses.delete" => with_user(state, req, batch_statuses_delete),
        "batches.create" => with_user(state, req, batches_create),
        "batches.list" => with_session(state, req, batches_list),
        "batches.setStatus" => with_user(state, req, batches_set_status),
        "batches.delete" => with_user(state, req, batches_delete),
        "regions.create" => with_user(state, req, regions_create),
        "regions.list" => with_session(state, req, regions_list),
        "regions.delete" => with_user(state, req, regions_delete),
        "groups.create" => with_user(state, req, groups_create),
        "groups.list" => with_session(state, req, groups_list),
        "groups.delete" => with_user(state, req, groups_delete),
        "userStatuses.create" => with_user(state, req, user_statuses_create),
        "userStatuses.list" => with_session(state, req, user_statuses_list),
        "userStatuses.delete" => with_user(state, req, user_statuses_delete),
        "studentGroups.create" => with_user(state, req, student_groups_create),
        "studentGroups.list" => with_session(state, req, student_groups_list),
        "studentGroups.delete" => with_user(state, req, student_groups_delete),
        _ => return None,
    };
    Some(resp)
}
