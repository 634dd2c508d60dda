use crate::db::now_utc;
use crate::ipc::error::{query_err, write_err, HandlerErr};
use crate::ipc::helpers::{
    collect_rows, delete_row, get_optional_str, get_optional_text, get_required_i64,
    get_required_str, get_text, new_id, require_row, require_user_row, with_session, with_user,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

/// A batch, optionally narrowed to one of its regions and one of that region's groups.
struct Scope {
    class_batch_id: String,
    class_region_id: Option<String>,
    class_group_id: Option<String>,
}

fn parent_of(conn: &Connection, sql: &str, id: &str, what: &str) -> Result<String, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get(0))
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found(what))
}

/// Reads `classBatchId`/`classRegionId`/`classGroupId` and checks they nest.
/// A group without a region takes the group's region.
fn read_scope(
    conn: &Connection,
    params: &serde_json::Value,
    batch_required: bool,
) -> Result<Option<Scope>, HandlerErr> {
    let class_batch_id = if batch_required {
        Some(get_required_str(params, "classBatchId")?)
    } else {
        get_optional_str(params, "classBatchId")
    };
    let mut class_region_id = get_optional_str(params, "classRegionId");
    let class_group_id = get_optional_str(params, "classGroupId");

    let Some(class_batch_id) = class_batch_id else {
        if class_region_id.is_some() || class_group_id.is_some() {
            return Err(HandlerErr::bad_params(
                "classBatchId is required when a region or group is given",
            ));
        }
        return Ok(None);
    };
    require_row(conn, "class_batches", &class_batch_id, "class batch")?;

    if let Some(group_id) = class_group_id.as_deref() {
        let group_region = parent_of(
            conn,
            "SELECT class_region_id FROM class_groups WHERE id = ?",
            group_id,
            "class group",
        )?;
        match class_region_id.as_deref() {
            Some(r) if r != group_region => {
                return Err(HandlerErr::bad_params("class group does not belong to the region"));
            }
            _ => class_region_id = Some(group_region),
        }
    }
    if let Some(region_id) = class_region_id.as_deref() {
        let region_batch = parent_of(
            conn,
            "SELECT class_batch_id FROM class_regions WHERE id = ?",
            region_id,
            "class region",
        )?;
        if region_batch != class_batch_id {
            return Err(HandlerErr::bad_params("class region does not belong to the batch"));
        }
    }

    Ok(Some(Scope {
        class_batch_id,
        class_region_id,
        class_group_id,
    }))
}

fn scope_json(r: &rusqlite::Row<'_>, from: usize) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "classBatchId": r.get::<_, Option<String>>(from)?,
        "classRegionId": r.get::<_, Option<String>>(from + 1)?,
        "classGroupId": r.get::<_, Option<String>>(from + 2)?,
    }))
}

// --- mentors ---

fn mentors_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    require_user_row(conn, &user_id)?;
    let scope = read_scope(conn, params, true)?
        .ok_or_else(|| HandlerErr::bad_params("missing classBatchId"))?;

    let id = new_id();
    let now = now_utc();
    conn.execute(
        "INSERT INTO class_group_mentors(id, user_id, class_batch_id, class_region_id,
           class_group_id, created_by, created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &user_id,
            &scope.class_batch_id,
            &scope.class_region_id,
            &scope.class_group_id,
            &session.user_id,
            &now,
            &session.user_id,
            &now
        ],
    )
    .map_err(write_err("db_insert_failed", "class_group_mentors"))?;
    Ok(json!({ "mentorId": id }))
}

fn mentors_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_batch_id = get_optional_str(params, "classBatchId");
    let items = collect_rows(
        conn,
        "SELECT m.id, m.user_id, u.username, m.class_batch_id, m.class_region_id, m.class_group_id
         FROM class_group_mentors m
         JOIN users u ON u.id = m.user_id
         WHERE ?1 IS NULL OR m.class_batch_id = ?1
         ORDER BY u.username",
        [&class_batch_id],
        |r| {
            let mut v = scope_json(r, 3)?;
            v["id"] = json!(r.get::<_, String>(0)?);
            v["userId"] = json!(r.get::<_, String>(1)?);
            v["username"] = json!(r.get::<_, String>(2)?);
            Ok(v)
        },
    )?;
    Ok(json!({ "mentors": items }))
}

fn mentors_delete(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let id = get_required_str(params, "id")?;
    delete_row(conn, "class_group_mentors", &id, "mentor")
}

// --- batch teachers ---

fn batch_teachers_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    let class_batch_id = get_required_str(params, "classBatchId")?;
    require_user_row(conn, &user_id)?;
    require_row(conn, "class_batches", &class_batch_id, "class batch")?;

    let id = new_id();
    let now = now_utc();
    conn.execute(
        "INSERT INTO class_batch_teachers(id, user_id, class_batch_id, created_by, created_at,
           updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &user_id,
            &class_batch_id,
            &session.user_id,
            &now,
            &session.user_id,
            &now
        ],
    )
    .map_err(write_err("db_insert_failed", "class_batch_teachers"))?;
    Ok(json!({ "batchTeacherId": id }))
}

fn batch_teachers_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_batch_id = get_optional_str(params, "classBatchId");
    let items = collect_rows(
        conn,
        "SELECT t.id, t.user_id, u.username, t.class_batch_id
         FROM class_batch_teachers t
         JOIN users u ON u.id = t.user_id
         WHERE ?1 IS NULL OR t.class_batch_id = ?1
         ORDER BY u.username",
        [&class_batch_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "userId": r.get::<_, String>(1)?,
                "username": r.get::<_, String>(2)?,
                "classBatchId": r.get::<_, String>(3)?,
            }))
        },
    )?;
    Ok(json!({ "teachers": items }))
}

fn batch_teachers_delete(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let id = get_required_str(params, "id")?;
    delete_row(conn, "class_batch_teachers", &id, "batch teacher")
}

// --- roles ---

fn roles_create(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let role = get_text(params, "role", 16)?;
    let level = get_required_i64(params, "level")?;
    let description = get_optional_text(params, "description", 255)?;
    let id = new_id();
    conn.execute(
        "INSERT INTO roles(id, role, level, description) VALUES(?, ?, ?, ?)",
        (&id, &role, level, &description),
    )
    .map_err(write_err("db_insert_failed", "roles"))?;
    Ok(json!({ "roleId": id }))
}

fn roles_list(conn: &Connection, _params: &serde_json::Value) -> HandlerResult {
    let items = collect_rows(
        conn,
        "SELECT id, role, level, description FROM roles ORDER BY level DESC",
        [],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "role": r.get::<_, String>(1)?,
                "level": r.get::<_, i64>(2)?,
                "description": r.get::<_, Option<String>>(3)?,
            }))
        },
    )?;
    Ok(json!({ "roles": items }))
}

fn roles_delete(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let id = get_required_str(params, "id")?;
    delete_row(conn, "roles", &id, "role")
}

// --- user roles ---

fn user_roles_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    let role_id = get_required_str(params, "roleId")?;
    require_user_row(conn, &user_id)?;
    require_row(conn, "roles", &role_id, "role")?;
    let scope = read_scope(conn, params, false)?;
    let (batch, region, group) = match scope {
        Some(s) => (Some(s.class_batch_id), s.class_region_id, s.class_group_id),
        None => (None, None, None),
    };

    let id = new_id();
    let now = now_utc();
    conn.execute(
        "INSERT INTO user_roles(id, role_id, user_id, class_batch_id, class_region_id,
           class_group_id, created_by, created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &role_id,
            &user_id,
            &batch,
            &region,
            &group,
            &session.user_id,
            &now,
            &session.user_id,
            &now
        ],
    )
    .map_err(write_err("db_insert_failed", "user_roles"))?;
    Ok(json!({ "userRoleId": id }))
}

fn user_roles_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let user_id = get_optional_str(params, "userId");
    let items = collect_rows(
        conn,
        "SELECT ur.id, ur.user_id, u.username, ur.role_id, r.role, r.level,
                ur.class_batch_id, ur.class_region_id, ur.class_group_id
         FROM user_roles ur
         JOIN users u ON u.id = ur.user_id
         JOIN roles r ON r.id = ur.role_id
         WHERE ?1 IS NULL OR ur.user_id = ?1
         ORDER BY u.username, r.level DESC",
        [&user_id],
        |r| {
            let mut v = scope_json(r, 6)?;
            v["id"] = json!(r.get::<_, String>(0)?);
            v["userId"] = json!(r.get::<_, String>(1)?);
            v["username"] = json!(r.get::<_, String>(2)?);
            v["roleId"] = json!(r.get::<_, String>(3)?);
            v["role"] = json!(r.get::<_, String>(4)?);
            v["level"] = json!(r.get::<_, i64>(5)?);
            Ok(v)
        },
    )?;
    Ok(json!({ "userRoles": items }))
}

fn user_roles_delete(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let id = get_required_str(params, "id")?;
    delete_row(conn, "user_roles", &id, "user role")
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "mentors.create" => with_user(state, req, mentors_create),
        "mentors.list" => with_session(state, req, mentors_list),
        "mentors.delete" => with_user(state, req, mentors_delete),
        "batchTeachers.create" => with_user(state, req, batch_teachers_create),
        "batchTeachers.list" => with_session(state, req, batch_teachers_list),
        "batchTeachers.delete" => with_user(state, req, batch_teachers_delete),
        "roles.create" => with_user(state, req, roles_create),
        "roles.list" => with_session(state, req, roles_list),
        "roles.delete" => with_user(state, req, roles_delete),
        "userRoles.create" => with_user(state, req, user_roles_create),
        "userRoles.list" => with_session(state, req, user_roles_list),
        "userRoles.delete" => with_user(state, req, user_roles_delete),
        _ => return None,
    };
    Some(resp)
}
