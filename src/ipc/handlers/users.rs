use crate::db::now_utc;
use crate::ipc::error::{query_err, write_err, HandlerErr};
use crate::ipc::handlers::auth::valid_email;
use crate::ipc::helpers::{
    begin, commit, check_len, get_optional_i64, get_optional_str, get_required_str,
    require_user_row, with_session, with_user, HandlerResult, BATCH_CODE_SQL,
};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

/// Most recent registration status of `u.id`.
pub const LATEST_STATUS_SQL: &str = "(SELECT s.status FROM user_reg_statuses s
     WHERE s.user_id = u.id ORDER BY s.created_at DESC, s.rowid DESC LIMIT 1)";

fn list_users(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_batch_id = get_optional_str(params, "classBatchId");
    let status = get_optional_str(params, "status");

    let sql = format!(
        "SELECT * FROM (
           SELECT u.id, u.student_no, u.username, u.gender, c.email, u.class_batch_id,
                  {code} AS batch_code, {latest} AS status
           FROM users u
           LEFT JOIN contacts c ON c.user_id = u.id
           LEFT JOIN class_batches cb ON cb.id = u.class_batch_id
           LEFT JOIN class_names cn ON cn.id = cb.class_name_id
         )
         WHERE (?1 IS NULL OR class_batch_id = ?1)
           AND (?2 IS NULL OR status = ?2)
         ORDER BY student_no",
        code = BATCH_CODE_SQL,
        latest = LATEST_STATUS_SQL
    );
    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let users = stmt
        .query_map((&class_batch_id, &status), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentNo": r.get::<_, i64>(1)?,
                "username": r.get::<_, String>(2)?,
                "gender": r.get::<_, Option<String>>(3)?,
                "email": r.get::<_, Option<String>>(4)?,
                "classBatchId": r.get::<_, Option<String>>(5)?,
                "batchCode": r.get::<_, Option<String>>(6)?,
                "status": r.get::<_, Option<String>>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "users": users }))
}

fn address(conn: &Connection, user_id: &str, kind: &str) -> Result<serde_json::Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT city, district, state, country, area, zip FROM addresses
             WHERE user_id = ? AND kind = ?",
            [user_id, kind],
            |r| {
                Ok(json!({
                    "city": r.get::<_, Option<String>>(0)?,
                    "district": r.get::<_, Option<String>>(1)?,
                    "state": r.get::<_, Option<String>>(2)?,
                    "country": r.get::<_, Option<String>>(3)?,
                    "area": r.get::<_, Option<String>>(4)?,
                    "zip": r.get::<_, Option<String>>(5)?,
                }))
            },
        )
        .optional()
        .map_err(query_err)?;
    Ok(row.unwrap_or(serde_json::Value::Null))
}

fn get_user(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    let sql = format!(
        "SELECT u.id, u.student_no, u.username, u.gender, u.birth_year, u.bio,
                u.class_batch_id, {code}, u.referrer_id, r.username, r.student_no,
                {latest}, u.created_at, u.updated_at
         FROM users u
         LEFT JOIN class_batches cb ON cb.id = u.class_batch_id
         LEFT JOIN class_names cn ON cn.id = cb.class_name_id
         LEFT JOIN users r ON r.id = u.referrer_id
         WHERE u.id = ?",
        code = BATCH_CODE_SQL,
        latest = LATEST_STATUS_SQL
    );
    let mut user = conn
        .query_row(&sql, [&user_id], |r| {
            let referrer = match r.get::<_, Option<String>>(8)? {
                Some(id) => json!({
                    "userId": id,
                    "username": r.get::<_, Option<String>>(9)?,
                    "studentNo": r.get::<_, Option<i64>>(10)?,
                }),
                None => serde_json::Value::Null,
            };
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentNo": r.get::<_, i64>(1)?,
                "username": r.get::<_, String>(2)?,
                "gender": r.get::<_, Option<String>>(3)?,
                "birthYear": r.get::<_, Option<i64>>(4)?,
                "bio": r.get::<_, Option<String>>(5)?,
                "classBatchId": r.get::<_, Option<String>>(6)?,
                "batchCode": r.get::<_, Option<String>>(7)?,
                "referrer": referrer,
                "status": r.get::<_, Option<String>>(11)?,
                "createdAt": r.get::<_, String>(12)?,
                "updatedAt": r.get::<_, String>(13)?,
            }))
        })
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("user"))?;

    let contact = conn
        .query_row(
            "SELECT mobile, whatsapp, email FROM contacts WHERE user_id = ?",
            [&user_id],
            |r| {
                Ok(json!({
                    "mobile": r.get::<_, Option<String>>(0)?,
                    "whatsapp": r.get::<_, Option<String>>(1)?,
                    "email": r.get::<_, String>(2)?,
                }))
            },
        )
        .optional()
        .map_err(query_err)?;

    let other = conn
        .query_row(
            "SELECT education, profession, visa_status, citizenship, spouse, sons, daughters
             FROM other_details WHERE user_id = ?",
            [&user_id],
            |r| {
                Ok(json!({
                    "education": r.get::<_, String>(0)?,
                    "profession": r.get::<_, String>(1)?,
                    "visaStatus": r.get::<_, Option<String>>(2)?,
                    "citizenship": r.get::<_, Option<String>>(3)?,
                    "spouse": r.get::<_, Option<i64>>(4)?,
                    "sons": r.get::<_, Option<i64>>(5)?,
                    "daughters": r.get::<_, Option<i64>>(6)?,
                }))
            },
        )
        .optional()
        .map_err(query_err)?;

    let mut stmt = conn
        .prepare(
            "SELECT sg.id, sg.class_group_id, g.name, rg.section, sg.index_no, us.status
             FROM student_groups sg
             JOIN class_groups g ON g.id = sg.class_group_id
             JOIN class_regions rg ON rg.id = g.class_region_id
             JOIN user_statuses us ON us.id = sg.status_id
             WHERE sg.user_id = ?
             ORDER BY rg.section, g.name",
        )
        .map_err(query_err)?;
    let groups = stmt
        .query_map([&user_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classGroupId": r.get::<_, String>(1)?,
                "group": r.get::<_, String>(2)?,
                "section": r.get::<_, String>(3)?,
                "indexNo": r.get::<_, i64>(4)?,
                "status": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut stmt = conn
        .prepare(
            "SELECT ur.id, r.role, r.level, ur.class_batch_id, ur.class_region_id, ur.class_group_id
             FROM user_roles ur
             JOIN roles r ON r.id = ur.role_id
             WHERE ur.user_id = ?
             ORDER BY r.level DESC",
        )
        .map_err(query_err)?;
    let roles = stmt
        .query_map([&user_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "role": r.get::<_, String>(1)?,
                "level": r.get::<_, i64>(2)?,
                "classBatchId": r.get::<_, Option<String>>(3)?,
                "classRegionId": r.get::<_, Option<String>>(4)?,
                "classGroupId": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    user["contact"] = contact.unwrap_or(serde_json::Value::Null);
    user["hometown"] = address(conn, &user_id, "home")?;
    user["residence"] = address(conn, &user_id, "residence")?;
    user["other"] = other.unwrap_or(serde_json::Value::Null);
    user["groups"] = json!(groups);
    user["roles"] = json!(roles);
    Ok(user)
}

fn patch_str(
    patch: &serde_json::Value,
    key: &str,
    max: usize,
) -> Result<Option<String>, HandlerErr> {
    match patch.get(key) {
        None => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .map(|s| s.trim().to_string())
                .ok_or_else(|| HandlerErr::bad_params(format!("patch.{} must be a string", key)))?;
            check_len(key, &s, max)?;
            Ok(Some(s))
        }
    }
}

fn update_user(conn: &Connection, session: &Session, params: &serde_json::Value) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    let patch = params
        .get("patch")
        .filter(|v| v.is_object())
        .ok_or_else(|| HandlerErr::bad_params("missing patch"))?;
    require_user_row(conn, &user_id)?;

    let username = patch_str(patch, "username", 64)?;
    if let Some(name) = username.as_deref() {
        if name.is_empty() {
            return Err(HandlerErr::bad_params("username must not be empty"));
        }
        let taken = conn
            .query_row(
                "SELECT 1 FROM users WHERE username = ? COLLATE NOCASE AND id <> ?",
                [name, user_id.as_str()],
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(query_err)?
            .is_some();
        if taken {
            return Err(HandlerErr::new("conflict", "username is already in use"));
        }
    }
    let gender = patch_str(patch, "gender", 1)?.map(|g| g.to_uppercase());
    if let Some(g) = gender.as_deref() {
        if g != "M" && g != "F" {
            return Err(HandlerErr::bad_params("gender must be M or F"));
        }
    }
    let birth_year = get_optional_i64(patch, "birthYear")?;
    if let Some(y) = birth_year {
        if !(1900..=2099).contains(&y) {
            return Err(HandlerErr::bad_params("birthYear must be between 1900 and 2099"));
        }
    }
    let bio = patch_str(patch, "bio", 2000)?;
    let mobile = patch_str(patch, "mobile", 20)?;
    let whatsapp = patch_str(patch, "whatsapp", 20)?;
    let email = patch_str(patch, "email", 254)?.map(|e| e.to_lowercase());
    for (key, v) in [("mobile", &mobile), ("whatsapp", &whatsapp)] {
        if let Some(s) = v.as_deref() {
            if !s.chars().all(|c| c.is_ascii_digit()) {
                return Err(HandlerErr::bad_params(format!("{} must be digits only", key)));
            }
        }
    }
    if let Some(e) = email.as_deref() {
        if !valid_email(e) {
            return Err(HandlerErr::bad_params("email is not valid"));
        }
    }

    let now = now_utc();
    let tx = begin(conn)?;
    tx.execute(
        "UPDATE users SET
           username = COALESCE(?, username),
           gender = COALESCE(?, gender),
           birth_year = COALESCE(?, birth_year),
           bio = COALESCE(?, bio),
           updated_at = ?
         WHERE id = ?",
        rusqlite::params![&username, &gender, birth_year, &bio, &now, &user_id],
    )
    .map_err(write_err("db_update_failed", "users"))?;

    if mobile.is_some() || whatsapp.is_some() || email.is_some() {
        let changed = tx
            .execute(
                "UPDATE contacts SET
                   mobile = COALESCE(?, mobile),
                   whatsapp = COALESCE(?, whatsapp),
                   email = COALESCE(?, email),
                   updated_by = ?,
                   updated_at = ?
                 WHERE user_id = ?",
                rusqlite::params![&mobile, &whatsapp, &email, &session.user_id, &now, &user_id],
            )
            .map_err(write_err("db_update_failed", "contacts"))?;
        if changed == 0 {
            let Some(email) = email.as_deref() else {
                return Err(HandlerErr::bad_params(
                    "email is required to add contact details",
                ));
            };
            tx.execute(
                "INSERT INTO contacts(user_id, mobile, whatsapp, email, created_by, created_at,
                   updated_by, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    &user_id,
                    &mobile,
                    &whatsapp,
                    email,
                    &session.user_id,
                    &now,
                    &session.user_id,
                    &now
                ],
            )
            .map_err(write_err("db_insert_failed", "contacts"))?;
        }
    }
    commit(tx)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(with_session(state, req, list_users)),
        "users.get" => Some(with_session(state, req, get_user)),
        "users.update" => Some(with_user(state, req, update_user)),
        _ => None,
    }
}
