use crate::auth::{hash_password, verify_password};
use crate::config::Config;
use crate::db::now_utc;
use crate::ipc::error::{err, query_err, write_err, HandlerErr};
use crate::ipc::helpers::{
    begin, commit, get_optional_str, get_required_str, get_text, new_id, require_user_row,
    respond, with_user, with_user_config, HandlerResult,
};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub const MIN_PASSWORD_LEN: usize = 8;

struct PasswordRow {
    hash: String,
    attempt_count: i64,
    is_allowed: bool,
    force_change: bool,
}

pub fn valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

pub fn store_password(
    conn: &Connection,
    user_id: &str,
    password: &str,
    rounds: u32,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO passwords(user_id, password_hash, attempt_count, is_allowed, force_change)
         VALUES(?, ?, 0, 1, 0)
         ON CONFLICT(user_id) DO UPDATE SET
           password_hash = excluded.password_hash,
           attempt_count = 0,
           is_allowed = 1,
           force_change = 0",
        (user_id, hash_password(password, rounds)),
    )
    .map_err(write_err("db_update_failed", "passwords"))?;
    Ok(())
}

fn handle_bootstrap(state: &mut AppState, req: &Request) -> serde_json::Value {
    let rounds = state.config.hash_rounds;
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match bootstrap(conn, &req.params, rounds) {
        Ok(session) => {
            let result = json!({ "userId": session.user_id, "username": session.username });
            tracing::info!(user = %session.username, "workspace bootstrapped");
            state.session = Some(session);
            respond(req, Ok(result))
        }
        Err(e) => e.response(&req.id),
    }
}

fn bootstrap(
    conn: &Connection,
    params: &serde_json::Value,
    rounds: u32,
) -> Result<Session, HandlerErr> {
    let username = get_text(params, "username", 64)?;
    let email = get_text(params, "email", 254)?.to_lowercase();
    let password = get_required_str(params, "password")?;
    let gender = get_optional_str(params, "gender").map(|g| g.to_uppercase());
    if !valid_email(&email) {
        return Err(HandlerErr::bad_params("email is not valid"));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    if let Some(g) = gender.as_deref() {
        if g != "M" && g != "F" {
            return Err(HandlerErr::bad_params("gender must be M or F"));
        }
    }

    let existing: i64 = conn
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .map_err(query_err)?;
    if existing > 0 {
        return Err(HandlerErr::new("conflict", "workspace already has users"));
    }

    let user_id = new_id();
    let now = now_utc();
    let tx = begin(conn)?;
    tx.execute(
        "INSERT INTO users(id, student_no, username, gender, created_at, updated_at)
         VALUES(?, 1, ?, ?, ?, ?)",
        (&user_id, &username, &gender, &now, &now),
    )
    .map_err(write_err("db_insert_failed", "users"))?;
    tx.execute(
        "INSERT INTO contacts(user_id, email, created_by, created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&user_id, &email, &user_id, &now, &user_id, &now),
    )
    .map_err(write_err("db_insert_failed", "contacts"))?;
    store_password(&tx, &user_id, &password, rounds)?;
    commit(tx)?;

    Ok(Session { user_id, username })
}

fn find_login(conn: &Connection, login: &str) -> Result<Option<(String, String)>, HandlerErr> {
    conn.query_row(
        "SELECT u.id, u.username
         FROM users u
         LEFT JOIN contacts c ON c.user_id = u.id
         WHERE c.email = ?1 COLLATE NOCASE OR u.username = ?1 COLLATE NOCASE
         ORDER BY (c.email = ?1 COLLATE NOCASE) DESC, u.student_no
         LIMIT 1",
        [login],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
    .map_err(query_err)
}

fn password_row(conn: &Connection, user_id: &str) -> Result<Option<PasswordRow>, HandlerErr> {
    conn.query_row(
        "SELECT password_hash, attempt_count, is_allowed, force_change
         FROM passwords WHERE user_id = ?",
        [user_id],
        |r| {
            Ok(PasswordRow {
                hash: r.get(0)?,
                attempt_count: r.get(1)?,
                is_allowed: r.get::<_, i64>(2)? != 0,
                force_change: r.get::<_, i64>(3)? != 0,
            })
        },
    )
    .optional()
    .map_err(query_err)
}

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let max_attempts = state.config.max_login_attempts;
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match login(conn, &req.params, max_attempts) {
        Ok((session, force_change)) => {
            let result = json!({
                "userId": session.user_id,
                "username": session.username,
                "forceChange": force_change
            });
            tracing::info!(user = %session.username, "signed in");
            state.session = Some(session);
            respond(req, Ok(result))
        }
        Err(e) => {
            state.session = None;
            e.response(&req.id)
        }
    }
}

fn login(
    conn: &Connection,
    params: &serde_json::Value,
    max_attempts: u32,
) -> Result<(Session, bool), HandlerErr> {
    let login = get_required_str(params, "login")?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;

    let invalid = || HandlerErr::new("invalid_credentials", "unknown login or wrong password");
    let Some((user_id, username)) = find_login(conn, &login)? else {
        return Err(invalid());
    };
    let Some(row) = password_row(conn, &user_id)? else {
        return Err(invalid());
    };
    if !row.is_allowed {
        return Err(HandlerErr::new(
            "account_locked",
            "account is locked; ask an administrator to unlock it",
        ));
    }

    let now = now_utc();
    if !verify_password(password, &row.hash) {
        let attempts = row.attempt_count + 1;
        let locked = attempts >= i64::from(max_attempts);
        conn.execute(
            "UPDATE passwords SET attempt_count = ?, last_attempt_at = ?, is_allowed = ?
             WHERE user_id = ?",
            (attempts, &now, if locked { 0 } else { 1 }, &user_id),
        )
        .map_err(write_err("db_update_failed", "passwords"))?;
        if locked {
            tracing::warn!(user = %username, attempts, "account locked after failed logins");
        }
        return Err(invalid().with_details(json!({
            "attemptsLeft": (i64::from(max_attempts) - attempts).max(0)
        })));
    }

    conn.execute(
        "UPDATE passwords SET attempt_count = 0, last_attempt_at = ?1, last_success_at = ?1
         WHERE user_id = ?2",
        (&now, &user_id),
    )
    .map_err(write_err("db_update_failed", "passwords"))?;

    Ok((Session { user_id, username }, row.force_change))
}

fn handle_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(session) = state.session.take() {
        tracing::info!(user_id = %session.user_id, "signed out");
    }
    respond(req, Ok(json!({ "ok": true })))
}

fn whoami(conn: &Connection, session: &Session, _params: &serde_json::Value) -> HandlerResult {
    // The name is read back because users.update may have renamed this user.
    let (username, student_no): (String, i64) = conn
        .query_row(
            "SELECT username, student_no FROM users WHERE id = ?",
            [&session.user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("user"))?;

    let mut stmt = conn
        .prepare(
            "SELECT r.role, r.level, ur.class_batch_id, ur.class_region_id, ur.class_group_id
             FROM user_roles ur
             JOIN roles r ON r.id = ur.role_id
             WHERE ur.user_id = ?
             ORDER BY r.level DESC, r.role",
        )
        .map_err(query_err)?;
    let roles = stmt
        .query_map([&session.user_id], |r| {
            Ok(json!({
                "role": r.get::<_, String>(0)?,
                "level": r.get::<_, i64>(1)?,
                "classBatchId": r.get::<_, Option<String>>(2)?,
                "classRegionId": r.get::<_, Option<String>>(3)?,
                "classGroupId": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    Ok(json!({
        "userId": session.user_id,
        "username": username,
        "studentNo": student_no,
        "roles": roles
    }))
}

fn set_password(
    conn: &Connection,
    session: &Session,
    config: &Config,
    params: &serde_json::Value,
) -> HandlerResult {
    let user_id = get_optional_str(params, "userId").unwrap_or_else(|| session.user_id.clone());
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    let confirm = params
        .get("confirmPassword")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing confirmPassword"))?;
    if password != confirm {
        return Err(HandlerErr::bad_params("passwords do not match"));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    require_user_row(conn, &user_id)?;
    store_password(conn, &user_id, password, config.hash_rounds)?;
    Ok(json!({ "ok": true }))
}

fn unlock(conn: &Connection, _session: &Session, params: &serde_json::Value) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    let changed = conn
        .execute(
            "UPDATE passwords SET is_allowed = 1, attempt_count = 0 WHERE user_id = ?",
            [&user_id],
        )
        .map_err(write_err("db_update_failed", "passwords"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("password"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.bootstrap" => Some(handle_bootstrap(state, req)),
        "auth.login" => Some(handle_login(state, req)),
        "auth.logout" => Some(handle_logout(state, req)),
        "auth.whoami" => Some(with_user(state, req, whoami)),
        "auth.setPassword" => Some(with_user_config(state, req, set_password)),
        "auth.unlock" => Some(with_user(state, req, unlock)),
        _ => None,
    }
}
