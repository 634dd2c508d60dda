use crate::config::Config;
use crate::db;
use crate::ipc::error::{delete_err, err, ok, query_err, HandlerErr};
use crate::ipc::types::{AppState, Request, Session};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Transaction};

pub type HandlerResult = Result<serde_json::Value, HandlerErr>;

pub fn respond(req: &Request, result: HandlerResult) -> serde_json::Value {
    match result {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    }
}

/// Runs a read-only handler against the open workspace. Only the `lookup.*`
/// option lists go through here; everything else needs a session.
pub fn with_conn(
    state: &AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> HandlerResult,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    respond(req, f(conn, &req.params))
}

/// Runs a read-only handler for a signed-in user.
pub fn with_session(
    state: &AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> HandlerResult,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if state.session.is_none() {
        return err(&req.id, "not_authenticated", "sign in first", None);
    }
    respond(req, f(conn, &req.params))
}

/// Runs a handler that needs the signed-in user (for audit columns or ownership).
pub fn with_user(
    state: &AppState,
    req: &Request,
    f: fn(&Connection, &Session, &serde_json::Value) -> HandlerResult,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(session) = state.session.as_ref() else {
        return err(&req.id, "not_authenticated", "sign in first", None);
    };
    respond(req, f(conn, session, &req.params))
}

/// `with_user` for handlers that also read daemon configuration.
pub fn with_user_config(
    state: &AppState,
    req: &Request,
    f: fn(&Connection, &Session, &Config, &serde_json::Value) -> HandlerResult,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(session) = state.session.as_ref() else {
        return err(&req.id, "not_authenticated", "sign in first", None);
    };
    respond(req, f(conn, session, &state.config, &req.params))
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn begin(conn: &Connection) -> Result<Transaction<'_>, HandlerErr> {
    conn.unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))
}

pub fn commit(tx: Transaction<'_>) -> Result<(), HandlerErr> {
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Required string that must be non-empty after trimming and at most `max` chars.
pub fn get_text(params: &serde_json::Value, key: &str, max: usize) -> Result<String, HandlerErr> {
    let v = get_required_str(params, key)?;
    if v.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    check_len(key, &v, max)?;
    Ok(v)
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_optional_text(
    params: &serde_json::Value,
    key: &str,
    max: usize,
) -> Result<Option<String>, HandlerErr> {
    let v = get_optional_str(params, key);
    if let Some(s) = v.as_deref() {
        check_len(key, s, max)?;
    }
    Ok(v)
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_optional_bool(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

/// `YYYY-MM-DD`, returned normalized.
pub fn get_date(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, key)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn check_len(key: &str, value: &str, max: usize) -> Result<(), HandlerErr> {
    if value.chars().count() > max {
        return Err(HandlerErr::bad_params(format!(
            "{} must be at most {} characters",
            key, max
        )));
    }
    Ok(())
}

/// Only ever called with table names from this crate.
pub fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(&format!("SELECT 1 FROM {} WHERE id = ?", table), [id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(query_err)
}

pub fn require_row(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, table, id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(what))
    }
}

pub fn require_user_row(conn: &Connection, user_id: &str) -> Result<(), HandlerErr> {
    require_row(conn, "users", user_id, "user")
}

pub fn delete_row(
    conn: &Connection,
    table: &'static str,
    id: &str,
    what: &str,
) -> HandlerResult {
    require_row(conn, table, id, what)?;
    conn.execute(&format!("DELETE FROM {} WHERE id = ?", table), [id])
        .map_err(delete_err(table))?;
    Ok(serde_json::json!({ "ok": true }))
}

pub fn collect_rows<F>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: F,
) -> Result<Vec<serde_json::Value>, HandlerErr>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value>,
{
    let mut stmt = conn.prepare(sql).map_err(query_err)?;
    stmt.query_map(params, map)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)
}

/// Statuses allowed for registration, from workspace settings.
pub fn configured_statuses(conn: &Connection) -> Result<Vec<String>, HandlerErr> {
    db::settings_get_list(conn, crate::config::SETTING_STATUSES)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:?}")))
}

/// Countries a registration may name, from workspace settings.
pub fn configured_countries(conn: &Connection) -> Result<Vec<String>, HandlerErr> {
    db::settings_get_list(conn, crate::config::SETTING_COUNTRIES)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:?}")))
}

/// The `<className>-<batchNo>` code staff use to name a batch.
pub const BATCH_CODE_SQL: &str = "(cn.name || '-' || cb.batch_no)";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_params_are_trimmed_and_bounded() {
        let p = json!({ "name": "  GLB  ", "long": "abcdefghij", "blank": "   " });
        assert_eq!(get_text(&p, "name", 8).expect("name"), "GLB");
        assert_eq!(get_text(&p, "long", 8).unwrap_err().code, "bad_params");
        assert_eq!(get_text(&p, "blank", 8).unwrap_err().code, "bad_params");
        assert_eq!(get_optional_str(&p, "blank"), None);
        assert_eq!(get_text(&p, "missing", 8).unwrap_err().message, "missing missing");
    }

    #[test]
    fn dates_are_validated() {
        let p = json!({ "d": "2024-02-29", "bad": "2023-02-29" });
        assert_eq!(get_date(&p, "d").expect("date"), "2024-02-29");
        assert!(get_date(&p, "bad").is_err());
    }

    #[test]
    fn optional_numbers_reject_wrong_types() {
        let p = json!({ "n": 4, "s": "4", "z": null });
        assert_eq!(get_optional_i64(&p, "n").expect("n"), Some(4));
        assert_eq!(get_optional_i64(&p, "z").expect("z"), None);
        assert!(get_optional_i64(&p, "s").is_err());
        assert_eq!(get_optional_bool(&p, "absent").expect("absent"), None);
    }
}
