use rusqlite::ffi;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn query_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

/// Maps a write failure to `code`, with `table` in the details. Uniqueness
/// violations become `conflict` and dangling references `not_found`.
pub fn write_err(
    code: &'static str,
    table: &'static str,
) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| {
        let code = match constraint_kind(&e) {
            Some(ffi::SQLITE_CONSTRAINT_UNIQUE) | Some(ffi::SQLITE_CONSTRAINT_PRIMARYKEY) => {
                "conflict"
            }
            Some(ffi::SQLITE_CONSTRAINT_FOREIGNKEY) => "not_found",
            _ => code,
        };
        HandlerErr::new(code, e.to_string()).with_details(json!({ "table": table }))
    }
}

/// Foreign-key failures on delete mean other rows still reference the target.
pub fn delete_err(table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| {
        if constraint_kind(&e) == Some(ffi::SQLITE_CONSTRAINT_FOREIGNKEY) {
            return HandlerErr::new("in_use", format!("{} row is still referenced", table))
                .with_details(json!({ "table": table }));
        }
        HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": table }))
    }
}

fn constraint_kind(e: &rusqlite::Error) -> Option<i32> {
    match e {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Some(inner.extended_code)
        }
        _ => None,
    }
}
