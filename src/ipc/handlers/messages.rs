use crate::db::now_utc;
use crate::ipc::error::{query_err, write_err, HandlerErr};
use crate::ipc::helpers::{
    collect_rows, get_optional_bool, get_required_str, get_text, new_id, with_user,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const MAX_BODY: usize = 500;

/// `recipient` may be a user id or a username.
fn resolve_recipient(conn: &Connection, recipient: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT id FROM users WHERE id = ?1 OR username = ?1 COLLATE NOCASE
         ORDER BY (id = ?1) DESC, student_no
         LIMIT 1",
        [recipient],
        |r| r.get(0),
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| HandlerErr::not_found("recipient"))
}

fn send(conn: &Connection, session: &Session, params: &serde_json::Value) -> HandlerResult {
    let recipient = get_required_str(params, "recipient")?;
    let body = get_text(params, "body", MAX_BODY)?;
    let recipient_id = resolve_recipient(conn, &recipient)?;

    let id = new_id();
    conn.execute(
        "INSERT INTO messages(id, sender_id, recipient_id, body, sent_at) VALUES(?, ?, ?, ?, ?)",
        (&id, &session.user_id, &recipient_id, &body, now_utc()),
    )
    .map_err(write_err("db_insert_failed", "messages"))?;
    Ok(json!({ "messageId": id, "recipientId": recipient_id }))
}

fn inbox(conn: &Connection, session: &Session, params: &serde_json::Value) -> HandlerResult {
    let unread_only = get_optional_bool(params, "unreadOnly")?.unwrap_or(false);
    let messages = collect_rows(
        conn,
        "SELECT m.id, m.sender_id, u.username, m.body, m.sent_at, m.read_at
         FROM messages m
         JOIN users u ON u.id = m.sender_id
         WHERE m.recipient_id = ?1 AND (?2 = 0 OR m.read_at IS NULL)
         ORDER BY m.sent_at DESC, m.rowid DESC",
        (&session.user_id, unread_only as i64),
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "senderId": r.get::<_, String>(1)?,
                "sender": r.get::<_, String>(2)?,
                "body": r.get::<_, String>(3)?,
                "sentAt": r.get::<_, String>(4)?,
                "readAt": r.get::<_, Option<String>>(5)?,
            }))
        },
    )?;
    Ok(json!({ "messages": messages }))
}

fn sent(conn: &Connection, session: &Session, _params: &serde_json::Value) -> HandlerResult {
    let messages = collect_rows(
        conn,
        "SELECT m.id, m.recipient_id, u.username, m.body, m.sent_at, m.read_at
         FROM messages m
         JOIN users u ON u.id = m.recipient_id
         WHERE m.sender_id = ?
         ORDER BY m.sent_at DESC, m.rowid DESC",
        [&session.user_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "recipientId": r.get::<_, String>(1)?,
                "recipient": r.get::<_, String>(2)?,
                "body": r.get::<_, String>(3)?,
                "sentAt": r.get::<_, String>(4)?,
                "readAt": r.get::<_, Option<String>>(5)?,
            }))
        },
    )?;
    Ok(json!({ "messages": messages }))
}

fn mark_read(conn: &Connection, session: &Session, params: &serde_json::Value) -> HandlerResult {
    let message_id = get_required_str(params, "messageId")?;
    let recipient_id: String = conn
        .query_row(
            "SELECT recipient_id FROM messages WHERE id = ?",
            [&message_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("message"))?;
    // Senders see the message in `sent` but cannot mark it read.
    if recipient_id != session.user_id {
        return Err(HandlerErr::not_found("message"));
    }
    conn.execute(
        "UPDATE messages SET read_at = COALESCE(read_at, ?) WHERE id = ?",
        (now_utc(), &message_id),
    )
    .map_err(write_err("db_update_failed", "messages"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "messages.send" => with_user(state, req, send),
        "messages.inbox" => with_user(state, req, inbox),
        "messages.sent" => with_user(state, req, sent),
        "messages.markRead" => with_user(state, req, mark_read),
        _ => return None,
    };
    Some(resp)
}
