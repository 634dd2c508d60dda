use crate::db::now_utc;
use crate::ipc::error::{query_err, write_err, HandlerErr};
use crate::ipc::helpers::{
    collect_rows, get_date, get_optional_text, get_required_i64, get_required_str, new_id,
    require_row, require_user_row, with_session, with_user, HandlerResult,
};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreStats {
    pub count: usize,
    pub mean: Option<f64>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub mean_percent: Option<f64>,
}

fn percent_of(score: f64, max_score: i64) -> f64 {
    score * 100.0 / max_score as f64
}

pub fn score_stats(scores: &[i64], max_score: i64) -> ScoreStats {
    if scores.is_empty() {
        return ScoreStats {
            count: 0,
            mean: None,
            min: None,
            max: None,
            mean_percent: None,
        };
    }
    // Scores may reach i64::MAX, so the total is kept wide.
    let total: i128 = scores.iter().map(|&s| i128::from(s)).sum();
    let mean = total as f64 / scores.len() as f64;
    ScoreStats {
        count: scores.len(),
        mean: Some(mean),
        min: scores.iter().copied().min(),
        max: scores.iter().copied().max(),
        mean_percent: (max_score > 0).then(|| percent_of(mean, max_score)),
    }
}

fn tests_create(conn: &Connection, session: &Session, params: &serde_json::Value) -> HandlerResult {
    let class_batch_id = get_required_str(params, "classBatchId")?;
    let test_date = get_date(params, "testDate")?;
    let max_score = get_required_i64(params, "maxScore")?;
    if max_score <= 0 {
        return Err(HandlerErr::bad_params("maxScore must be positive"));
    }
    require_row(conn, "class_batches", &class_batch_id, "class batch")?;

    let id = new_id();
    let now = now_utc();
    conn.execute(
        "INSERT INTO test_sessions(id, class_batch_id, test_date, max_score, created_by,
           created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &class_batch_id,
            &test_date,
            max_score,
            &session.user_id,
            &now,
            &session.user_id,
            &now
        ],
    )
    .map_err(write_err("db_insert_failed", "test_sessions"))?;
    Ok(json!({ "testSessionId": id }))
}

fn tests_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_batch_id = get_required_str(params, "classBatchId")?;
    let tests = collect_rows(
        conn,
        "SELECT t.id, t.test_date, t.max_score,
                (SELECT COUNT(*) FROM test_scores s WHERE s.test_session_id = t.id)
         FROM test_sessions t
         WHERE t.class_batch_id = ?
         ORDER BY t.test_date",
        [&class_batch_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "testDate": r.get::<_, String>(1)?,
                "maxScore": r.get::<_, i64>(2)?,
                "scored": r.get::<_, i64>(3)?,
            }))
        },
    )?;
    Ok(json!({ "tests": tests }))
}

fn max_score_of(conn: &Connection, test_session_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT max_score FROM test_sessions WHERE id = ?",
        [test_session_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| HandlerErr::not_found("test session"))
}

fn scores_set(conn: &Connection, session: &Session, params: &serde_json::Value) -> HandlerResult {
    let test_session_id = get_required_str(params, "testSessionId")?;
    let user_id = get_required_str(params, "userId")?;
    let score = get_required_i64(params, "score")?;
    let note = get_optional_text(params, "note", 255)?;
    let max_score = max_score_of(conn, &test_session_id)?;
    if !(0..=max_score).contains(&score) {
        return Err(HandlerErr::bad_params(format!(
            "score must be between 0 and {}",
            max_score
        )));
    }
    require_user_row(conn, &user_id)?;

    let now = now_utc();
    conn.execute(
        "INSERT INTO test_scores(id, test_session_id, user_id, score, note, created_by,
           created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(test_session_id, user_id) DO UPDATE SET
           score = excluded.score,
           note = excluded.note,
           updated_by = excluded.updated_by,
           updated_at = excluded.updated_at",
        rusqlite::params![
            new_id(),
            &test_session_id,
            &user_id,
            score,
            &note,
            &session.user_id,
            &now,
            &session.user_id,
            &now
        ],
    )
    .map_err(write_err("db_update_failed", "test_scores"))?;
    Ok(json!({ "ok": true }))
}

fn scores_for_test(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let test_session_id = get_required_str(params, "testSessionId")?;
    let max_score = max_score_of(conn, &test_session_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT s.user_id, u.username, u.student_no, s.score, s.note
             FROM test_scores s
             JOIN users u ON u.id = s.user_id
             WHERE s.test_session_id = ?
             ORDER BY u.student_no",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map([&test_session_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let scores: Vec<i64> = rows.iter().map(|r| r.3).collect();
    let stats = score_stats(&scores, max_score);
    let rows: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(user_id, username, student_no, score, note)| {
            json!({
                "userId": user_id,
                "username": username,
                "studentNo": student_no,
                "score": score,
                "note": note,
            })
        })
        .collect();

    Ok(json!({
        "maxScore": max_score,
        "rows": rows,
        "stats": {
            "count": stats.count,
            "mean": stats.mean,
            "min": stats.min,
            "max": stats.max,
            "meanPercent": stats.mean_percent,
        }
    }))
}

fn scores_for_user(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    require_user_row(conn, &user_id)?;
    let scores = collect_rows(
        conn,
        "SELECT s.test_session_id, t.test_date, t.class_batch_id, s.score, t.max_score, s.note
         FROM test_scores s
         JOIN test_sessions t ON t.id = s.test_session_id
         WHERE s.user_id = ?
         ORDER BY t.test_date",
        [&user_id],
        |r| {
            let score: i64 = r.get(3)?;
            let max_score: i64 = r.get(4)?;
            Ok(json!({
                "testSessionId": r.get::<_, String>(0)?,
                "testDate": r.get::<_, String>(1)?,
                "classBatchId": r.get::<_, String>(2)?,
                "score": score,
                "maxScore": max_score,
                "percent": percent_of(score as f64, max_score),
                "note": r.get::<_, Option<String>>(5)?,
            }))
        },
    )?;
    Ok(json!({ "scores": scores }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "tests.create" => with_user(state, req, tests_create),
        "tests.list" => with_session(state, req, tests_list),
        "scores.set" => with_user(state, req, scores_set),
        "scores.forTest" => with_session(state, req, scores_for_test),
        "scores.forUser" => with_session(state, req, scores_for_user),
        _ => return None,
    };
    Some(resp)
}
