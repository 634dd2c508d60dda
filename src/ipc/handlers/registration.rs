use crate::config::Config;
use crate::db::now_utc;
use crate::ipc::error::{query_err, write_err, HandlerErr};
use crate::ipc::handlers::auth::{store_password, valid_email, MIN_PASSWORD_LEN};
use crate::ipc::helpers::{
    begin, commit, configured_countries, configured_statuses, get_required_str, new_id, respond,
    with_user_config, HandlerResult, BATCH_CODE_SQL,
};
use crate::ipc::types::{AppState, Request, Session};
use crate::whatsapp::{parse_wa_text, ParsedRegistration};
use chrono::Datelike;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

const OLDEST_AGE: i32 = 80;
const YOUNGEST_AGE: i32 = 10;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RegistrationForm {
    #[serde(flatten)]
    fields: ParsedRegistration,
    status: Option<String>,
    bio: Option<String>,
    password: Option<String>,
    visa_status: Option<String>,
}

/// A form that passed validation, with lookups already resolved.
struct Registrant {
    form: RegistrationForm,
    class_batch_id: String,
    referrer_id: Option<String>,
    status: String,
}

fn handle_parse(req: &Request) -> serde_json::Value {
    let result = get_required_str(&req.params, "text").map(|text| {
        let prefill = parse_wa_text(&text);
        let missing = prefill.missing_fields();
        json!({ "prefill": prefill, "missing": missing })
    });
    respond(req, result)
}

fn blank(v: &Option<String>) -> bool {
    v.as_deref().map(str::trim).unwrap_or("").is_empty()
}

fn trimmed(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn batch_id_for_code(conn: &Connection, code: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT cb.id FROM class_batches cb
             JOIN class_names cn ON cn.id = cb.class_name_id
             WHERE {} = ? COLLATE NOCASE",
            BATCH_CODE_SQL
        ),
        [code.trim()],
        |r| r.get(0),
    )
    .optional()
    .map_err(query_err)
}

fn user_id_for_student_no(
    conn: &Connection,
    student_no: i64,
) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT id FROM users WHERE student_no = ?",
        [student_no],
        |r| r.get(0),
    )
    .optional()
    .map_err(query_err)
}

fn exists(conn: &Connection, sql: &str, value: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [value], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(query_err)
}

/// The listed spelling of a form country. Unlisted or blank values are recorded
/// as problems.
fn listed_country(
    countries: &[String],
    field: &'static str,
    value: &Option<String>,
    problems: &mut BTreeMap<&'static str, String>,
) -> Option<String> {
    let Some(country) = trimmed(value) else {
        problems.insert(field, "required".into());
        return None;
    };
    let listed = countries
        .iter()
        .find(|c| c.eq_ignore_ascii_case(&country))
        .cloned();
    if listed.is_none() {
        problems.insert(field, format!("{} is not a listed country", country));
    }
    listed
}

fn validate(conn: &Connection, form: RegistrationForm) -> Result<Registrant, HandlerErr> {
    let mut problems: BTreeMap<&'static str, String> = BTreeMap::new();
    let f = &form.fields;

    let mut class_batch_id = None;
    match trimmed(&f.batch) {
        None => {
            problems.insert("batch", "required".into());
        }
        Some(code) => match batch_id_for_code(conn, &code)? {
            Some(id) => class_batch_id = Some(id),
            None => {
                problems.insert("batch", format!("no batch with code {}", code));
            }
        },
    }

    match trimmed(&f.personal.name) {
        None => {
            problems.insert("personal.name", "required".into());
        }
        Some(name) => {
            if name.chars().count() > 64 {
                problems.insert("personal.name", "at most 64 characters".into());
            } else if exists(
                conn,
                "SELECT 1 FROM users WHERE username = ? COLLATE NOCASE",
                &name,
            )? {
                problems.insert("personal.name", "already registered".into());
            }
        }
    }

    match trimmed(&f.other.email) {
        None => {
            problems.insert("other.email", "required".into());
        }
        Some(email) => {
            if !valid_email(&email) {
                problems.insert("other.email", "not a valid email address".into());
            } else if exists(
                conn,
                "SELECT 1 FROM contacts WHERE email = ? COLLATE NOCASE",
                &email,
            )? {
                problems.insert("other.email", "already registered".into());
            }
        }
    }

    let this_year = chrono::Utc::now().year();
    match f.other.year_of_birth {
        None => {
            problems.insert("other.yearOfBirth", "required".into());
        }
        Some(y) if y < this_year - OLDEST_AGE || y > this_year - YOUNGEST_AGE => {
            problems.insert(
                "other.yearOfBirth",
                format!(
                    "must be between {} and {}",
                    this_year - OLDEST_AGE,
                    this_year - YOUNGEST_AGE
                ),
            );
        }
        Some(_) => {}
    }

    for (field, value) in [
        ("personal.mobile", &f.personal.mobile),
        ("personal.whatsapp", &f.personal.whatsapp),
    ] {
        match trimmed(value) {
            None => {
                problems.insert(field, "required".into());
            }
            Some(v) if !v.chars().all(|c| c.is_ascii_digit()) => {
                problems.insert(field, "digits only".into());
            }
            Some(_) => {}
        }
    }

    for (field, value) in [
        ("hometown.city", &f.hometown.city),
        ("hometown.district", &f.hometown.district),
        ("hometown.state", &f.hometown.state),
        ("residence.city", &f.residence.city),
        ("residence.state", &f.residence.state),
        ("other.education", &f.other.education),
        ("other.profession", &f.other.profession),
    ] {
        if blank(value) {
            problems.insert(field, "required".into());
        }
    }

    let countries = configured_countries(conn)?;
    let hometown_country = listed_country(
        &countries,
        "hometown.country",
        &f.hometown.country,
        &mut problems,
    );
    let residence_country = listed_country(
        &countries,
        "residence.country",
        &f.residence.country,
        &mut problems,
    );

    if let Some(g) = trimmed(&f.personal.gender) {
        if g != "M" && g != "F" {
            problems.insert("personal.gender", "must be M or F".into());
        }
    }

    let statuses = configured_statuses(conn)?;
    let status = trimmed(&form.status).or_else(|| statuses.first().cloned());
    match status.as_deref() {
        Some(s) if statuses.iter().any(|c| c == s) => {}
        Some(s) => {
            problems.insert("status", format!("{} is not a configured status", s));
        }
        None => {
            problems.insert("status", "no registration statuses are configured".into());
        }
    }

    let mut referrer_id = None;
    if let Some(no) = f.referrer.student_id {
        match user_id_for_student_no(conn, no)? {
            Some(id) => referrer_id = Some(id),
            None => {
                problems.insert("referrer.studentId", format!("no student with number {}", no));
            }
        }
    }

    if let Some(pw) = form.password.as_deref() {
        if pw.chars().count() < MIN_PASSWORD_LEN {
            problems.insert(
                "password",
                format!("at least {} characters", MIN_PASSWORD_LEN),
            );
        }
    }

    match (problems.is_empty(), class_batch_id, status) {
        (true, Some(class_batch_id), Some(status)) => {
            let mut form = form;
            form.fields.hometown.country = hometown_country;
            form.fields.residence.country = residence_country;
            Ok(Registrant {
                form,
                class_batch_id,
                referrer_id,
                status,
            })
        }
        _ => Err(HandlerErr::bad_params("registration form has errors")
            .with_details(json!({ "fields": problems }))),
    }
}

fn submit(
    conn: &Connection,
    session: &Session,
    config: &Config,
    params: &serde_json::Value,
) -> HandlerResult {
    let raw = params
        .get("form")
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params("missing form"))?;
    let form: RegistrationForm = serde_json::from_value(raw)
        .map_err(|e| HandlerErr::bad_params(format!("invalid form: {}", e)))?;
    let reg = validate(conn, form)?;
    let f = &reg.form.fields;

    let user_id = new_id();
    let now = now_utc();
    let by = &session.user_id;
    let tx = begin(conn)?;

    let student_no: i64 = tx
        .query_row(
            "SELECT COALESCE(MAX(student_no), 0) + 1 FROM users",
            [],
            |r| r.get(0),
        )
        .map_err(query_err)?;

    tx.execute(
        "INSERT INTO users(id, student_no, username, gender, birth_year, bio, class_batch_id,
           referrer_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &user_id,
            student_no,
            trimmed(&f.personal.name),
            trimmed(&f.personal.gender),
            f.other.year_of_birth,
            trimmed(&reg.form.bio),
            &reg.class_batch_id,
            &reg.referrer_id,
            &now,
            &now,
        ],
    )
    .map_err(write_err("db_insert_failed", "users"))?;

    tx.execute(
        "INSERT INTO contacts(user_id, mobile, whatsapp, email, created_by, created_at,
           updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &user_id,
            trimmed(&f.personal.mobile),
            trimmed(&f.personal.whatsapp),
            trimmed(&f.other.email).map(|e| e.to_lowercase()),
            by,
            &now,
            by,
            &now,
        ],
    )
    .map_err(write_err("db_insert_failed", "contacts"))?;

    if let Some(pw) = reg.form.password.as_deref() {
        store_password(&tx, &user_id, pw, config.hash_rounds)?;
    }

    tx.execute(
        "INSERT INTO addresses(user_id, kind, city, district, state, country, created_by,
           created_at, updated_by, updated_at)
         VALUES(?, 'home', ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &user_id,
            trimmed(&f.hometown.city),
            trimmed(&f.hometown.district),
            trimmed(&f.hometown.state),
            trimmed(&f.hometown.country),
            by,
            &now,
            by,
            &now,
        ],
    )
    .map_err(write_err("db_insert_failed", "addresses"))?;
    tx.execute(
        "INSERT INTO addresses(user_id, kind, city, state, country, zip, created_by, created_at,
           updated_by, updated_at)
         VALUES(?, 'residence', ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &user_id,
            trimmed(&f.residence.city),
            trimmed(&f.residence.state),
            trimmed(&f.residence.country),
            trimmed(&f.residence.zip),
            by,
            &now,
            by,
            &now,
        ],
    )
    .map_err(write_err("db_insert_failed", "addresses"))?;

    tx.execute(
        "INSERT INTO other_details(user_id, education, profession, visa_status, created_by,
           created_at, updated_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &user_id,
            trimmed(&f.other.education),
            trimmed(&f.other.profession),
            trimmed(&reg.form.visa_status),
            by,
            &now,
            by,
            &now,
        ],
    )
    .map_err(write_err("db_insert_failed", "other_details"))?;

    tx.execute(
        "INSERT INTO user_reg_statuses(id, user_id, status, created_by, created_at, updated_by,
           updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![new_id(), &user_id, &reg.status, by, &now, by, &now],
    )
    .map_err(write_err("db_insert_failed", "user_reg_statuses"))?;

    commit(tx)?;
    tracing::info!(student_no, batch = ?f.batch, "student registered");

    Ok(json!({ "userId": user_id, "studentNo": student_no }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "registration.parseWhatsApp" => Some(handle_parse(req)),
        "registration.submit" => Some(with_user_config(state, req, submit)),
        _ => None,
    }
}
