use crate::config::LIST_SETTINGS;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "sims.sqlite3";

const AUDIT_COLUMNS: &str = "created_by TEXT NOT NULL REFERENCES users(id),
            created_at TEXT NOT NULL,
            updated_by TEXT NOT NULL REFERENCES users(id),
            updated_at TEXT NOT NULL";

pub const ATTENDANCE_STATUSES: &[(&str, &str, bool)] = &[
    ("P", "Present", true),
    ("A", "Absent", false),
    ("L", "Late", true),
    ("E", "Excused", false),
];

pub fn now_utc() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    create_people_tables(&conn)?;
    create_org_tables(&conn)?;
    create_activity_tables(&conn)?;
    create_lookup_tables(&conn)?;

    // Workspaces created before batch enrollment and forced password changes existed.
    ensure_users_class_batch_id(&conn)?;
    ensure_passwords_force_change(&conn)?;

    seed_attendance_statuses(&conn)?;
    seed_default_settings(&conn)?;

    Ok(conn)
}

fn create_people_tables(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            student_no INTEGER NOT NULL UNIQUE,
            username TEXT NOT NULL,
            gender TEXT CHECK(gender IS NULL OR gender IN ('M', 'F')),
            birth_year INTEGER CHECK(birth_year IS NULL OR birth_year BETWEEN 1900 AND 2099),
            bio TEXT,
            class_batch_id TEXT REFERENCES class_batches(id),
            referrer_id TEXT REFERENCES users(id),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_username ON users(username COLLATE NOCASE)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS passwords(
            user_id TEXT PRIMARY KEY REFERENCES users(id),
            password_hash TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            is_allowed INTEGER NOT NULL DEFAULT 1,
            force_change INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT,
            last_success_at TEXT
        )",
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS contacts(
            user_id TEXT PRIMARY KEY REFERENCES users(id),
            mobile TEXT,
            whatsapp TEXT,
            email TEXT NOT NULL,
            {AUDIT_COLUMNS}
        )"
        ),
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email COLLATE NOCASE)",
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS addresses(
            user_id TEXT NOT NULL REFERENCES users(id),
            kind TEXT NOT NULL CHECK(kind IN ('home', 'residence')),
            city TEXT,
            district TEXT,
            state TEXT,
            country TEXT,
            area TEXT,
            zip TEXT,
            {AUDIT_COLUMNS},
            PRIMARY KEY(user_id, kind)
        )"
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS other_details(
            user_id TEXT PRIMARY KEY REFERENCES users(id),
            education TEXT NOT NULL,
            profession TEXT NOT NULL,
            visa_status TEXT,
            citizenship TEXT,
            spouse INTEGER,
            sons INTEGER,
            daughters INTEGER,
            {AUDIT_COLUMNS}
        )"
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS progress_records(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            note TEXT NOT NULL,
            {AUDIT_COLUMNS}
        )"
        ),
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_progress_records_user ON progress_records(user_id)",
        [],
    )?;

    // At most one preferred call-out time per student.
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS call_out_times(
            user_id TEXT PRIMARY KEY REFERENCES users(id),
            hours TEXT NOT NULL,
            timezone TEXT NOT NULL,
            {AUDIT_COLUMNS}
        )"
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS user_reg_statuses(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            status TEXT NOT NULL,
            {AUDIT_COLUMNS}
        )"
        ),
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_reg_statuses_user ON user_reg_statuses(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS messages(
            id TEXT PRIMARY KEY,
            sender_id TEXT NOT NULL REFERENCES users(id),
            recipient_id TEXT NOT NULL REFERENCES users(id),
            body TEXT NOT NULL,
            sent_at TEXT NOT NULL,
            read_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_id)",
        [],
    )?;
    Ok(())
}

fn create_org_tables(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS class_names(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            {AUDIT_COLUMNS}
        )"
        ),
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_batch_statuses(
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL UNIQUE
        )",
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS class_batches(
            id TEXT PRIMARY KEY,
            class_name_id TEXT NOT NULL REFERENCES class_names(id),
            batch_no TEXT NOT NULL,
            start_date TEXT NOT NULL,
            status_id TEXT NOT NULL REFERENCES class_batch_statuses(id),
            {AUDIT_COLUMNS},
            UNIQUE(class_name_id, batch_no)
        )"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS class_regions(
            id TEXT PRIMARY KEY,
            class_batch_id TEXT NOT NULL REFERENCES class_batches(id),
            section TEXT NOT NULL,
            description TEXT,
            {AUDIT_COLUMNS},
            UNIQUE(class_batch_id, section)
        )"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS class_groups(
            id TEXT PRIMARY KEY,
            class_region_id TEXT NOT NULL REFERENCES class_regions(id),
            name TEXT NOT NULL,
            description TEXT,
            start_index INTEGER,
            end_index INTEGER,
            {AUDIT_COLUMNS},
            UNIQUE(class_region_id, name)
        )"
        ),
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_statuses(
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL UNIQUE,
            description TEXT
        )",
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS student_groups(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            class_group_id TEXT NOT NULL REFERENCES class_groups(id),
            index_no INTEGER NOT NULL,
            status_id TEXT NOT NULL REFERENCES user_statuses(id),
            {AUDIT_COLUMNS},
            UNIQUE(user_id, class_group_id),
            UNIQUE(class_group_id, index_no)
        )"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS class_group_mentors(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            class_batch_id TEXT NOT NULL REFERENCES class_batches(id),
            class_region_id TEXT REFERENCES class_regions(id),
            class_group_id TEXT REFERENCES class_groups(id),
            {AUDIT_COLUMNS}
        )"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS class_batch_teachers(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            class_batch_id TEXT NOT NULL REFERENCES class_batches(id),
            {AUDIT_COLUMNS},
            UNIQUE(user_id, class_batch_id)
        )"
        ),
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS roles(
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL UNIQUE,
            level INTEGER NOT NULL UNIQUE,
            description TEXT
        )",
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS user_roles(
            id TEXT PRIMARY KEY,
            role_id TEXT NOT NULL REFERENCES roles(id),
            user_id TEXT NOT NULL REFERENCES users(id),
            class_batch_id TEXT REFERENCES class_batches(id),
            class_region_id TEXT REFERENCES class_regions(id),
            class_group_id TEXT REFERENCES class_groups(id),
            {AUDIT_COLUMNS}
        )"
        ),
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_batches_class_name ON class_batches(class_name_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_regions_batch ON class_regions(class_batch_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_groups_region ON class_groups(class_region_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_groups_group ON student_groups(class_group_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_roles_user ON user_roles(user_id)",
        [],
    )?;
    Ok(())
}

fn create_activity_tables(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_statuses(
            code TEXT PRIMARY KEY CHECK(length(code) = 1),
            label TEXT NOT NULL,
            counts_present INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS class_sessions(
            id TEXT PRIMARY KEY,
            class_batch_id TEXT NOT NULL REFERENCES class_batches(id),
            session_date TEXT NOT NULL,
            teacher_id TEXT NOT NULL REFERENCES users(id),
            {AUDIT_COLUMNS},
            UNIQUE(class_batch_id, session_date)
        )"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS user_attendance(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            class_session_id TEXT NOT NULL REFERENCES class_sessions(id),
            status_code TEXT NOT NULL REFERENCES attendance_statuses(code),
            note TEXT,
            late_by_min INTEGER,
            left_early_by_min INTEGER,
            {AUDIT_COLUMNS},
            UNIQUE(user_id, class_session_id)
        )"
        ),
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_attendance_session
         ON user_attendance(class_session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_attendance_user ON user_attendance(user_id)",
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS test_sessions(
            id TEXT PRIMARY KEY,
            class_batch_id TEXT NOT NULL REFERENCES class_batches(id),
            test_date TEXT NOT NULL,
            max_score INTEGER NOT NULL CHECK(max_score > 0),
            {AUDIT_COLUMNS}
        )"
        ),
        [],
    )?;
    // One test per batch per date.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_test_sessions_batch_date
         ON test_sessions(class_batch_id, test_date)",
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS test_scores(
            id TEXT PRIMARY KEY,
            test_session_id TEXT NOT NULL REFERENCES test_sessions(id),
            user_id TEXT NOT NULL REFERENCES users(id),
            score INTEGER NOT NULL,
            note TEXT,
            {AUDIT_COLUMNS},
            UNIQUE(test_session_id, user_id)
        )"
        ),
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_test_scores_user ON test_scores(user_id)",
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS tasks(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            class_batch_id TEXT NOT NULL REFERENCES class_batches(id),
            due_date TEXT NOT NULL,
            {AUDIT_COLUMNS}
        )"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS user_tasks(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            task_id TEXT NOT NULL REFERENCES tasks(id),
            done INTEGER NOT NULL,
            note TEXT,
            {AUDIT_COLUMNS},
            UNIQUE(user_id, task_id)
        )"
        ),
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_tasks_task ON user_tasks(task_id)",
        [],
    )?;
    Ok(())
}

fn create_lookup_tables(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS countries(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            iso2 TEXT,
            iso3 TEXT,
            phonecode TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS states(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            country_id INTEGER NOT NULL REFERENCES countries(id),
            iso2 TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cities(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            state_id INTEGER NOT NULL REFERENCES states(id),
            country_id INTEGER NOT NULL REFERENCES countries(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_states_country ON states(country_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cities_state ON cities(state_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

fn ensure_users_class_batch_id(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "users", "class_batch_id")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE users ADD COLUMN class_batch_id TEXT REFERENCES class_batches(id)",
        [],
    )?;
    Ok(())
}

fn ensure_passwords_force_change(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "passwords", "force_change")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE passwords ADD COLUMN force_change INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn seed_attendance_statuses(conn: &Connection) -> anyhow::Result<()> {
    for (code, label, counts_present) in ATTENDANCE_STATUSES {
        conn.execute(
            "INSERT OR IGNORE INTO attendance_statuses(code, label, counts_present)
             VALUES(?, ?, ?)",
            (code, label, *counts_present as i64),
        )?;
    }
    Ok(())
}

fn seed_default_settings(conn: &Connection) -> anyhow::Result<()> {
    for (key, defaults) in LIST_SETTINGS {
        if settings_get_json(conn, key)?.is_none() {
            settings_set_json(conn, key, &serde_json::json!(defaults))?;
        }
    }
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// A list-valued setting as strings; non-string entries are skipped.
pub fn settings_get_list(conn: &Connection, key: &str) -> anyhow::Result<Vec<String>> {
    let value = settings_get_json(conn, key)?;
    Ok(value
        .as_ref()
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
