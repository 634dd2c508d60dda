#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    spawn_sidecar_with(&[])
}

/// Low hash rounds keep password-heavy tests fast.
pub fn spawn_sidecar_with(env: &[(&str, &str)]) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_simsd");
    let mut cmd = Command::new(exe);
    cmd.env("SIMSD_HASH_ROUNDS", "2")
        .env_remove("SIMSD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    for (k, v) in env {
        cmd.env(k, v);
    }
    let mut child = cmd.spawn().expect("spawn simsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Returns the error object after asserting the request failed with `code`.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    code: &str,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    let error = value.get("error").cloned().expect("error object");
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some(code),
        "{} error: {}",
        method,
        error
    );
    error
}

pub fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

/// Selects a fresh workspace and signs in as its first user.
pub fn bootstrap_admin(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = request_ok(
        stdin,
        reader,
        "boot",
        "auth.bootstrap",
        json!({ "username": "Admin", "email": "admin@example.org", "password": "admin-pass-1" }),
    );
    str_field(&admin, "userId")
}

/// Creates class `GLB` with batch `B03` (code `GLB-B03`) and returns the batch id.
pub fn create_batch(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let class_name = request_ok(
        stdin,
        reader,
        "cn",
        "classNames.create",
        json!({ "name": "GLB" }),
    );
    let status = request_ok(
        stdin,
        reader,
        "bs",
        "batchStatuses.create",
        json!({ "status": "Running" }),
    );
    let batch = request_ok(
        stdin,
        reader,
        "cb",
        "batches.create",
        json!({
            "classNameId": str_field(&class_name, "classNameId"),
            "batchNo": "B03",
            "startDate": "2024-01-07",
            "statusId": str_field(&status, "statusId")
        }),
    );
    str_field(&batch, "classBatchId")
}

pub fn sample_form(name: &str, email: &str) -> serde_json::Value {
    json!({
        "batch": "GLB-B03",
        "personal": {
            "name": name,
            "mobile": "919800000001",
            "whatsapp": "919800000001",
            "gender": "M"
        },
        "hometown": {
            "city": "Hyderabad",
            "district": "Rangareddy",
            "state": "Telangana",
            "country": "India"
        },
        "residence": { "city": "Dallas", "state": "Texas", "country": "USA", "zip": "75001" },
        "other": {
            "yearOfBirth": 1990,
            "education": "BE",
            "profession": "Engineer",
            "email": email
        },
        "referrer": {}
    })
}
