mod test_support;

use serde_json::json;
use test_support::{bootstrap_admin, request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn import_rejects_non_database_files_and_keeps_the_session() {
    let workspace = temp_dir("sims-backup-ipc");
    let out_dir = temp_dir("sims-backup-ipc-out");
    let bundle = out_dir.join("good.simsbackup.zip");
    let junk = out_dir.join("roster.csv");
    std::fs::write(&junk, b"name,email\nfaisal,faisal@example.org\n").expect("write junk");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _admin = bootstrap_admin(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "exp",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );

    let e = request_err(
        &mut stdin,
        &mut reader,
        "junk",
        "backup.importWorkspaceBundle",
        json!({ "inPath": junk.to_string_lossy() }),
        "bad_params",
    );
    assert!(
        e["message"]
            .as_str()
            .unwrap_or("")
            .contains("does not contain an sqlite database"),
        "{}",
        e
    );
    assert!(!workspace.join("sims.sqlite3.importing").exists());

    // Still open and still signed in.
    let users = request_ok(&mut stdin, &mut reader, "u1", "users.list", json!({}));
    assert_eq!(users["users"].as_array().map(|a| a.len()), Some(1));
    let who = request_ok(&mut stdin, &mut reader, "w1", "auth.whoami", json!({}));
    assert_eq!(who["username"], "Admin");

    let restored = request_ok(
        &mut stdin,
        &mut reader,
        "imp",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(restored["reopened"], true);
    assert_eq!(restored["bundleFormatDetected"], "sims-workspace-v1");
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "u2",
        "users.list",
        json!({}),
        "not_authenticated",
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}
