#[path = "../src/backup.rs"]
mod backup;

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn write_sample_db(path: &Path, note: &str) -> Vec<u8> {
    let conn = rusqlite::Connection::open(path).expect("create sample db");
    conn.execute_batch(
        "CREATE TABLE notes(id INTEGER PRIMARY KEY, body TEXT NOT NULL);",
    )
    .expect("create notes table");
    for _ in 0..50 {
        conn.execute("INSERT INTO notes(body) VALUES(?)", [note])
            .expect("insert note");
    }
    drop(conn);
    std::fs::read(path).expect("read sample db")
}

fn import(in_path: &Path, workspace: &Path) -> anyhow::Result<backup::ImportSummary> {
    let staged = backup::stage_backup(backup::read_backup(in_path)?, workspace)?;
    staged.check_integrity()?;
    staged.commit()
}

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("sims-backup-src");
    let workspace2 = temp_dir("sims-backup-dst");
    let out_dir = temp_dir("sims-backup-out");

    let bytes = write_sample_db(&workspace.join("sims.sqlite3"), "exported");

    let bundle_path = out_dir.join("workspace.simsbackup.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT);
    assert_eq!(export.entry_count, 3);
    assert_eq!(export.db_sha256.len(), 64);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");
    assert_eq!(manifest["format"], backup::BUNDLE_FORMAT);
    assert_eq!(manifest["dbSha256"], export.db_sha256.as_str());
    archive
        .by_name("db/sims.sqlite3")
        .expect("database entry in bundle");
    archive
        .by_name("meta/workspace.json")
        .expect("workspace metadata entry");

    let import = import(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT);

    let restored = std::fs::read(workspace2.join("sims.sqlite3")).expect("read restored db");
    assert_eq!(restored, bytes);
    assert!(!workspace2.join("sims.sqlite3.importing").exists());
    let conn = rusqlite::Connection::open(workspace2.join("sims.sqlite3")).expect("open restored");
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM notes WHERE body = 'exported'", [], |r| r.get(0))
        .expect("count notes");
    assert_eq!(count, 50);
    drop(conn);

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn tampered_bundle_is_rejected_and_workspace_kept() {
    let out_dir = temp_dir("sims-backup-tampered");
    let workspace = temp_dir("sims-backup-tampered-dst");
    let current = write_sample_db(&workspace.join("sims.sqlite3"), "current");

    let bundle_path = out_dir.join("tampered.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest entry");
        zip.write_all(
            serde_json::json!({
                "format": backup::BUNDLE_FORMAT,
                "dbSha256": "0".repeat(64)
            })
            .to_string()
            .as_bytes(),
        )
        .expect("write manifest");
        zip.start_file("db/sims.sqlite3", opts).expect("db entry");
        zip.write_all(b"swapped-db").expect("write db");
        zip.finish().expect("finish zip");
    }

    let e = import(&bundle_path, &workspace).expect_err("checksum mismatch");
    assert!(format!("{e:#}").contains("checksum"), "{e:#}");
    let kept = std::fs::read(workspace.join("sims.sqlite3")).expect("read kept db");
    assert_eq!(kept, current);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn foreign_bundle_format_is_rejected() {
    let out_dir = temp_dir("sims-backup-foreign");
    let workspace = temp_dir("sims-backup-foreign-dst");
    let bundle_path = out_dir.join("other.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        zip.start_file("manifest.json", zip::write::FileOptions::default())
            .expect("manifest entry");
        zip.write_all(br#"{"format":"gradebook-workspace-v2"}"#)
            .expect("write manifest");
        zip.finish().expect("finish zip");
    }

    let e = import(&bundle_path, &workspace).expect_err("wrong format");
    assert!(e.to_string().contains("unsupported bundle format"), "{e}");

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn legacy_sqlite_import_is_supported() {
    let out_dir = temp_dir("sims-backup-legacy");
    let workspace = temp_dir("sims-backup-legacy-dst");

    let legacy_file = out_dir.join("legacy.sqlite3");
    let bytes = write_sample_db(&legacy_file, "legacy");

    let import = import(&legacy_file, &workspace).expect("import legacy sqlite");
    assert_eq!(import.bundle_format_detected, backup::LEGACY_FORMAT);

    let restored = std::fs::read(workspace.join("sims.sqlite3")).expect("read restored sqlite");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn non_sqlite_file_is_rejected_and_workspace_kept() {
    let out_dir = temp_dir("sims-backup-junk");
    let workspace = temp_dir("sims-backup-junk-dst");
    let current = write_sample_db(&workspace.join("sims.sqlite3"), "current");

    let junk = out_dir.join("notes.txt");
    std::fs::write(&junk, b"name,email\nfaisal,faisal@example.org\n").expect("write junk");

    let e = import(&junk, &workspace).expect_err("text file is not a database");
    assert!(e.to_string().contains("does not contain an sqlite database"), "{e}");
    let kept = std::fs::read(workspace.join("sims.sqlite3")).expect("read kept db");
    assert_eq!(kept, current);
    assert!(!workspace.join("sims.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn corrupt_sqlite_fails_integrity_check_and_workspace_kept() {
    let out_dir = temp_dir("sims-backup-corrupt");
    let workspace = temp_dir("sims-backup-corrupt-dst");
    let current = write_sample_db(&workspace.join("sims.sqlite3"), "current");

    let damaged = out_dir.join("damaged.sqlite3");
    let mut bytes = write_sample_db(&damaged, "damaged");
    assert!(bytes.len() > 4096 + 512, "sample db spans several pages");
    for b in &mut bytes[4096..4096 + 512] {
        *b = 0xFF;
    }
    std::fs::write(&damaged, &bytes).expect("write damaged db");

    let verified = backup::read_backup(&damaged).expect("header still looks like sqlite");
    let staged = backup::stage_backup(verified, &workspace).expect("stage damaged db");
    staged
        .check_integrity()
        .expect_err("damaged pages fail the integrity check");
    assert!(!workspace.join("sims.sqlite3.importing").exists());
    let kept = std::fs::read(workspace.join("sims.sqlite3")).expect("read kept db");
    assert_eq!(kept, current);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}
