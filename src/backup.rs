use anyhow::{anyhow, Context};
use rusqlite::{Connection, OpenFlags};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const DB_FILE: &str = "sims.sqlite3";
const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/sims.sqlite3";
const META_WORKSPACE_ENTRY: &str = "meta/workspace.json";
pub const BUNDLE_FORMAT: &str = "sims-workspace-v1";
pub const LEGACY_FORMAT: &str = "legacy-sqlite3";
const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn write_json_entry(
    zip: &mut ZipWriter<File>,
    name: &str,
    value: &serde_json::Value,
    opts: FileOptions,
) -> anyhow::Result<()> {
    zip.start_file(name, opts)
        .with_context(|| format!("failed to start {} entry", name))?;
    zip.write_all(
        serde_json::to_string_pretty(value)
            .with_context(|| format!("failed to serialize {}", name))?
            .as_bytes(),
    )
    .with_context(|| format!("failed to write {} entry", name))?;
    Ok(())
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    if !db_path.is_file() {
        return Err(anyhow!("workspace database not found: {}", db_path.display()));
    }
    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("failed to read database {}", db_path.display()))?;
    let db_sha256 = sha256_hex(&db_bytes);

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "dbSha256": db_sha256,
    });
    write_json_entry(&mut zip, MANIFEST_ENTRY, &manifest, opts)?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;

    let workspace_meta = json!({
        "sourceWorkspace": workspace_path.to_string_lossy(),
    });
    write_json_entry(&mut zip, META_WORKSPACE_ENTRY, &workspace_meta, opts)?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        entry_count: 3,
        db_sha256,
    })
}

/// A backup whose database bytes passed the format and checksum checks.
#[derive(Debug)]
pub struct VerifiedBackup {
    db_bytes: Vec<u8>,
    format: &'static str,
}

/// Reads `in_path` as a zip bundle or a raw sqlite file and checks it without
/// touching any workspace.
pub fn read_backup(in_path: &Path) -> anyhow::Result<VerifiedBackup> {
    let (db_bytes, format) = if is_zip_file(in_path)? {
        (read_bundle_db(in_path)?, BUNDLE_FORMAT)
    } else {
        let bytes = std::fs::read(in_path)
            .with_context(|| format!("failed to read legacy backup {}", in_path.display()))?;
        (bytes, LEGACY_FORMAT)
    };
    if !db_bytes.starts_with(SQLITE_HEADER) {
        return Err(anyhow!(
            "{} does not contain an sqlite database",
            in_path.display()
        ));
    }
    Ok(VerifiedBackup { db_bytes, format })
}

/// A verified backup written beside the workspace database, not yet in place.
#[derive(Debug)]
pub struct StagedBackup {
    tmp_path: PathBuf,
    dst_path: PathBuf,
    format: &'static str,
}

/// Writes the backup to `sims.sqlite3.importing` in the workspace. The
/// current database is not touched.
pub fn stage_backup(
    backup: VerifiedBackup,
    workspace_path: &Path,
) -> anyhow::Result<StagedBackup> {
    std::fs::create_dir_all(workspace_path)
        .with_context(|| format!("failed to create workspace {}", workspace_path.display()))?;

    let dst_path = workspace_path.join(DB_FILE);
    let tmp_path = workspace_path.join(format!("{}.importing", DB_FILE));
    if tmp_path.exists() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    let mut out = File::create(&tmp_path)
        .with_context(|| format!("failed to create temp database {}", tmp_path.display()))?;
    out.write_all(&backup.db_bytes)
        .context("failed to write extracted database")?;
    out.flush().context("failed to flush extracted database")?;

    Ok(StagedBackup {
        tmp_path,
        dst_path,
        format: backup.format,
    })
}

impl StagedBackup {
    /// Runs `PRAGMA integrity_check` on the staged file. A failing file is
    /// removed.
    pub fn check_integrity(&self) -> anyhow::Result<()> {
        let verdict = integrity_verdict(&self.tmp_path);
        match verdict {
            Ok(v) if v == "ok" => Ok(()),
            Ok(v) => {
                let _ = std::fs::remove_file(&self.tmp_path);
                Err(anyhow!("imported database failed integrity check: {}", v))
            }
            Err(e) => {
                let _ = std::fs::remove_file(&self.tmp_path);
                Err(e)
            }
        }
    }

    /// Renames the staged file over the workspace database.
    pub fn commit(self) -> anyhow::Result<ImportSummary> {
        std::fs::rename(&self.tmp_path, &self.dst_path).with_context(|| {
            format!(
                "failed to move extracted database to {}",
                self.dst_path.display()
            )
        })?;
        Ok(ImportSummary {
            bundle_format_detected: self.format.to_string(),
        })
    }
}

fn integrity_verdict(db_path: &Path) -> anyhow::Result<String> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_WRITE)
        .with_context(|| format!("failed to open imported database {}", db_path.display()))?;
    conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))
        .context("imported database failed integrity check")
}

fn read_bundle_db(in_path: &Path) -> anyhow::Result<Vec<u8>> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .context("bundle missing db/sims.sqlite3")?
        .read_to_end(&mut db_bytes)
        .context("failed to extract database entry")?;

    let expected = manifest
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .context("manifest.json missing dbSha256")?;
    let actual = sha256_hex(&db_bytes);
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(anyhow!(
            "database checksum mismatch: manifest {}, bundle {}",
            expected,
            actual
        ));
    }
    Ok(db_bytes)
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.display()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    if read < 4 {
        return Ok(false);
    }
    Ok(sig == [0x50, 0x4B, 0x03, 0x04])
}
