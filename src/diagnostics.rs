//! Diagnostics and log housekeeping.
//!
//! - **About info**: version and platform.
//! - **Store health**: schema version, closing counts, draft count, db size.
//! - **Log rotation helpers**: used by `lib.rs` and the CLI to place and prune
//!   the rolling log files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::{json, Value};
use tracing::warn;

use crate::db::DbState;

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "closing";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

pub fn get_about_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Store health
// ---------------------------------------------------------------------------

/// Snapshot of the local database for support screens and the CLI.
pub fn get_store_health(db: &DbState) -> Result<Value, String> {
    let conn = db.lock()?;

    let schema_version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    let count = |sql: &str| -> i64 { conn.query_row(sql, [], |row| row.get(0)).unwrap_or(0) };
    let draft_closings = count("SELECT COUNT(*) FROM closings WHERE status = 'RASCUNHO'");
    let closed_closings = count("SELECT COUNT(*) FROM closings WHERE status = 'FECHADO'");
    let readings = count("SELECT COUNT(*) FROM nozzle_readings");
    let drafts = count("SELECT COUNT(*) FROM local_settings WHERE setting_category = 'draft'");

    let last_closed: Option<String> = conn
        .query_row(
            "SELECT date FROM closings WHERE status = 'FECHADO'
             ORDER BY date DESC, id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .ok();

    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "schemaVersion": schema_version,
        "closings": {
            "draft": draft_closings,
            "closed": closed_closings,
            "lastClosedDate": last_closed,
        },
        "readings": readings,
        "pendingDrafts": drafts,
        "dbSizeBytes": db_size,
    }))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Log directory under the data directory.
pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Keep the newest `keep` log files in `log_dir` and delete the rest.
/// Returns how many files were removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?;
            if !path.is_file() || !name.starts_with(&format!("{LOG_FILE_PREFIX}.")) {
                return None;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            Some((path, modified))
        })
        .collect();

    // Newest first; daily file names break ties.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
