//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the settings
//! table (which also backs draft storage), and the shared connection state
//! used by the SQLite store adapter.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

/// Shared database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, String> {
        self.conn.lock().map_err(|e| format!("db lock poisoned: {e}"))
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/closing.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("closing.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a migrated in-memory database. Nothing is written to disk.
pub fn open_in_memory() -> Result<DbState, String> {
    let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: catalogs, closings and their child rows.
///
/// Money and liter columns are TEXT holding exact decimal strings.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS fuels (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL,
            unit_price TEXT NOT NULL DEFAULT '0'
        );

        CREATE TABLE IF NOT EXISTS nozzles (
            id INTEGER PRIMARY KEY,
            number INTEGER NOT NULL,
            location_id INTEGER NOT NULL,
            fuel_id INTEGER NOT NULL REFERENCES fuels(id),
            active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS payment_methods (
            id INTEGER PRIMARY KEY,
            location_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'other',
            fee_percent TEXT NOT NULL DEFAULT '0',
            active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS attendants (
            id INTEGER PRIMARY KEY,
            location_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS closings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            shift_id INTEGER NOT NULL,
            location_id INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'RASCUNHO'
                CHECK (status IN ('RASCUNHO', 'FECHADO')),
            total_sales TEXT NOT NULL DEFAULT '0',
            total_collected TEXT NOT NULL DEFAULT '0',
            difference TEXT NOT NULL DEFAULT '0',
            observations TEXT,
            created_by TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (date, shift_id, location_id)
        );

        CREATE TABLE IF NOT EXISTS nozzle_readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            nozzle_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            shift_id INTEGER,
            location_id INTEGER NOT NULL,
            initial_reading TEXT NOT NULL,
            final_reading TEXT NOT NULL,
            fuel_id INTEGER NOT NULL,
            unit_price TEXT NOT NULL,
            actor_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_readings_key
            ON nozzle_readings (date, shift_id, location_id);
        CREATE INDEX IF NOT EXISTS idx_readings_nozzle
            ON nozzle_readings (nozzle_id, location_id, date);

        CREATE TABLE IF NOT EXISTS attendant_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            closing_id INTEGER NOT NULL REFERENCES closings(id) ON DELETE CASCADE,
            location_id INTEGER NOT NULL,
            attendant_id INTEGER NOT NULL,
            cash TEXT NOT NULL DEFAULT '0',
            instant_transfer TEXT NOT NULL DEFAULT '0',
            debit_card TEXT NOT NULL DEFAULT '0',
            credit_card TEXT NOT NULL DEFAULT '0',
            credit_note TEXT NOT NULL DEFAULT '0',
            voucher TEXT NOT NULL DEFAULT '0',
            card_total TEXT NOT NULL DEFAULT '0',
            metered_amount TEXT NOT NULL DEFAULT '0',
            difference TEXT NOT NULL DEFAULT '0',
            verified_amount TEXT NOT NULL DEFAULT '0',
            products_amount TEXT NOT NULL DEFAULT '0',
            observations TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_closing ON attendant_sessions (closing_id);

        CREATE TABLE IF NOT EXISTS receipts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            closing_id INTEGER NOT NULL REFERENCES closings(id) ON DELETE CASCADE,
            payment_method_id INTEGER NOT NULL,
            amount TEXT NOT NULL,
            observations TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_receipts_closing ON receipts (closing_id);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| format!("migration v1: {e}"))?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: per-installation settings. Also backs the draft scratch
/// store (category `draft`).
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (setting_category, setting_key)
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| format!("migration v2: {e}"))?;

    info!("Applied migration v2");
    Ok(())
}

/// Migration v3: optimistic-concurrency version on closings.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    if !column_exists(conn, "closings", "version")? {
        conn.execute_batch("ALTER TABLE closings ADD COLUMN version INTEGER NOT NULL DEFAULT 1;")
            .map_err(|e| format!("migration v3 add version: {e}"))?;
    }

    conn.execute_batch("INSERT INTO schema_version (version) VALUES (3);")
        .map_err(|e| format!("migration v3: {e}"))?;

    info!("Applied migration v3");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| format!("table_info {table}: {e}"))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| format!("table_info query: {e}"))?;
    while let Some(row) = rows.next().map_err(|e| format!("table_info next: {e}"))? {
        let name: String = row.get(1).map_err(|e| format!("table_info name: {e}"))?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value. `Ok(None)` when the key is not set.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Result<Option<String>, String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| format!("get_setting: {e}"))
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Delete a single setting. Missing keys are not an error.
pub fn delete_setting(conn: &Connection, category: &str, key: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
    )
    .map_err(|e| format!("delete_setting: {e}"))?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query table list")
            .filter_map(Result::ok)
            .collect()
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let conn = test_db();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for expected in [
            "attendant_sessions",
            "attendants",
            "closings",
            "fuels",
            "local_settings",
            "nozzle_readings",
            "nozzles",
            "payment_methods",
            "receipts",
            "schema_version",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
        assert!(column_exists(&conn, "closings", "version").unwrap());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run should succeed");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_closing_key_is_unique() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO closings (date, shift_id, location_id) VALUES ('2025-01-10', 1, 1)",
            [],
        )
        .expect("first insert");
        let dup = conn.execute(
            "INSERT INTO closings (date, shift_id, location_id) VALUES ('2025-01-10', 1, 1)",
            [],
        );
        assert!(dup.is_err(), "duplicate closing key should be rejected");
    }

    #[test]
    fn test_sessions_cascade_with_closing() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO closings (id, date, shift_id, location_id) VALUES (5, '2025-01-10', 1, 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO attendant_sessions (closing_id, location_id, attendant_id) VALUES (5, 1, 3)",
            [],
        )
        .unwrap();
        conn.execute("DELETE FROM closings WHERE id = 5", []).unwrap();

        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM attendant_sessions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("test_wal.db");

        let conn = open_and_configure(&db_path).expect("open temp db");
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("read journal_mode");
        assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");
    }

    #[test]
    fn test_init_creates_database_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = init(&dir.path().join("nested")).expect("init");
        assert!(state.db_path.exists());
        assert!(state.db_path.ends_with("closing.db"));
    }

    #[test]
    fn test_settings_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        set_setting(&conn, "closing", "high_volume_threshold_liters", "3000").expect("set");
        assert_eq!(
            get_setting(&conn, "closing", "high_volume_threshold_liters").unwrap(),
            Some("3000".to_string())
        );

        set_setting(&conn, "closing", "high_volume_threshold_liters", "4500").expect("update");
        assert_eq!(
            get_setting(&conn, "closing", "high_volume_threshold_liters").unwrap(),
            Some("4500".to_string())
        );

        delete_setting(&conn, "closing", "high_volume_threshold_liters").expect("delete");
        assert!(get_setting(&conn, "closing", "high_volume_threshold_liters")
            .unwrap()
            .is_none());

        delete_setting(&conn, "closing", "never_set").expect("missing key is fine");
    }

    #[test]
    fn test_get_setting_reports_query_errors() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");
        conn.execute_batch("DROP TABLE local_settings").unwrap();

        let err = get_setting(&conn, "draft", "closing_draft_v1_1").unwrap_err();
        assert!(err.contains("local_settings"), "unexpected error: {err}");
    }
}
