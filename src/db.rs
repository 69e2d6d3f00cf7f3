//! Local SQLite ledger for Caja POS.
//!
//! Uses rusqlite with WAL mode. The ledger holds sales, closing records,
//! invoice counters, and inventory side tables; durable writes that must
//! reach the remote backend are staged on `sync_queue`. Provides schema
//! migrations, settings helpers, and managed state for use across Tauri
//! commands.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Tauri managed state holding the ledger connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the ledger at `{app_data_dir}/caja.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(app_data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(app_data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = app_data_dir.join("caja.db");
    info!("Opening ledger at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Ledger open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Ledger open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Ledger initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
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
        info!("Ledger schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating ledger from v{current} to v{CURRENT_SCHEMA_VERSION}");

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

/// Migration v1: core ledger tables (sales, closings, counters, settings, sync).
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- sales (one row per recorded invoice)
        CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            client_id TEXT,
            client_name TEXT NOT NULL DEFAULT 'Cliente General',
            user_id TEXT,
            fecha TEXT NOT NULL,
            subtotal REAL NOT NULL DEFAULT 0,
            descuento REAL NOT NULL DEFAULT 0,
            iva REAL NOT NULL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            margen REAL NOT NULL DEFAULT 0,
            factura TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PAGADA',
            payment_method TEXT NOT NULL DEFAULT 'EFECTIVO',
            amount_paid REAL NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- sales_items (line items per sale)
        CREATE TABLE IF NOT EXISTS sales_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL,
            sale_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            quantity REAL NOT NULL,
            price REAL NOT NULL,
            cost REAL NOT NULL DEFAULT 0,
            subtotal REAL NOT NULL,
            FOREIGN KEY (sale_id) REFERENCES sales(id)
        );

        -- invoice_counters (one row per org/branch, atomically incremented)
        CREATE TABLE IF NOT EXISTS invoice_counters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            last_number INTEGER NOT NULL DEFAULT 0,
            prefix TEXT NOT NULL DEFAULT '',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(org_id, branch_id)
        );

        -- cash_register_closings (immutable audit records)
        CREATE TABLE IF NOT EXISTS cash_register_closings (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            user_name TEXT NOT NULL,
            opening_time TEXT NOT NULL,
            closing_time TEXT NOT NULL,
            opening_amount REAL NOT NULL DEFAULT 0,
            total_entries REAL NOT NULL DEFAULT 0,
            total_exits REAL NOT NULL DEFAULT 0,
            expected_total REAL NOT NULL,
            counted_amount REAL NOT NULL,
            difference REAL NOT NULL,
            sales_count INTEGER NOT NULL DEFAULT 0,
            movements_count INTEGER NOT NULL DEFAULT 0,
            movements TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- sync_queue (append-only staging for the remote backend)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| format!("migration v1: {e}"))?;
    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: inventory side tables written by the sales flow.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- current_stock (per product/branch)
        CREATE TABLE IF NOT EXISTS current_stock (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            name TEXT NOT NULL,
            category TEXT,
            price REAL NOT NULL DEFAULT 0,
            cost REAL NOT NULL DEFAULT 0,
            stock REAL NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(product_id, branch_id)
        );

        -- kardex (inventory movement journal)
        CREATE TABLE IF NOT EXISTS kardex (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            movement_type TEXT NOT NULL,
            reference TEXT,
            quantity REAL NOT NULL,
            cost_unit REAL NOT NULL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            created_by TEXT,
            from_branch TEXT,
            to_branch TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- inventory_movements (stock transfer log)
        CREATE TABLE IF NOT EXISTS inventory_movements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            type TEXT NOT NULL,
            qty REAL NOT NULL,
            from_branch TEXT,
            to_branch TEXT,
            cost REAL NOT NULL DEFAULT 0,
            price REAL NOT NULL DEFAULT 0,
            reference TEXT,
            created_by TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| format!("migration v2: {e}"))?;
    info!("Applied migration v2");
    Ok(())
}

/// Migration v3: indexes for the reconciliation queries (today's sales by
/// org/branch) and sync queue draining.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_sales_org_branch_fecha
            ON sales(org_id, branch_id, fecha);
        CREATE INDEX IF NOT EXISTS idx_sales_items_sale
            ON sales_items(sale_id);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status
            ON sync_queue(status, created_at);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| format!("migration v3: {e}"))?;
    info!("Applied migration v3");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
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

/// Delete a single setting. Succeeds silently when absent.
pub fn delete_setting(conn: &Connection, category: &str, key: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
    )
    .map_err(|e| format!("delete_setting: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync staging
// ---------------------------------------------------------------------------

/// Stage a durable write for the remote backend.
pub fn enqueue_sync(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    operation: &str,
    payload: &serde_json::Value,
) -> Result<(), String> {
    let idempotency_key = format!(
        "{entity_type}:{operation}:{entity_id}:{}",
        chrono::Utc::now().timestamp_millis()
    );
    conn.execute(
        "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entity_type,
            entity_id,
            operation,
            payload.to_string(),
            idempotency_key
        ],
    )
    .map_err(|e| format!("enqueue {entity_type} sync: {e}"))?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        run_migrations_for_test(&conn);
        conn
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = test_conn();
        run_migrations(&conn).expect("second run is a no-op");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .expect("schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn settings_roundtrip_and_delete() {
        let conn = test_conn();

        assert_eq!(get_setting(&conn, "auth", "operator_email"), None);
        set_setting(&conn, "auth", "operator_email", "caja@example.com").expect("set");
        assert_eq!(
            get_setting(&conn, "auth", "operator_email").as_deref(),
            Some("caja@example.com")
        );

        // Upsert replaces, not duplicates
        set_setting(&conn, "auth", "operator_email", "otra@example.com").expect("overwrite");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM local_settings WHERE setting_category = 'auth'",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(count, 1);

        delete_setting(&conn, "auth", "operator_email").expect("delete");
        assert_eq!(get_setting(&conn, "auth", "operator_email"), None);
    }

    #[test]
    fn enqueue_sync_stages_pending_entry() {
        let conn = test_conn();
        enqueue_sync(
            &conn,
            "sale",
            "sale-1",
            "insert",
            &serde_json::json!({ "total": 100.0 }),
        )
        .expect("enqueue");

        let (status, entity): (String, String) = conn
            .query_row(
                "SELECT status, entity_type FROM sync_queue WHERE entity_id = 'sale-1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("row");
        assert_eq!(status, "pending");
        assert_eq!(entity, "sale");
    }
}
