pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the mnemo database at the given path, with extensions
/// loaded and schema initialized.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path).with_context(|| {
        format!(
            "failed to open database at {}. If the file is corrupt, \
             restore from a backup or delete it to start fresh.",
            path.display()
        )
    })?;

    // WAL for concurrent readers; busy_timeout instead of immediate lock failures
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;

    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;

    let integrity: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
    if integrity != "ok" {
        anyhow::bail!("database integrity check failed: {integrity}");
    }

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Open an in-memory database with the full schema — used by tests and
/// as a last-resort fallback when the data directory is unwritable.
pub fn open_in_memory() -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn)?;
    migrations::run_migrations(&conn)?;
    Ok(conn)
}

/// Resolve the database file inside a data directory, accepting the legacy
/// file name on read. A fresh directory always gets the canonical name.
pub fn database_path(data_dir: &Path) -> std::path::PathBuf {
    let canonical = data_dir.join("mnemo.db");
    if canonical.exists() {
        return canonical;
    }
    let legacy = data_dir.join("codex-mem.db");
    if legacy.exists() {
        tracing::warn!(path = %legacy.display(), "using legacy database file name");
        return legacy;
    }
    canonical
}
