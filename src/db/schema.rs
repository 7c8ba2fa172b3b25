//! SQL DDL for all mnemo tables.
//!
//! Defines `sessions`, `user_prompts`, `pending_messages`, `observations`,
//! `summaries`, the FTS5 index tables, the `memory_vec` (vec0) table, and
//! `schema_meta`. All DDL uses `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

/// All schema DDL statements for mnemo's core tables.
const SCHEMA_SQL: &str = r#"
-- One row per upstream coding session
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_session_id TEXT NOT NULL UNIQUE,
    platform TEXT NOT NULL DEFAULT 'hosted-agent'
        CHECK(platform IN ('hosted-agent','transcript','cursor')),
    project TEXT NOT NULL,
    initial_prompt TEXT,
    memory_session_id TEXT,
    created_at_epoch INTEGER NOT NULL,
    updated_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project);
CREATE INDEX IF NOT EXISTS idx_sessions_memory_session ON sessions(memory_session_id);

-- User prompts, numbered per session
CREATE TABLE IF NOT EXISTS user_prompts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_session_id TEXT NOT NULL,
    prompt_number INTEGER NOT NULL,
    prompt_text TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL,
    UNIQUE(content_session_id, prompt_number)
);

CREATE INDEX IF NOT EXISTS idx_prompts_session ON user_prompts(content_session_id);

-- Work queue; rows are claim-and-deleted by agent tasks
CREATE TABLE IF NOT EXISTS pending_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    content_session_id TEXT NOT NULL,
    message_type TEXT NOT NULL CHECK(message_type IN ('observation','summarize')),
    payload TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_session ON pending_messages(session_id);

-- Distilled tool-use observations
CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    memory_session_id TEXT NOT NULL,
    project TEXT NOT NULL,
    type TEXT NOT NULL
        CHECK(type IN ('discovery','bugfix','feature','refactor','decision','change')),
    title TEXT NOT NULL,
    subtitle TEXT NOT NULL DEFAULT '',
    narrative TEXT NOT NULL DEFAULT '',
    facts TEXT NOT NULL DEFAULT '[]',
    concepts TEXT NOT NULL DEFAULT '[]',
    files_read TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]',
    tokens_used INTEGER NOT NULL DEFAULT 0,
    cwd TEXT,
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_observations_project ON observations(project);
CREATE INDEX IF NOT EXISTS idx_observations_type ON observations(type);
CREATE INDEX IF NOT EXISTS idx_observations_created ON observations(created_at_epoch);
CREATE INDEX IF NOT EXISTS idx_observations_session ON observations(session_id);

-- End-of-turn summaries; one row per session, replaced on each summarize
CREATE TABLE IF NOT EXISTS summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL UNIQUE REFERENCES sessions(id),
    memory_session_id TEXT NOT NULL,
    project TEXT NOT NULL,
    request TEXT NOT NULL DEFAULT '',
    investigated TEXT NOT NULL DEFAULT '',
    learned TEXT NOT NULL DEFAULT '',
    completed TEXT NOT NULL DEFAULT '',
    next_steps TEXT NOT NULL DEFAULT '',
    notes TEXT NOT NULL DEFAULT '',
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_summaries_project ON summaries(project);
CREATE INDEX IF NOT EXISTS idx_summaries_created ON summaries(created_at_epoch);

-- Full-text search (BM25), kept in sync transactionally with base rows
CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    title,
    subtitle,
    narrative,
    facts,
    concepts,
    content='observations',
    content_rowid='id'
);

CREATE VIRTUAL TABLE IF NOT EXISTS summaries_fts USING fts5(
    request,
    investigated,
    learned,
    completed,
    next_steps,
    notes,
    content='summaries',
    content_rowid='id'
);

CREATE VIRTUAL TABLE IF NOT EXISTS user_prompts_fts USING fts5(
    prompt_text,
    content='user_prompts',
    content_rowid='id'
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
/// Keys are `"<kind>:<row id>"`, kind one of observation/summary/prompt.
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memory_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[768]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"sessions".to_string()));
        assert!(tables.contains(&"user_prompts".to_string()));
        assert!(tables.contains(&"pending_messages".to_string()));
        assert!(tables.contains(&"observations".to_string()));
        assert!(tables.contains(&"summaries".to_string()));
        assert!(tables.contains(&"schema_meta".to_string()));

        // Virtual tables are live
        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap(); // second call should not error
    }

    #[test]
    fn platform_check_constraint_rejects_unknown() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let err = conn.execute(
            "INSERT INTO sessions (content_session_id, platform, project, created_at_epoch, updated_at_epoch)
             VALUES ('s1', 'mainframe', 'p', 0, 0)",
            [],
        );
        assert!(err.is_err());
    }
}
