//! Session and user-prompt persistence.
//!
//! [`create_or_get_session`] is idempotent on `content_session_id`; sessions
//! are never destroyed. `memory_session_id` is assigned once by the agent's
//! first turn and never overwritten afterwards.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::memory::now_epoch_ms;
use crate::memory::types::{Platform, SessionRecord, UserPromptRecord};

/// Create a session row if none exists for this `content_session_id`, else
/// return the existing one untouched (apart from `updated_at_epoch`).
pub fn create_or_get_session(
    conn: &Connection,
    content_session_id: &str,
    project: &str,
    initial_prompt: Option<&str>,
    platform: Platform,
) -> Result<SessionRecord> {
    let now = now_epoch_ms();

    conn.execute(
        "INSERT INTO sessions
            (content_session_id, platform, project, initial_prompt, created_at_epoch, updated_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(content_session_id) DO UPDATE SET updated_at_epoch = ?5",
        params![content_session_id, platform.as_str(), project, initial_prompt, now],
    )?;

    get_session_by_content_id(conn, content_session_id)?
        .ok_or_else(|| anyhow::anyhow!("session vanished after upsert: {content_session_id}"))
}

/// Fetch a session by its upstream id.
pub fn get_session_by_content_id(
    conn: &Connection,
    content_session_id: &str,
) -> Result<Option<SessionRecord>> {
    let row = conn
        .query_row(
            "SELECT id, content_session_id, platform, project, initial_prompt,
                    memory_session_id, created_at_epoch, updated_at_epoch
             FROM sessions WHERE content_session_id = ?1",
            params![content_session_id],
            map_session_row,
        )
        .optional()?;
    Ok(row)
}

/// Fetch a session by database id.
pub fn get_session(conn: &Connection, session_id: i64) -> Result<Option<SessionRecord>> {
    let row = conn
        .query_row(
            "SELECT id, content_session_id, platform, project, initial_prompt,
                    memory_session_id, created_at_epoch, updated_at_epoch
             FROM sessions WHERE id = ?1",
            params![session_id],
            map_session_row,
        )
        .optional()?;
    Ok(row)
}

/// Assign the memory-session id if the session does not have one yet.
/// Returns the id that is in effect after the call (existing one wins).
pub fn assign_memory_session_id(
    conn: &Connection,
    session_id: i64,
    memory_session_id: &str,
) -> Result<String> {
    conn.execute(
        "UPDATE sessions SET memory_session_id = ?2, updated_at_epoch = ?3
         WHERE id = ?1 AND memory_session_id IS NULL",
        params![session_id, memory_session_id, now_epoch_ms()],
    )?;

    let effective: String = conn.query_row(
        "SELECT memory_session_id FROM sessions WHERE id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;
    Ok(effective)
}

/// Result of appending a prompt: its per-session number and its row id
/// (the vector-index key).
#[derive(Debug, Clone, Copy)]
pub struct AppendedPrompt {
    pub prompt_number: i64,
    pub row_id: i64,
}

/// Append a user prompt. Prompt numbers are monotonic per session,
/// starting at 1.
pub fn append_user_prompt(
    conn: &Connection,
    content_session_id: &str,
    prompt_text: &str,
) -> Result<AppendedPrompt> {
    // Base row and FTS row commit together
    let tx = conn.unchecked_transaction()?;

    let next: i64 = tx.query_row(
        "SELECT COALESCE(MAX(prompt_number), 0) + 1 FROM user_prompts
         WHERE content_session_id = ?1",
        params![content_session_id],
        |row| row.get(0),
    )?;

    tx.execute(
        "INSERT INTO user_prompts (content_session_id, prompt_number, prompt_text, created_at_epoch)
         VALUES (?1, ?2, ?3, ?4)",
        params![content_session_id, next, prompt_text, now_epoch_ms()],
    )?;
    let rowid = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO user_prompts_fts (rowid, prompt_text) VALUES (?1, ?2)",
        params![rowid, prompt_text],
    )?;

    tx.commit()?;
    Ok(AppendedPrompt {
        prompt_number: next,
        row_id: rowid,
    })
}

/// Page through prompts, newest first.
pub fn get_prompts_page(
    conn: &Connection,
    project: Option<&str>,
    offset: i64,
    limit: i64,
) -> Result<Vec<UserPromptRecord>> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.content_session_id, p.prompt_number, p.prompt_text, p.created_at_epoch
         FROM user_prompts p
         JOIN sessions s ON s.content_session_id = p.content_session_id
         WHERE (?1 IS NULL OR s.project = ?1)
         ORDER BY p.created_at_epoch DESC, p.id DESC
         LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt
        .query_map(params![project, limit, offset], |row| {
            Ok(UserPromptRecord {
                id: row.get(0)?,
                content_session_id: row.get(1)?,
                prompt_number: row.get(2)?,
                prompt_text: row.get(3)?,
                created_at_epoch: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Distinct project names with observation counts, most active first.
pub fn list_projects(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT s.project, COUNT(o.id) AS n
         FROM sessions s
         LEFT JOIN observations o ON o.session_id = s.id
         GROUP BY s.project
         ORDER BY n DESC, s.project ASC",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn map_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let platform: String = row.get(2)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        content_session_id: row.get(1)?,
        platform: platform.parse().unwrap_or(Platform::HostedAgent),
        project: row.get(3)?,
        initial_prompt: row.get(4)?,
        memory_session_id: row.get(5)?,
        created_at_epoch: row.get(6)?,
        updated_at_epoch: row.get(7)?,
    })
}
