//! Full-text search over observations, summaries, and user prompts.
//!
//! FTS5 BM25 drives all three; filters are applied in SQL against the base
//! tables. Each search returns scored rows plus a `has_more` flag (the query
//! fetches `limit + 1` rows and trims).

use anyhow::Result;
use rusqlite::{params, Connection};

use crate::memory::escape_fts_query;
use crate::memory::observations::{map_observation_row, map_summary_row, ObservationFilter};
use crate::memory::types::{ObservationRecord, SummaryRecord, UserPromptRecord};

/// A scored full-text hit.
#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub record: T,
    /// Negated BM25 rank; higher is better.
    pub score: f64,
}

/// A page of scored results.
#[derive(Debug)]
pub struct SearchPage<T> {
    pub results: Vec<Scored<T>>,
    pub has_more: bool,
}

impl<T> SearchPage<T> {
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            has_more: false,
        }
    }
}

/// Full-text search over observations with the standard filter set.
pub fn search_observations(
    conn: &Connection,
    query: &str,
    filter: &ObservationFilter,
    offset: i64,
    limit: i64,
) -> Result<SearchPage<ObservationRecord>> {
    let escaped = escape_fts_query(query);
    if escaped.is_empty() {
        return Ok(SearchPage::empty());
    }

    let mut stmt = conn.prepare(
        "SELECT o.id, o.session_id, o.memory_session_id, o.project, o.type, o.title,
                o.subtitle, o.narrative, o.facts, o.concepts, o.files_read, o.files_modified,
                o.tokens_used, o.cwd, o.created_at_epoch, observations_fts.rank
         FROM observations_fts
         JOIN observations o ON o.id = observations_fts.rowid
         WHERE observations_fts MATCH ?1
           AND (?2 IS NULL OR o.project = ?2)
           AND (?3 IS NULL OR o.type = ?3)
           AND (?4 IS NULL OR o.concepts LIKE '%' || ?4 || '%')
           AND (?5 IS NULL OR o.files_read LIKE '%' || ?5 || '%' OR o.files_modified LIKE '%' || ?5 || '%')
           AND (?6 IS NULL OR o.created_at_epoch >= ?6)
           AND (?7 IS NULL OR o.created_at_epoch <= ?7)
         ORDER BY observations_fts.rank
         LIMIT ?8 OFFSET ?9",
    )?;

    let rows = stmt
        .query_map(
            params![
                escaped,
                filter.project,
                filter.observation_type.map(|t| t.as_str()),
                filter.concept,
                filter.file_path,
                filter.date_start_epoch,
                filter.date_end_epoch,
                limit + 1,
                offset,
            ],
            |row| {
                let record = map_observation_row(row)?;
                let rank: f64 = row.get(15)?;
                Ok(Scored {
                    record,
                    score: -rank,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(trim_page(rows, limit as usize))
}

/// Full-text search over summaries.
pub fn search_summaries(
    conn: &Connection,
    query: &str,
    project: Option<&str>,
    offset: i64,
    limit: i64,
) -> Result<SearchPage<SummaryRecord>> {
    let escaped = escape_fts_query(query);
    if escaped.is_empty() {
        return Ok(SearchPage::empty());
    }

    let mut stmt = conn.prepare(
        "SELECT s.id, s.session_id, s.memory_session_id, s.project, s.request, s.investigated,
                s.learned, s.completed, s.next_steps, s.notes, s.created_at_epoch,
                summaries_fts.rank
         FROM summaries_fts
         JOIN summaries s ON s.id = summaries_fts.rowid
         WHERE summaries_fts MATCH ?1
           AND (?2 IS NULL OR s.project = ?2)
         ORDER BY summaries_fts.rank
         LIMIT ?3 OFFSET ?4",
    )?;

    let rows = stmt
        .query_map(params![escaped, project, limit + 1, offset], |row| {
            let record = map_summary_row(row)?;
            let rank: f64 = row.get(11)?;
            Ok(Scored {
                record,
                score: -rank,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(trim_page(rows, limit as usize))
}

/// Full-text search over user prompts — the relational fallback behind
/// vector prompt search.
pub fn search_user_prompts(
    conn: &Connection,
    query: &str,
    project: Option<&str>,
    offset: i64,
    limit: i64,
) -> Result<SearchPage<UserPromptRecord>> {
    let escaped = escape_fts_query(query);
    if escaped.is_empty() {
        return Ok(SearchPage::empty());
    }

    let mut stmt = conn.prepare(
        "SELECT p.id, p.content_session_id, p.prompt_number, p.prompt_text, p.created_at_epoch,
                user_prompts_fts.rank
         FROM user_prompts_fts
         JOIN user_prompts p ON p.id = user_prompts_fts.rowid
         JOIN sessions s ON s.content_session_id = p.content_session_id
         WHERE user_prompts_fts MATCH ?1
           AND (?2 IS NULL OR s.project = ?2)
         ORDER BY user_prompts_fts.rank
         LIMIT ?3 OFFSET ?4",
    )?;

    let rows = stmt
        .query_map(params![escaped, project, limit + 1, offset], |row| {
            let record = UserPromptRecord {
                id: row.get(0)?,
                content_session_id: row.get(1)?,
                prompt_number: row.get(2)?,
                prompt_text: row.get(3)?,
                created_at_epoch: row.get(4)?,
            };
            let rank: f64 = row.get(5)?;
            Ok(Scored {
                record,
                score: -rank,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(trim_page(rows, limit as usize))
}

fn trim_page<T>(mut rows: Vec<Scored<T>>, limit: usize) -> SearchPage<T> {
    let has_more = rows.len() > limit;
    rows.truncate(limit);
    SearchPage {
        results: rows,
        has_more,
    }
}
