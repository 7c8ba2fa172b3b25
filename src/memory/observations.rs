//! Observation and summary write path plus batched/paged reads.
//!
//! [`store_observations`] is the single write entry point for agent output.
//! It runs inside one transaction: observation rows, their FTS5 rows, and
//! the optional summary upsert either all land or none do. Readers never see
//! a partial batch.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::memory::types::{
    ObservationDraft, ObservationRecord, ObservationType, SummaryDraft, SummaryRecord,
};
use crate::memory::{from_json_column, now_epoch_ms, to_json_column};

/// Result of one atomic store call.
#[derive(Debug)]
pub struct StoreResult {
    pub observation_ids: Vec<i64>,
    pub summary_id: Option<i64>,
    /// The epoch applied to every stored record — the original event time,
    /// not the time the agent finished processing.
    pub created_at_epoch: i64,
}

/// Ordering for paged observation reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    NewestFirst,
    OldestFirst,
}

impl OrderBy {
    fn sql(&self) -> &'static str {
        match self {
            Self::NewestFirst => "DESC",
            Self::OldestFirst => "ASC",
        }
    }
}

/// Filter applied to paged and full-text observation reads.
#[derive(Debug, Clone, Default)]
pub struct ObservationFilter {
    pub project: Option<String>,
    pub observation_type: Option<ObservationType>,
    pub concept: Option<String>,
    pub file_path: Option<String>,
    pub date_start_epoch: Option<i64>,
    pub date_end_epoch: Option<i64>,
}

/// Store a batch of observations and an optional summary atomically.
///
/// `event_epoch` carries the enqueue time of the oldest queue message that
/// contributed to this batch; it becomes `created_at_epoch` on every record
/// so global chronology survives processing delay.
pub fn store_observations(
    conn: &mut Connection,
    session_id: i64,
    memory_session_id: &str,
    project: &str,
    drafts: &[ObservationDraft],
    summary: Option<&SummaryDraft>,
    event_epoch: Option<i64>,
) -> Result<StoreResult> {
    let epoch = event_epoch.unwrap_or_else(now_epoch_ms);
    let tx = conn.transaction()?;

    let mut observation_ids = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let ty = draft.observation_type.unwrap_or(ObservationType::Discovery);
        tx.execute(
            "INSERT INTO observations
                (session_id, memory_session_id, project, type, title, subtitle, narrative,
                 facts, concepts, files_read, files_modified, tokens_used, cwd, created_at_epoch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                session_id,
                memory_session_id,
                project,
                ty.as_str(),
                draft.title,
                draft.subtitle,
                draft.narrative,
                to_json_column(&draft.facts),
                to_json_column(&draft.concepts),
                to_json_column(&draft.files_read),
                to_json_column(&draft.files_modified),
                draft.tokens_used,
                draft.cwd,
                epoch,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO observations_fts (rowid, title, subtitle, narrative, facts, concepts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                draft.title,
                draft.subtitle,
                draft.narrative,
                draft.facts.join(" "),
                draft.concepts.join(" "),
            ],
        )?;
        observation_ids.push(id);
    }

    let summary_id = if let Some(s) = summary {
        Some(upsert_summary(&tx, session_id, memory_session_id, project, s, epoch)?)
    } else {
        None
    };

    tx.commit()?;

    Ok(StoreResult {
        observation_ids,
        summary_id,
        created_at_epoch: epoch,
    })
}

/// Replace (or insert) the per-session summary. Runs inside the caller's
/// transaction so it commits with the observation batch.
fn upsert_summary(
    tx: &rusqlite::Transaction<'_>,
    session_id: i64,
    memory_session_id: &str,
    project: &str,
    draft: &SummaryDraft,
    epoch: i64,
) -> Result<i64> {
    // Drop the old FTS row before replacing the base row
    let old: Option<i64> = tx
        .query_row(
            "SELECT id FROM summaries WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(old_id) = old {
        tx.execute("DELETE FROM summaries_fts WHERE rowid = ?1", params![old_id])?;
        tx.execute("DELETE FROM summaries WHERE id = ?1", params![old_id])?;
    }

    tx.execute(
        "INSERT INTO summaries
            (session_id, memory_session_id, project, request, investigated, learned,
             completed, next_steps, notes, created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            session_id,
            memory_session_id,
            project,
            draft.request,
            draft.investigated,
            draft.learned,
            draft.completed,
            draft.next_steps,
            draft.notes,
            epoch,
        ],
    )?;
    let id = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO summaries_fts (rowid, request, investigated, learned, completed, next_steps, notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            draft.request,
            draft.investigated,
            draft.learned,
            draft.completed,
            draft.next_steps,
            draft.notes,
        ],
    )?;
    Ok(id)
}

/// Batch-fetch observations by id, preserving input order.
pub fn get_observations_by_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<ObservationRecord>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT {COLUMNS} FROM observations WHERE id IN ({})",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let sql_params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

    let mut by_id = std::collections::HashMap::new();
    let rows = stmt
        .query_map(sql_params.as_slice(), map_observation_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for row in rows {
        by_id.insert(row.id, row);
    }

    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

/// Page through observations matching a filter.
pub fn get_observations_page(
    conn: &Connection,
    filter: &ObservationFilter,
    order_by: OrderBy,
    offset: i64,
    limit: i64,
) -> Result<Vec<ObservationRecord>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM observations
         WHERE (?1 IS NULL OR project = ?1)
           AND (?2 IS NULL OR type = ?2)
           AND (?3 IS NULL OR concepts LIKE '%' || ?3 || '%')
           AND (?4 IS NULL OR files_read LIKE '%' || ?4 || '%' OR files_modified LIKE '%' || ?4 || '%')
           AND (?5 IS NULL OR created_at_epoch >= ?5)
           AND (?6 IS NULL OR created_at_epoch <= ?6)
         ORDER BY created_at_epoch {}, id {}
         LIMIT ?7 OFFSET ?8",
        order_by.sql(),
        order_by.sql(),
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![
                filter.project,
                filter.observation_type.map(|t| t.as_str()),
                filter.concept,
                filter.file_path,
                filter.date_start_epoch,
                filter.date_end_epoch,
                limit,
                offset,
            ],
            map_observation_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Latest summary for a project, if any.
pub fn get_latest_summary(conn: &Connection, project: Option<&str>) -> Result<Option<SummaryRecord>> {
    let row = conn
        .query_row(
            "SELECT id, session_id, memory_session_id, project, request, investigated,
                    learned, completed, next_steps, notes, created_at_epoch
             FROM summaries
             WHERE (?1 IS NULL OR project = ?1)
             ORDER BY created_at_epoch DESC, id DESC LIMIT 1",
            params![project],
            map_summary_row,
        )
        .optional()?;
    Ok(row)
}

/// Page through summaries, newest first.
pub fn get_summaries_page(
    conn: &Connection,
    project: Option<&str>,
    offset: i64,
    limit: i64,
) -> Result<Vec<SummaryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, memory_session_id, project, request, investigated,
                learned, completed, next_steps, notes, created_at_epoch
         FROM summaries
         WHERE (?1 IS NULL OR project = ?1)
         ORDER BY created_at_epoch DESC, id DESC
         LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt
        .query_map(params![project, limit, offset], map_summary_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

const COLUMNS: &str = "id, session_id, memory_session_id, project, type, title, subtitle, \
                       narrative, facts, concepts, files_read, files_modified, tokens_used, \
                       cwd, created_at_epoch";

pub(crate) fn map_observation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ObservationRecord> {
    let ty: String = row.get(4)?;
    let facts: String = row.get(8)?;
    let concepts: String = row.get(9)?;
    let files_read: String = row.get(10)?;
    let files_modified: String = row.get(11)?;
    Ok(ObservationRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        memory_session_id: row.get(2)?,
        project: row.get(3)?,
        observation_type: ty.parse().unwrap_or(ObservationType::Discovery),
        title: row.get(5)?,
        subtitle: row.get(6)?,
        narrative: row.get(7)?,
        facts: from_json_column(&facts),
        concepts: from_json_column(&concepts),
        files_read: from_json_column(&files_read),
        files_modified: from_json_column(&files_modified),
        tokens_used: row.get(12)?,
        cwd: row.get(13)?,
        created_at_epoch: row.get(14)?,
    })
}

pub(crate) fn map_summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SummaryRecord> {
    Ok(SummaryRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        memory_session_id: row.get(2)?,
        project: row.get(3)?,
        request: row.get(4)?,
        investigated: row.get(5)?,
        learned: row.get(6)?,
        completed: row.get(7)?,
        next_steps: row.get(8)?,
        notes: row.get(9)?,
        created_at_epoch: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::sessions::create_or_get_session;
    use crate::memory::types::Platform;

    fn test_db() -> Connection {
        crate::db::open_in_memory().unwrap()
    }

    fn draft(title: &str, ty: ObservationType) -> ObservationDraft {
        ObservationDraft {
            observation_type: Some(ty),
            title: title.into(),
            facts: vec!["a fact".into()],
            concepts: vec!["testing".into()],
            ..Default::default()
        }
    }

    #[test]
    fn store_batch_assigns_event_epoch_to_all_rows() {
        let mut conn = test_db();
        let s = create_or_get_session(&conn, "s1", "demo", None, Platform::HostedAgent).unwrap();

        let result = store_observations(
            &mut conn,
            s.id,
            "mem-1",
            "demo",
            &[
                draft("first", ObservationType::Discovery),
                draft("second", ObservationType::Bugfix),
            ],
            None,
            Some(1_700_000_000_000),
        )
        .unwrap();

        assert_eq!(result.observation_ids.len(), 2);
        assert_eq!(result.created_at_epoch, 1_700_000_000_000);

        let rows = get_observations_by_ids(&conn, &result.observation_ids).unwrap();
        assert!(rows.iter().all(|r| r.created_at_epoch == 1_700_000_000_000));
    }

    #[test]
    fn summary_is_replaced_per_session() {
        let mut conn = test_db();
        let s = create_or_get_session(&conn, "s1", "demo", None, Platform::HostedAgent).unwrap();

        let first = SummaryDraft {
            request: "do the thing".into(),
            ..Default::default()
        };
        let second = SummaryDraft {
            request: "do the other thing".into(),
            completed: "done".into(),
            ..Default::default()
        };

        store_observations(&mut conn, s.id, "mem-1", "demo", &[], Some(&first), None).unwrap();
        store_observations(&mut conn, s.id, "mem-1", "demo", &[], Some(&second), None).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM summaries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let latest = get_latest_summary(&conn, Some("demo")).unwrap().unwrap();
        assert_eq!(latest.request, "do the other thing");
        assert_eq!(latest.completed, "done");
    }

    #[test]
    fn get_by_ids_preserves_input_order() {
        let mut conn = test_db();
        let s = create_or_get_session(&conn, "s1", "demo", None, Platform::HostedAgent).unwrap();
        let result = store_observations(
            &mut conn,
            s.id,
            "mem-1",
            "demo",
            &[
                draft("a", ObservationType::Discovery),
                draft("b", ObservationType::Change),
            ],
            None,
            None,
        )
        .unwrap();

        let reversed: Vec<i64> = result.observation_ids.iter().rev().copied().collect();
        let rows = get_observations_by_ids(&conn, &reversed).unwrap();
        assert_eq!(rows[0].title, "b");
        assert_eq!(rows[1].title, "a");
    }

    #[test]
    fn page_filter_by_type_and_project() {
        let mut conn = test_db();
        let s = create_or_get_session(&conn, "s1", "demo", None, Platform::HostedAgent).unwrap();
        store_observations(
            &mut conn,
            s.id,
            "mem-1",
            "demo",
            &[
                draft("bug", ObservationType::Bugfix),
                draft("feat", ObservationType::Feature),
            ],
            None,
            None,
        )
        .unwrap();

        let filter = ObservationFilter {
            project: Some("demo".into()),
            observation_type: Some(ObservationType::Bugfix),
            ..Default::default()
        };
        let rows = get_observations_page(&conn, &filter, OrderBy::NewestFirst, 0, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "bug");

        let other = ObservationFilter {
            project: Some("elsewhere".into()),
            ..Default::default()
        };
        assert!(get_observations_page(&conn, &other, OrderBy::NewestFirst, 0, 10)
            .unwrap()
            .is_empty());
    }
}
