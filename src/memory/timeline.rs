//! Chronological timeline: observations and summaries interleaved around an
//! anchor record, `depth_before` older and `depth_after` newer entries.

use anyhow::Result;
use rusqlite::{params, Connection};

use crate::memory::observations::{map_observation_row, map_summary_row};
use crate::memory::types::{ObservationRecord, SummaryRecord};

/// One entry in the interleaved window.
#[derive(Debug, Clone)]
pub enum TimelineEntry {
    Observation(ObservationRecord),
    Summary(SummaryRecord),
}

impl TimelineEntry {
    pub fn created_at_epoch(&self) -> i64 {
        match self {
            Self::Observation(o) => o.created_at_epoch,
            Self::Summary(s) => s.created_at_epoch,
        }
    }

    /// Tiebreaker key for records sharing a timestamp: observations sort
    /// before summaries, then by row id.
    fn order_key(&self) -> (i64, u8, i64) {
        match self {
            Self::Observation(o) => (o.created_at_epoch, 0, o.id),
            Self::Summary(s) => (s.created_at_epoch, 1, s.id),
        }
    }
}

/// The anchor an observation id points at.
#[derive(Debug, Clone, Copy)]
pub struct Anchor {
    pub observation_id: i64,
}

/// Fetch a window of `depth_before` entries older than the anchor, the
/// anchor itself, and `depth_after` newer entries, all chronological.
pub fn get_timeline(
    conn: &Connection,
    anchor: Anchor,
    depth_before: i64,
    depth_after: i64,
    project: Option<&str>,
) -> Result<Vec<TimelineEntry>> {
    let anchor_epoch: i64 = conn.query_row(
        "SELECT created_at_epoch FROM observations WHERE id = ?1",
        params![anchor.observation_id],
        |row| row.get(0),
    )?;

    let mut before = collect_window(conn, anchor_epoch, project, Direction::Before, depth_before)?;
    let after = collect_window(conn, anchor_epoch, project, Direction::After, depth_after)?;

    let anchor_record = conn.query_row(
        "SELECT id, session_id, memory_session_id, project, type, title, subtitle, narrative,
                facts, concepts, files_read, files_modified, tokens_used, cwd, created_at_epoch
         FROM observations WHERE id = ?1",
        params![anchor.observation_id],
        map_observation_row,
    )?;

    before.push(TimelineEntry::Observation(anchor_record));
    before.extend(after);
    before.sort_by_key(|e| e.order_key());
    // The anchor also matches the >= / <= window scans; drop duplicates.
    before.dedup_by_key(|e| match e {
        TimelineEntry::Observation(o) => (0u8, o.id),
        TimelineEntry::Summary(s) => (1u8, s.id),
    });
    Ok(before)
}

enum Direction {
    Before,
    After,
}

fn collect_window(
    conn: &Connection,
    anchor_epoch: i64,
    project: Option<&str>,
    direction: Direction,
    depth: i64,
) -> Result<Vec<TimelineEntry>> {
    if depth <= 0 {
        return Ok(Vec::new());
    }

    let (obs_sql, sum_sql) = match direction {
        Direction::Before => (
            "SELECT id, session_id, memory_session_id, project, type, title, subtitle, narrative,
                    facts, concepts, files_read, files_modified, tokens_used, cwd, created_at_epoch
             FROM observations
             WHERE created_at_epoch < ?1 AND (?2 IS NULL OR project = ?2)
             ORDER BY created_at_epoch DESC, id DESC LIMIT ?3",
            "SELECT id, session_id, memory_session_id, project, request, investigated, learned,
                    completed, next_steps, notes, created_at_epoch
             FROM summaries
             WHERE created_at_epoch < ?1 AND (?2 IS NULL OR project = ?2)
             ORDER BY created_at_epoch DESC, id DESC LIMIT ?3",
        ),
        Direction::After => (
            "SELECT id, session_id, memory_session_id, project, type, title, subtitle, narrative,
                    facts, concepts, files_read, files_modified, tokens_used, cwd, created_at_epoch
             FROM observations
             WHERE created_at_epoch > ?1 AND (?2 IS NULL OR project = ?2)
             ORDER BY created_at_epoch ASC, id ASC LIMIT ?3",
            "SELECT id, session_id, memory_session_id, project, request, investigated, learned,
                    completed, next_steps, notes, created_at_epoch
             FROM summaries
             WHERE created_at_epoch > ?1 AND (?2 IS NULL OR project = ?2)
             ORDER BY created_at_epoch ASC, id ASC LIMIT ?3",
        ),
    };

    let mut entries: Vec<TimelineEntry> = Vec::new();

    let mut stmt = conn.prepare(obs_sql)?;
    let observations = stmt
        .query_map(params![anchor_epoch, project, depth], map_observation_row)?
        .collect::<Result<Vec<_>, _>>()?;
    entries.extend(observations.into_iter().map(TimelineEntry::Observation));

    let mut stmt = conn.prepare(sum_sql)?;
    let summaries = stmt
        .query_map(params![anchor_epoch, project, depth], map_summary_row)?
        .collect::<Result<Vec<_>, _>>()?;
    entries.extend(summaries.into_iter().map(TimelineEntry::Summary));

    // Merge the two streams, keep the `depth` entries closest to the anchor
    entries.sort_by_key(|e| e.order_key());
    match direction {
        Direction::Before => {
            let skip = entries.len().saturating_sub(depth as usize);
            Ok(entries.into_iter().skip(skip).collect())
        }
        Direction::After => {
            entries.truncate(depth as usize);
            Ok(entries)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::observations::store_observations;
    use crate::memory::sessions::create_or_get_session;
    use crate::memory::types::{ObservationDraft, ObservationType, Platform, SummaryDraft};

    fn test_db() -> Connection {
        crate::db::open_in_memory().unwrap()
    }

    fn insert_obs(conn: &mut Connection, session_id: i64, title: &str, epoch: i64) -> i64 {
        store_observations(
            conn,
            session_id,
            "mem-1",
            "demo",
            &[ObservationDraft {
                observation_type: Some(ObservationType::Change),
                title: title.into(),
                ..Default::default()
            }],
            None,
            Some(epoch),
        )
        .unwrap()
        .observation_ids[0]
    }

    #[test]
    fn window_interleaves_summaries_chronologically() {
        let mut conn = test_db();
        let s1 = create_or_get_session(&conn, "s1", "demo", None, Platform::HostedAgent)
            .unwrap()
            .id;
        let s2 = create_or_get_session(&conn, "s2", "demo", None, Platform::HostedAgent)
            .unwrap()
            .id;

        insert_obs(&mut conn, s1, "early", 1_000);
        // Summary between the two observations
        store_observations(
            &mut conn,
            s2,
            "mem-2",
            "demo",
            &[],
            Some(&SummaryDraft {
                request: "mid".into(),
                ..Default::default()
            }),
            Some(2_000),
        )
        .unwrap();
        let anchor = insert_obs(&mut conn, s1, "anchor", 3_000);
        insert_obs(&mut conn, s1, "late", 4_000);

        let window = get_timeline(
            &conn,
            Anchor {
                observation_id: anchor,
            },
            2,
            2,
            Some("demo"),
        )
        .unwrap();

        let kinds: Vec<&str> = window
            .iter()
            .map(|e| match e {
                TimelineEntry::Observation(o) => o.title.as_str(),
                TimelineEntry::Summary(_) => "summary",
            })
            .collect();
        assert_eq!(kinds, vec!["early", "summary", "anchor", "late"]);

        // Strictly chronological
        let epochs: Vec<i64> = window.iter().map(|e| e.created_at_epoch()).collect();
        let mut sorted = epochs.clone();
        sorted.sort();
        assert_eq!(epochs, sorted);
    }

    #[test]
    fn depth_limits_apply_on_each_side() {
        let mut conn = test_db();
        let sid = create_or_get_session(&conn, "s1", "demo", None, Platform::HostedAgent)
            .unwrap()
            .id;
        for i in 0..5 {
            insert_obs(&mut conn, sid, &format!("pre{i}"), 1_000 + i);
        }
        let anchor = insert_obs(&mut conn, sid, "anchor", 2_000);
        for i in 0..5 {
            insert_obs(&mut conn, sid, &format!("post{i}"), 3_000 + i);
        }

        let window = get_timeline(
            &conn,
            Anchor {
                observation_id: anchor,
            },
            1,
            2,
            None,
        )
        .unwrap();
        assert_eq!(window.len(), 4); // 1 before + anchor + 2 after
    }

    #[test]
    fn missing_anchor_is_an_error() {
        let conn = test_db();
        assert!(get_timeline(
            &conn,
            Anchor {
                observation_id: 999
            },
            1,
            1,
            None
        )
        .is_err());
    }
}
