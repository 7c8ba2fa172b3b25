//! The pending-message queue (part of the store so crash recovery resumes
//! in-flight work).
//!
//! Claiming is a single `DELETE ... RETURNING` statement: there is no
//! in-progress state to get stuck in. Per session, summarize messages always
//! claim before observation messages regardless of age; within a type, by
//! ascending id.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::memory::now_epoch_ms;
use crate::memory::types::{PendingMessage, PendingPayload};

/// Default per-session in-flight cap.
pub const DEFAULT_SESSION_CAP: usize = 3;

/// Enqueue failure modes the HTTP layer maps to client errors.
#[derive(Debug)]
pub enum EnqueueError {
    /// Per-session cap reached; the caller must retry later, nothing was dropped.
    QueueFull { session_id: i64, cap: usize },
    Db(anyhow::Error),
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull { session_id, cap } => {
                write!(f, "queue full for session {session_id} (cap {cap})")
            }
            Self::Db(e) => write!(f, "queue write failed: {e}"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Enqueue a message for a session, enforcing the per-session cap.
/// Returns the new queue row id.
pub fn enqueue(
    conn: &Connection,
    session_id: i64,
    content_session_id: &str,
    payload: &PendingPayload,
    cap: usize,
) -> Result<i64, EnqueueError> {
    let depth: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM pending_messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .map_err(|e| EnqueueError::Db(e.into()))?;

    if depth as usize >= cap {
        return Err(EnqueueError::QueueFull { session_id, cap });
    }

    let body = serde_json::to_string(payload).map_err(|e| EnqueueError::Db(e.into()))?;
    conn.execute(
        "INSERT INTO pending_messages (session_id, content_session_id, message_type, payload, created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            session_id,
            content_session_id,
            payload.message_type().as_str(),
            body,
            now_epoch_ms(),
        ],
    )
    .map_err(|e| EnqueueError::Db(e.into()))?;

    Ok(conn.last_insert_rowid())
}

/// Atomically claim (and delete) the next message for a session.
///
/// Order: summarize before observation, then ascending id. Returns `None`
/// when the session's queue is drained.
pub fn claim_and_delete(conn: &Connection, session_id: i64) -> Result<Option<PendingMessage>> {
    let row = conn
        .query_row(
            "DELETE FROM pending_messages
             WHERE id = (
                 SELECT id FROM pending_messages
                 WHERE session_id = ?1
                 ORDER BY (message_type = 'observation') ASC, id ASC
                 LIMIT 1
             )
             RETURNING id, session_id, content_session_id, payload, created_at_epoch",
            params![session_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((id, session_id, content_session_id, body, created_at_epoch)) = row else {
        return Ok(None);
    };

    let payload: PendingPayload = serde_json::from_str(&body)?;
    Ok(Some(PendingMessage {
        id,
        session_id,
        content_session_id,
        payload,
        created_at_epoch,
    }))
}

/// Age in milliseconds of the oldest pending message across all sessions,
/// or `None` when the queue is empty. Used for viewer back-pressure hints.
pub fn get_oldest_active_message_age_ms(conn: &Connection, now: Option<i64>) -> Result<Option<i64>> {
    let oldest: Option<i64> = conn
        .query_row(
            "SELECT MIN(created_at_epoch) FROM pending_messages",
            [],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(oldest.map(|epoch| (now.unwrap_or_else(now_epoch_ms) - epoch).max(0)))
}

/// Total pending messages across all sessions.
pub fn get_total_active_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM pending_messages", [], |row| row.get(0))?)
}

/// Pending depth for one session.
pub fn get_session_depth(conn: &Connection, session_id: i64) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM pending_messages WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )?)
}

/// Diagnostic dump of the queue, claim order.
pub fn get_queue_messages(conn: &Connection) -> Result<Vec<PendingMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, content_session_id, payload, created_at_epoch
         FROM pending_messages
         ORDER BY session_id ASC, (message_type = 'observation') ASC, id ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut messages = Vec::with_capacity(rows.len());
    for (id, session_id, content_session_id, body, created_at_epoch) in rows {
        let payload: PendingPayload = serde_json::from_str(&body)?;
        messages.push(PendingMessage {
            id,
            session_id,
            content_session_id,
            payload,
            created_at_epoch,
        });
    }
    Ok(messages)
}

/// Sessions that have pending work but (per the scheduler) no running task,
/// ordered by their earliest pending message id — the FIFO wakeup order.
pub fn sessions_with_pending_work(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT session_id FROM pending_messages
         GROUP BY session_id
         ORDER BY MIN(id) ASC",
    )?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Drop all pending messages for a session (session delete / cancel).
pub fn purge_session(conn: &Connection, session_id: i64) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM pending_messages WHERE session_id = ?1",
        params![session_id],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::sessions::create_or_get_session;
    use crate::memory::types::Platform;

    fn test_db() -> Connection {
        crate::db::open_in_memory().unwrap()
    }

    fn obs(tool: &str) -> PendingPayload {
        PendingPayload::Observation {
            tool_name: tool.into(),
            tool_input: serde_json::Value::Null,
            tool_response: "ok".into(),
            cwd: None,
        }
    }

    fn summarize() -> PendingPayload {
        PendingPayload::Summarize {
            last_assistant_message: Some("done".into()),
        }
    }

    fn session(conn: &Connection, cid: &str) -> i64 {
        create_or_get_session(conn, cid, "demo", None, Platform::HostedAgent)
            .unwrap()
            .id
    }

    #[test]
    fn summarize_claims_before_observation_regardless_of_age() {
        let conn = test_db();
        let sid = session(&conn, "s1");

        // Interleave: obs1, sum1, obs2, sum2
        enqueue(&conn, sid, "s1", &obs("one"), 10).unwrap();
        enqueue(&conn, sid, "s1", &summarize(), 10).unwrap();
        enqueue(&conn, sid, "s1", &obs("two"), 10).unwrap();
        enqueue(&conn, sid, "s1", &summarize(), 10).unwrap();

        let mut order = Vec::new();
        while let Some(msg) = claim_and_delete(&conn, sid).unwrap() {
            order.push(msg.payload.message_type().as_str().to_string());
        }
        assert_eq!(order, vec!["summarize", "summarize", "observation", "observation"]);
    }

    #[test]
    fn observations_claim_by_ascending_id() {
        let conn = test_db();
        let sid = session(&conn, "s1");
        enqueue(&conn, sid, "s1", &obs("first"), 10).unwrap();
        enqueue(&conn, sid, "s1", &obs("second"), 10).unwrap();

        let a = claim_and_delete(&conn, sid).unwrap().unwrap();
        let b = claim_and_delete(&conn, sid).unwrap().unwrap();
        assert!(a.id < b.id);
        match a.payload {
            PendingPayload::Observation { tool_name, .. } => assert_eq!(tool_name, "first"),
            _ => panic!("expected observation"),
        }
    }

    #[test]
    fn over_cap_enqueue_is_rejected_not_dropped() {
        let conn = test_db();
        let sid = session(&conn, "s1");
        enqueue(&conn, sid, "s1", &obs("a"), 2).unwrap();
        enqueue(&conn, sid, "s1", &obs("b"), 2).unwrap();

        let err = enqueue(&conn, sid, "s1", &obs("c"), 2).unwrap_err();
        assert!(matches!(err, EnqueueError::QueueFull { cap: 2, .. }));
        assert_eq!(get_session_depth(&conn, sid).unwrap(), 2);
    }

    #[test]
    fn oldest_age_spans_sessions() {
        let conn = test_db();
        let s1 = session(&conn, "s1");
        let s2 = session(&conn, "s2");
        enqueue(&conn, s1, "s1", &obs("a"), 10).unwrap();
        enqueue(&conn, s2, "s2", &obs("b"), 10).unwrap();

        // Backdate the first message
        conn.execute(
            "UPDATE pending_messages SET created_at_epoch = created_at_epoch - 20000
             WHERE session_id = ?1",
            params![s1],
        )
        .unwrap();

        let age = get_oldest_active_message_age_ms(&conn, None).unwrap().unwrap();
        assert!(age >= 20_000);
        assert_eq!(get_total_active_count(&conn).unwrap(), 2);
    }

    #[test]
    fn empty_queue_reports_no_age() {
        let conn = test_db();
        assert!(get_oldest_active_message_age_ms(&conn, None).unwrap().is_none());
    }

    #[test]
    fn fifo_wakeup_order_by_earliest_message() {
        let conn = test_db();
        let s1 = session(&conn, "s1");
        let s2 = session(&conn, "s2");
        enqueue(&conn, s2, "s2", &obs("b"), 10).unwrap();
        enqueue(&conn, s1, "s1", &obs("a"), 10).unwrap();

        assert_eq!(sessions_with_pending_work(&conn).unwrap(), vec![s2, s1]);
    }

    #[test]
    fn purge_drops_only_target_session() {
        let conn = test_db();
        let s1 = session(&conn, "s1");
        let s2 = session(&conn, "s2");
        enqueue(&conn, s1, "s1", &obs("a"), 10).unwrap();
        enqueue(&conn, s2, "s2", &obs("b"), 10).unwrap();

        assert_eq!(purge_session(&conn, s1).unwrap(), 1);
        assert_eq!(get_total_active_count(&conn).unwrap(), 1);
    }
}
