//! Optional vector index over sqlite-vec.
//!
//! Strictly an accelerator: every caller must tolerate `Ok(empty)` and
//! errors by falling back to the relational full-text path. Writes log and
//! swallow failures so a broken index never blocks the write path.

use anyhow::Result;
use rusqlite::{params, Connection};

/// Embedding dimension of the `memory_vec` table.
pub const EMBEDDING_DIM: usize = 768;

/// What a vector record points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorKind {
    Observation,
    Summary,
    Prompt,
}

impl VectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::Summary => "summary",
            Self::Prompt => "prompt",
        }
    }

    fn key(&self, id: i64) -> String {
        format!("{}:{id}", self.as_str())
    }
}

/// A KNN hit: the referenced row id and its L2 distance.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: i64,
    pub distance: f64,
}

/// Reinterpret an f32 slice as raw little-endian bytes for vec0 binding.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Insert or replace a vector. Dimension mismatches are rejected before
/// touching the table.
pub fn upsert(conn: &Connection, kind: VectorKind, id: i64, embedding: &[f32]) -> Result<()> {
    anyhow::ensure!(
        embedding.len() == EMBEDDING_DIM,
        "embedding dimension {} != {EMBEDDING_DIM}",
        embedding.len()
    );
    let key = kind.key(id);
    conn.execute("DELETE FROM memory_vec WHERE id = ?1", params![key])?;
    conn.execute(
        "INSERT INTO memory_vec (id, embedding) VALUES (?1, ?2)",
        params![key, embedding_to_bytes(embedding)],
    )?;
    Ok(())
}

/// Best-effort upsert: logs instead of failing. Used on the agent write
/// path where the relational commit has already happened.
pub fn upsert_best_effort(conn: &Connection, kind: VectorKind, id: i64, embedding: &[f32]) {
    if let Err(e) = upsert(conn, kind, id, embedding) {
        tracing::warn!(kind = kind.as_str(), id, error = %e, "vector upsert failed");
    }
}

/// KNN search restricted to one kind. Returns an empty vec when the index
/// has no rows of that kind — callers fall back to full text.
pub fn search(
    conn: &Connection,
    kind: VectorKind,
    embedding: &[f32],
    limit: usize,
) -> Result<Vec<VectorHit>> {
    anyhow::ensure!(
        embedding.len() == EMBEDDING_DIM,
        "embedding dimension {} != {EMBEDDING_DIM}",
        embedding.len()
    );

    let prefix = format!("{}:", kind.as_str());
    // vec0 KNN cannot combine MATCH with LIKE, so over-fetch and filter.
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM memory_vec
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(
            params![embedding_to_bytes(embedding), (limit * 4) as i64],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let hits = rows
        .into_iter()
        .filter_map(|(key, distance)| {
            key.strip_prefix(&prefix)
                .and_then(|raw| raw.parse::<i64>().ok())
                .map(|id| VectorHit { id, distance })
        })
        .take(limit)
        .collect();
    Ok(hits)
}

/// Count of indexed vectors per kind — surfaced in `/stats`.
pub fn count(conn: &Connection, kind: VectorKind) -> Result<i64> {
    let prefix = format!("{}:%", kind.as_str());
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM memory_vec WHERE id LIKE ?1",
        params![prefix],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        crate::db::open_in_memory().unwrap()
    }

    fn embedding(seed: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[seed % EMBEDDING_DIM] = 1.0;
        v
    }

    #[test]
    fn upsert_and_search_by_kind() {
        let conn = test_db();
        upsert(&conn, VectorKind::Prompt, 1, &embedding(0)).unwrap();
        upsert(&conn, VectorKind::Prompt, 2, &embedding(100)).unwrap();
        upsert(&conn, VectorKind::Observation, 3, &embedding(0)).unwrap();

        let hits = search(&conn, VectorKind::Prompt, &embedding(0), 5).unwrap();
        assert_eq!(hits[0].id, 1);
        // The observation with an identical embedding is excluded by kind
        assert!(hits.iter().all(|h| h.id != 3));
    }

    #[test]
    fn empty_index_returns_no_hits() {
        let conn = test_db();
        let hits = search(&conn, VectorKind::Prompt, &embedding(0), 5).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let conn = test_db();
        assert!(upsert(&conn, VectorKind::Prompt, 1, &[1.0, 2.0]).is_err());
        assert!(search(&conn, VectorKind::Prompt, &[1.0, 2.0], 5).is_err());
    }

    #[test]
    fn upsert_replaces_existing_vector() {
        let conn = test_db();
        upsert(&conn, VectorKind::Prompt, 1, &embedding(0)).unwrap();
        upsert(&conn, VectorKind::Prompt, 1, &embedding(5)).unwrap();
        assert_eq!(count(&conn, VectorKind::Prompt).unwrap(), 1);

        let hits = search(&conn, VectorKind::Prompt, &embedding(5), 1).unwrap();
        assert_eq!(hits[0].id, 1);
        assert!(hits[0].distance < 0.01);
    }
}
