//! The query engine: search, timeline, and batched fetch, rendered as
//! compact markdown index tables (ids, titles, dates) so a result costs the
//! host tool tens of tokens, not hundreds.
//!
//! Prompt search queries the vector index first and transparently falls
//! back to relational full text when the index yields nothing or errors.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{TimeZone, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::agent::local::LocalProvider;
use crate::memory::observations::{self, ObservationFilter, OrderBy};
use crate::memory::types::{ObservationRecord, UserPromptRecord};
use crate::memory::{search, timeline, vector};

/// The `{content: [{type: "text", text}]}` payload shape shared by the HTTP
/// search endpoints and the bridge tools.
#[derive(Debug, Serialize)]
pub struct ToolContent {
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: &'static str,
    pub text: String,
}

impl ToolContent {
    pub fn text(text: String) -> Self {
        Self {
            content: vec![ContentBlock {
                block_type: "text",
                text,
            }],
        }
    }
}

/// What a search request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchKind {
    #[default]
    Observations,
    Summaries,
    Prompts,
    All,
}

impl std::str::FromStr for SearchKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observations" | "observation" => Ok(Self::Observations),
            "summaries" | "summary" => Ok(Self::Summaries),
            "prompts" | "prompt" => Ok(Self::Prompts),
            "all" => Ok(Self::All),
            _ => Err(format!("unknown search type: {s}")),
        }
    }
}

/// Parameters for [`QueryEngine::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub project: Option<String>,
    pub kind: SearchKind,
    pub filter: ObservationFilter,
    pub offset: i64,
    pub limit: i64,
}

/// Parameters for [`QueryEngine::timeline`].
#[derive(Debug, Clone, Default)]
pub struct TimelineRequest {
    pub anchor: Option<i64>,
    pub query: Option<String>,
    pub depth_before: i64,
    pub depth_after: i64,
    pub project: Option<String>,
}

/// Where prompt-search results came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptSearchSource {
    Vector,
    Sqlite,
}

#[derive(Debug, Serialize)]
pub struct PromptSearchResult {
    pub header: String,
    pub prompts: Vec<UserPromptRecord>,
    pub source: PromptSearchSource,
}

pub struct QueryEngine {
    db: Arc<Mutex<Connection>>,
    /// Embedding source for vector prompt search; absent when no local
    /// daemon is configured.
    embedder: Option<Arc<LocalProvider>>,
}

impl QueryEngine {
    pub fn new(db: Arc<Mutex<Connection>>, embedder: Option<Arc<LocalProvider>>) -> Self {
        Self { db, embedder }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))
    }

    /// Full-text search rendered as a markdown index table.
    pub fn search(&self, req: &SearchRequest) -> Result<ToolContent> {
        let limit = req.limit.clamp(1, 50);
        let conn = self.lock()?;
        let mut sections = Vec::new();

        if matches!(req.kind, SearchKind::Observations | SearchKind::All) {
            let mut filter = req.filter.clone();
            filter.project = req.project.clone();
            let page = search::search_observations(&conn, &req.query, &filter, req.offset, limit)?;
            if !page.results.is_empty() {
                let mut table = String::from("| id | date | type | title |\n|---|---|---|---|\n");
                for hit in &page.results {
                    let o = &hit.record;
                    table.push_str(&format!(
                        "| {} | {} | {} | {} |\n",
                        o.id,
                        format_date(o.created_at_epoch),
                        o.observation_type,
                        sanitize_cell(&o.title),
                    ));
                }
                if page.has_more {
                    table.push_str("\n_more results available; increase offset_\n");
                }
                sections.push(format!(
                    "Found {} observation(s) matching \"{}\"\n\n{table}",
                    page.results.len(),
                    req.query
                ));
            }
        }

        if matches!(req.kind, SearchKind::Summaries | SearchKind::All) {
            let page = search::search_summaries(
                &conn,
                &req.query,
                req.project.as_deref(),
                req.offset,
                limit,
            )?;
            if !page.results.is_empty() {
                let mut table = String::from("| id | date | request |\n|---|---|---|\n");
                for hit in &page.results {
                    let s = &hit.record;
                    table.push_str(&format!(
                        "| {} | {} | {} |\n",
                        s.id,
                        format_date(s.created_at_epoch),
                        sanitize_cell(&s.request),
                    ));
                }
                sections.push(format!(
                    "Found {} summary(ies) matching \"{}\"\n\n{table}",
                    page.results.len(),
                    req.query
                ));
            }
        }

        if matches!(req.kind, SearchKind::Prompts | SearchKind::All) {
            let page = search::search_user_prompts(
                &conn,
                &req.query,
                req.project.as_deref(),
                req.offset,
                limit,
            )?;
            if !page.results.is_empty() {
                sections.push(render_prompt_table(
                    &req.query,
                    &page.results.iter().map(|h| h.record.clone()).collect::<Vec<_>>(),
                ));
            }
        }

        if sections.is_empty() {
            return Ok(ToolContent::text(format!(
                "No results for \"{}\"",
                req.query
            )));
        }
        Ok(ToolContent::text(sections.join("\n\n")))
    }

    /// Chronological window around an anchor. When `query` is given, the
    /// best observation match becomes the anchor.
    pub fn timeline(&self, req: &TimelineRequest) -> Result<ToolContent> {
        let conn = self.lock()?;

        let anchor_id = match (req.anchor, &req.query) {
            (Some(id), _) => id,
            (None, Some(query)) => {
                let mut filter = ObservationFilter::default();
                filter.project = req.project.clone();
                let page = search::search_observations(&conn, query, &filter, 0, 1)?;
                match page.results.first() {
                    Some(hit) => hit.record.id,
                    None => {
                        return Ok(ToolContent::text(format!(
                            "No timeline anchor found for \"{query}\""
                        )))
                    }
                }
            }
            (None, None) => anyhow::bail!("timeline requires an anchor or a query"),
        };

        let window = timeline::get_timeline(
            &conn,
            timeline::Anchor {
                observation_id: anchor_id,
            },
            req.depth_before.max(0),
            req.depth_after.max(0),
            req.project.as_deref(),
        )?;

        let mut table = String::from("| when | kind | id | title |\n|---|---|---|---|\n");
        for entry in &window {
            match entry {
                timeline::TimelineEntry::Observation(o) => {
                    let marker = if o.id == anchor_id { " (anchor)" } else { "" };
                    table.push_str(&format!(
                        "| {} | {} | {} | {}{} |\n",
                        format_date(o.created_at_epoch),
                        o.observation_type,
                        o.id,
                        sanitize_cell(&o.title),
                        marker,
                    ));
                }
                timeline::TimelineEntry::Summary(s) => {
                    table.push_str(&format!(
                        "| {} | summary | {} | {} |\n",
                        format_date(s.created_at_epoch),
                        s.id,
                        sanitize_cell(&s.request),
                    ));
                }
            }
        }

        Ok(ToolContent::text(table))
    }

    /// Batched full-record fetch — documented contract: call only after a
    /// filtered index query.
    pub fn get_observations(&self, ids: &[i64]) -> Result<Vec<ObservationRecord>> {
        let conn = self.lock()?;
        observations::get_observations_by_ids(&conn, ids)
    }

    /// Paged observation feed for the viewer.
    pub fn observations_page(
        &self,
        filter: &ObservationFilter,
        order_by: OrderBy,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ObservationRecord>> {
        let conn = self.lock()?;
        observations::get_observations_page(&conn, filter, order_by, offset, limit)
    }

    /// Prompt search: vector index first, transparent relational fallback.
    pub async fn search_prompts(
        &self,
        query: &str,
        project: Option<&str>,
        limit: i64,
    ) -> Result<PromptSearchResult> {
        if let Some(embedder) = &self.embedder {
            match embedder.embed(query).await {
                Ok(embedding) if embedding.len() == vector::EMBEDDING_DIM => {
                    let hits = {
                        let conn = self.lock()?;
                        vector::search(&conn, vector::VectorKind::Prompt, &embedding, limit as usize)
                            .unwrap_or_default()
                    };
                    if !hits.is_empty() {
                        let prompts = {
                            let conn = self.lock()?;
                            fetch_prompts_by_ids(&conn, &hits.iter().map(|h| h.id).collect::<Vec<_>>())?
                        };
                        if !prompts.is_empty() {
                            return Ok(PromptSearchResult {
                                header: prompt_header(prompts.len(), query),
                                prompts,
                                source: PromptSearchSource::Vector,
                            });
                        }
                    }
                    tracing::debug!("vector prompt search empty, falling back to full text");
                }
                Ok(_) => tracing::warn!("embedding dimension mismatch, falling back to full text"),
                Err(e) => tracing::debug!(error = %e, "embedding unavailable, falling back to full text"),
            }
        }

        let conn = self.lock()?;
        let page = search::search_user_prompts(&conn, query, project, 0, limit)?;
        let prompts: Vec<UserPromptRecord> =
            page.results.into_iter().map(|h| h.record).collect();
        Ok(PromptSearchResult {
            header: prompt_header(prompts.len(), query),
            prompts,
            source: PromptSearchSource::Sqlite,
        })
    }
}

fn prompt_header(count: usize, query: &str) -> String {
    format!("Found {count} user prompt(s) matching \"{query}\"")
}

fn render_prompt_table(query: &str, prompts: &[UserPromptRecord]) -> String {
    let mut table = String::from("| id | date | prompt |\n|---|---|---|\n");
    for p in prompts {
        table.push_str(&format!(
            "| {} | {} | {} |\n",
            p.id,
            format_date(p.created_at_epoch),
            sanitize_cell(&truncate(&p.prompt_text, 80)),
        ));
    }
    format!("{}\n\n{table}", prompt_header(prompts.len(), query))
}

fn fetch_prompts_by_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<UserPromptRecord>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT id, content_session_id, prompt_number, prompt_text, created_at_epoch
         FROM user_prompts WHERE id IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let sql_params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();
    let rows = stmt
        .query_map(sql_params.as_slice(), |row| {
            Ok(UserPromptRecord {
                id: row.get(0)?,
                content_session_id: row.get(1)?,
                prompt_number: row.get(2)?,
                prompt_text: row.get(3)?,
                created_at_epoch: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // Preserve the hit order
    let mut by_id: std::collections::HashMap<i64, UserPromptRecord> =
        rows.into_iter().map(|r| (r.id, r)).collect();
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

fn format_date(epoch_ms: i64) -> String {
    Utc.timestamp_millis_opt(epoch_ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| epoch_ms.to_string())
}

fn sanitize_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}
