//! Read-side endpoints: paged feeds, search, timeline, context assembly,
//! and project diagnostics.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent::with_db;
use crate::ingest::discover;
use crate::memory::observations::{ObservationFilter, OrderBy};
use crate::memory::{now_epoch_ms, observations, sessions};
use crate::query::{SearchKind, SearchRequest, TimelineRequest};
use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;

fn parse_order(raw: Option<&str>) -> ApiResult<OrderBy> {
    match raw {
        None | Some("newest") => Ok(OrderBy::NewestFirst),
        Some("oldest") => Ok(OrderBy::OldestFirst),
        Some(other) => Err(ApiError::Validation(format!("unknown orderBy: {other}"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub project: Option<String>,
    #[serde(rename = "type")]
    pub obs_type: Option<String>,
    pub concept: Option<String>,
    pub file: Option<String>,
    #[serde(rename = "dateStart")]
    pub date_start: Option<i64>,
    #[serde(rename = "dateEnd")]
    pub date_end: Option<i64>,
    #[serde(rename = "orderBy")]
    pub order_by: Option<String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl PageParams {
    fn filter(&self) -> ApiResult<ObservationFilter> {
        let observation_type = match &self.obs_type {
            None => None,
            Some(raw) => Some(raw.parse().map_err(ApiError::Validation)?),
        };
        Ok(ObservationFilter {
            project: self.project.clone(),
            observation_type,
            concept: self.concept.clone(),
            file_path: self.file.clone(),
            date_start_epoch: self.date_start,
            date_end_epoch: self.date_end,
        })
    }

    fn limit(&self) -> i64 {
        self.limit.unwrap_or(20).clamp(1, 100)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// `GET /observations` — the viewer's paged feed.
pub async fn observations_page(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Value>> {
    let filter = params.filter()?;
    let order = parse_order(params.order_by.as_deref())?;
    let rows = state
        .query
        .observations_page(&filter, order, params.offset(), params.limit())?;
    Ok(Json(json!({"observations": rows})))
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub ids: Vec<i64>,
}

/// `POST /observations/batch` — full records for already-filtered ids.
pub async fn observations_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<Json<Value>> {
    if req.ids.is_empty() {
        return Err(ApiError::Validation("ids must not be empty".into()));
    }
    if req.ids.len() > 100 {
        return Err(ApiError::Validation("at most 100 ids per batch".into()));
    }
    let rows = state.query.get_observations(&req.ids)?;
    Ok(Json(json!({"observations": rows})))
}

/// `GET /summaries`
pub async fn summaries_page(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Value>> {
    let deps = state.deps.clone();
    let project = params.project.clone();
    let (offset, limit) = (params.offset(), params.limit());
    let rows = with_db(&deps, move |conn| {
        observations::get_summaries_page(conn, project.as_deref(), offset, limit)
    })
    .await?;
    Ok(Json(json!({"summaries": rows})))
}

/// `GET /prompts`
pub async fn prompts_page(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Value>> {
    let deps = state.deps.clone();
    let project = params.project.clone();
    let (offset, limit) = (params.offset(), params.limit());
    let rows = with_db(&deps, move |conn| {
        sessions::get_prompts_page(conn, project.as_deref(), offset, limit)
    })
    .await?;
    Ok(Json(json!({"prompts": rows})))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub query: String,
    pub project: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(rename = "obs_type")]
    pub obs_type: Option<String>,
    #[serde(rename = "dateStart")]
    pub date_start: Option<i64>,
    #[serde(rename = "dateEnd")]
    pub date_end: Option<i64>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

/// `GET /search` — markdown index table over the requested record kinds.
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Value>> {
    if params.query.trim().is_empty() {
        return Err(ApiError::Validation("query is required".into()));
    }

    let kind: SearchKind = match &params.kind {
        None => SearchKind::Observations,
        Some(raw) => raw.parse().map_err(ApiError::Validation)?,
    };
    let observation_type = match &params.obs_type {
        None => None,
        Some(raw) => Some(raw.parse().map_err(ApiError::Validation)?),
    };

    let req = SearchRequest {
        query: params.query,
        project: params.project,
        kind,
        filter: ObservationFilter {
            observation_type,
            date_start_epoch: params.date_start,
            date_end_epoch: params.date_end,
            ..Default::default()
        },
        offset: params.offset.unwrap_or(0).max(0),
        limit: params.limit.unwrap_or(10),
    };

    let content = state.query.search(&req)?;
    Ok(Json(serde_json::to_value(content).map_err(anyhow::Error::from)?))
}

#[derive(Debug, Deserialize)]
pub struct PromptSearchParams {
    pub query: String,
    pub project: Option<String>,
    pub limit: Option<i64>,
}

/// `GET /search/prompts` — vector-first prompt search with relational
/// fallback; the `source` field reports which backend answered.
pub async fn search_prompts(
    State(state): State<AppState>,
    Query(params): Query<PromptSearchParams>,
) -> ApiResult<Json<Value>> {
    if params.query.trim().is_empty() {
        return Err(ApiError::Validation("query is required".into()));
    }
    let result = state
        .query
        .search_prompts(
            &params.query,
            params.project.as_deref(),
            params.limit.unwrap_or(5).clamp(1, 50),
        )
        .await?;
    Ok(Json(serde_json::to_value(result).map_err(anyhow::Error::from)?))
}

#[derive(Debug, Deserialize)]
pub struct TimelineParams {
    pub anchor: Option<i64>,
    pub query: Option<String>,
    pub depth_before: Option<i64>,
    pub depth_after: Option<i64>,
    pub project: Option<String>,
}

/// `GET /timeline`
pub async fn timeline(
    State(state): State<AppState>,
    Query(params): Query<TimelineParams>,
) -> ApiResult<Json<Value>> {
    if params.anchor.is_none() && params.query.as_deref().map_or(true, |q| q.trim().is_empty()) {
        return Err(ApiError::Validation(
            "timeline requires anchor or query".into(),
        ));
    }
    let req = TimelineRequest {
        anchor: params.anchor,
        query: params.query,
        depth_before: params.depth_before.unwrap_or(5),
        depth_after: params.depth_after.unwrap_or(5),
        project: params.project,
    };
    let content = state.query.timeline(&req)?;
    Ok(Json(serde_json::to_value(content).map_err(anyhow::Error::from)?))
}

#[derive(Debug, Deserialize)]
pub struct ContextParams {
    pub project: Option<String>,
}

/// `GET /context` — the assembly the host tool injects at session start:
/// recent observations plus optionally the latest summary.
pub async fn context(
    State(state): State<AppState>,
    Query(params): Query<ContextParams>,
) -> ApiResult<Json<Value>> {
    let settings = state.settings();
    let count = settings.context_observation_count as i64;
    let type_filter = settings.context_type_filter.clone();
    let concept_filter = settings.context_concept_filter.clone();
    let include_summary = settings.context_include_summary;
    let include_last_message = settings.context_include_last_message;

    let filter = ObservationFilter {
        project: params.project.clone(),
        observation_type: type_filter
            .first()
            .and_then(|raw| raw.parse().ok()),
        concept: concept_filter.first().cloned(),
        ..Default::default()
    };
    let observations = state
        .query
        .observations_page(&filter, OrderBy::NewestFirst, 0, count.max(1))?;

    let deps = state.deps.clone();
    let project = params.project.clone();
    let summary = if include_summary {
        with_db(&deps, move |conn| {
            observations::get_latest_summary(conn, project.as_deref())
        })
        .await?
    } else {
        None
    };

    let deps = state.deps.clone();
    let project = params.project.clone();
    let last_prompt = if include_last_message {
        with_db(&deps, move |conn| {
            Ok(sessions::get_prompts_page(conn, project.as_deref(), 0, 1)?
                .into_iter()
                .next())
        })
        .await?
    } else {
        None
    };

    Ok(Json(json!({
        "observations": observations,
        "summary": summary,
        "lastPrompt": last_prompt,
    })))
}

/// `GET /projects`
pub async fn projects(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let deps = state.deps.clone();
    let rows = with_db(&deps, |conn| sessions::list_projects(conn)).await?;
    let list: Vec<Value> = rows
        .into_iter()
        .map(|(name, count)| json!({"name": name, "observations": count}))
        .collect();
    Ok(Json(json!({"projects": list})))
}

/// `GET /projects/diagnostics` — merge the ingested-project list with the
/// transcript-root scan so the viewer can surface unimported projects.
pub async fn projects_diagnostics(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let deps = state.deps.clone();
    let ingested: Vec<String> = with_db(&deps, |conn| sessions::list_projects(conn))
        .await?
        .into_iter()
        .map(|(name, _)| name)
        .collect();

    let root = state.transcript_root.clone();
    let report = tokio::task::spawn_blocking(move || match root {
        Some(root) => discover::discover_session_projects(&root),
        None => Ok(discover::DiscoveryReport::default()),
    })
    .await
    .map_err(|e| ApiError::Internal(anyhow::anyhow!("scan task failed: {e}")))??;

    let discovered: Vec<String> = report.projects.iter().cloned().collect();
    let missing: Vec<String> = discovered
        .iter()
        .filter(|p| !ingested.contains(p))
        .cloned()
        .collect();

    Ok(Json(json!({
        "ingestedProjects": ingested,
        "discoveredSessionProjects": discovered,
        "missingProjects": missing,
        "missingCount": missing.len(),
        "scannedFiles": report.scanned_files,
        "lastScanEpochMs": now_epoch_ms(),
    })))
}
