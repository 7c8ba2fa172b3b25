//! Session ingest endpoints: init, observation, summarize, delete.
//!
//! Filtering happens at this layer: fully-private prompts are accepted but
//! never stored, and observer-bootstrap payloads are acknowledged without
//! queueing.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::agent::with_db;
use crate::memory::queue::{self, EnqueueError};
use crate::memory::types::{PendingPayload, Platform};
use crate::memory::sessions;
use crate::server::error::{ApiError, ApiResult};
use crate::server::events::SseEvent;
use crate::server::AppState;
use crate::tags;

/// Preamble emitted by external observer tooling when it bootstraps; such
/// payloads are acknowledged and dropped rather than distilled.
const BOOTSTRAP_PREAMBLES: &[&str] = &[
    "You are the memory observer",
    "[observer bootstrap]",
];

fn is_observer_bootstrap(text: &str) -> bool {
    let trimmed = text.trim_start();
    BOOTSTRAP_PREAMBLES.iter().any(|p| trimmed.starts_with(p))
}

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    #[serde(rename = "contentSessionId")]
    pub content_session_id: String,
    pub project: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub platform: Option<String>,
}

/// `POST /sessions/init` — generic entry. Broadcasts `new_prompt` for every
/// platform except the hosted agent, whose legacy dual-entry path
/// (`/sessions/:id/init`) owns that broadcast.
pub async fn init_session(
    State(state): State<AppState>,
    Json(req): Json<InitRequest>,
) -> ApiResult<Json<Value>> {
    handle_init(state, req, false).await
}

/// `POST /sessions/:id/init` — legacy hosted-agent entry; the path id wins
/// over any body value and `new_prompt` broadcasts from here.
pub async fn init_session_legacy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut req): Json<InitRequest>,
) -> ApiResult<Json<Value>> {
    req.content_session_id = id;
    req.platform = Some(Platform::HostedAgent.as_str().to_string());
    handle_init(state, req, true).await
}

async fn handle_init(
    state: AppState,
    req: InitRequest,
    legacy_entry: bool,
) -> ApiResult<Json<Value>> {
    if req.content_session_id.trim().is_empty() {
        return Err(ApiError::Validation("contentSessionId is required".into()));
    }
    if req.project.trim().is_empty() {
        return Err(ApiError::Validation("project is required".into()));
    }

    let platform: Platform = match req.platform.as_deref() {
        None => Platform::HostedAgent,
        Some(raw) => raw.parse().map_err(ApiError::Validation)?,
    };

    // Private prompts are accepted but never stored.
    if tags::is_fully_private(&req.prompt) {
        debug!(session = %req.content_session_id, "prompt skipped as private");
        return Ok(Json(json!({"skipped": true, "reason": "private"})));
    }

    let prompt = tags::sanitize_prompt(&req.prompt);
    let content_session_id = req.content_session_id.clone();
    let project = req.project.clone();
    let deps = state.deps.clone();

    let prompt_for_db = prompt.clone();
    let (session, appended) = with_db(&deps, move |conn| {
        let session = sessions::create_or_get_session(
            conn,
            &content_session_id,
            &project,
            Some(prompt_for_db.as_str()),
            platform,
        )?;
        let appended = sessions::append_user_prompt(conn, &content_session_id, &prompt_for_db)?;
        Ok((session, appended))
    })
    .await?;
    let prompt_number = appended.prompt_number;

    index_prompt_vector(&state, appended.row_id, prompt);

    // Dual-entry semantics: hosted-agent sessions broadcast from the legacy
    // path only; everything else broadcasts here.
    let broadcast_here = legacy_entry || platform != Platform::HostedAgent;
    if broadcast_here {
        state.events().send(SseEvent::NewPrompt {
            content_session_id: session.content_session_id.clone(),
            prompt_number,
            project: session.project.clone(),
        });
    }
    state.events().send(SseEvent::SessionStarted {
        session_id: session.id,
        content_session_id: session.content_session_id.clone(),
        project: session.project.clone(),
    });

    info!(
        session = %session.content_session_id,
        project = %session.project,
        prompt_number,
        "session initialized"
    );
    Ok(Json(json!({"skipped": false, "sessionId": session.id})))
}

#[derive(Debug, Deserialize)]
pub struct ObservationRequest {
    #[serde(rename = "contentSessionId")]
    pub content_session_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_response: String,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// `POST /sessions/observations` — enqueue a tool event for distillation.
pub async fn queue_observation(
    State(state): State<AppState>,
    Json(req): Json<ObservationRequest>,
) -> ApiResult<Json<Value>> {
    if req.content_session_id.trim().is_empty() {
        return Err(ApiError::Validation("contentSessionId is required".into()));
    }

    if is_observer_bootstrap(&req.tool_response) {
        debug!(session = %req.content_session_id, "observer bootstrap payload skipped");
        return Ok(Json(
            json!({"status": "skipped", "reason": "observer_bootstrap"}),
        ));
    }

    let cap = state.settings().queue_cap;
    let content_session_id = req.content_session_id.clone();
    let tool_name = req.tool_name.clone();
    let payload = PendingPayload::Observation {
        tool_name: req.tool_name,
        tool_input: req.tool_input,
        tool_response: tags::strip_context_blocks(&req.tool_response),
        cwd: req.cwd,
    };

    let session_id = enqueue_for_session(&state, content_session_id.clone(), payload, cap).await?;

    state.events().send(SseEvent::ObservationQueued {
        session_id,
        content_session_id,
        tool_name,
    });
    state.scheduler.kick().await;

    Ok(Json(json!({"status": "queued"})))
}

#[derive(Debug, Deserialize)]
pub struct SummarizeRequest {
    #[serde(rename = "contentSessionId")]
    pub content_session_id: String,
    #[serde(default)]
    pub last_assistant_message: Option<String>,
}

/// `POST /sessions/summarize` — enqueue the end-of-turn summary request.
pub async fn queue_summarize(
    State(state): State<AppState>,
    Json(req): Json<SummarizeRequest>,
) -> ApiResult<Json<Value>> {
    if req.content_session_id.trim().is_empty() {
        return Err(ApiError::Validation("contentSessionId is required".into()));
    }

    let cap = state.settings().queue_cap;
    let content_session_id = req.content_session_id.clone();
    let payload = PendingPayload::Summarize {
        last_assistant_message: req
            .last_assistant_message
            .map(|m| tags::strip_context_blocks(&m)),
    };

    let session_id = enqueue_for_session(&state, content_session_id.clone(), payload, cap).await?;

    state.events().send(SseEvent::SummarizeQueued {
        session_id,
        content_session_id,
    });
    state.scheduler.kick().await;

    Ok(Json(json!({"status": "queued"})))
}

/// `DELETE /sessions/:id` — cancel the running agent task and drop pending
/// work. `:id` is the upstream content session id.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let deps = state.deps.clone();
    let lookup_id = id.clone();
    let session = with_db(&deps, move |conn| {
        sessions::get_session_by_content_id(conn, &lookup_id)
    })
    .await?;

    let Some(session) = session else {
        return Err(ApiError::NotFound(format!("unknown session: {id}")));
    };

    let cancelled = state.scheduler.cancel_session(session.id);
    let session_id = session.id;
    let purged = with_db(&deps, move |conn| {
        Ok(queue::purge_session(conn, session_id)?)
    })
    .await?;

    info!(session = %id, cancelled, purged, "session deleted");
    Ok(Json(json!({"cancelled": cancelled, "purgedMessages": purged})))
}

/// Best-effort prompt indexing: embed via the local daemon and upsert into
/// the vector index. Failures only cost recall; search falls back to FTS.
fn index_prompt_vector(state: &AppState, row_id: i64, text: String) {
    let Some(embedder) = state.embedder.clone() else {
        return;
    };
    let db = std::sync::Arc::clone(&state.deps.db);
    tokio::spawn(async move {
        match embedder.embed(&text).await {
            Ok(embedding) => {
                let _ = tokio::task::spawn_blocking(move || {
                    if let Ok(conn) = db.lock() {
                        crate::memory::vector::upsert_best_effort(
                            &conn,
                            crate::memory::vector::VectorKind::Prompt,
                            row_id,
                            &embedding,
                        );
                    }
                })
                .await;
            }
            Err(e) => debug!(error = %e, "prompt embedding unavailable"),
        }
    });
}

/// Resolve the session and enqueue, mapping queue-full onto 429.
async fn enqueue_for_session(
    state: &AppState,
    content_session_id: String,
    payload: PendingPayload,
    cap: usize,
) -> ApiResult<i64> {
    let deps = state.deps.clone();
    with_db(&deps, move |conn| {
        let Some(session) = sessions::get_session_by_content_id(conn, &content_session_id)?
        else {
            return Ok(Err(ApiError::NotFound(format!(
                "session not initialized: {content_session_id}"
            ))));
        };
        match queue::enqueue(conn, session.id, &content_session_id, &payload, cap) {
            Ok(_) => Ok(Ok(session.id)),
            Err(EnqueueError::QueueFull { .. }) => Ok(Err(ApiError::RateLimited(format!(
                "queue full for session {content_session_id} (cap {cap})"
            )))),
            Err(EnqueueError::Db(e)) => Err(e),
        }
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_detection_matches_preambles() {
        assert!(is_observer_bootstrap(
            "You are the memory observer for this session."
        ));
        assert!(is_observer_bootstrap("  [observer bootstrap] init"));
        assert!(!is_observer_bootstrap("ran cargo test, 42 passed"));
    }
}
