//! The loopback HTTP+SSE frontend: ingestion, queries, settings, stats, and
//! the viewer event stream, all on one axum router.

pub mod error;
pub mod events;
pub mod ollama;
pub mod queries;
pub mod sessions;
pub mod settings_api;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::sse::{KeepAlive, Sse};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use futures_util::stream::Stream;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::{local::LocalProvider, AgentDeps};
use crate::config::{ProviderKind, Settings};
use crate::memory::queue;
use crate::query::QueryEngine;
use crate::scheduler::Scheduler;
use events::{EventSender, SseEvent};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub deps: AgentDeps,
    pub scheduler: Arc<Scheduler>,
    pub query: Arc<QueryEngine>,
    /// Embedding source for the optional vector index.
    pub embedder: Option<Arc<LocalProvider>>,
    pub settings_path: PathBuf,
    pub transcript_root: Option<PathBuf>,
    pub started_at: Instant,
}

impl AppState {
    pub fn events(&self) -> &EventSender {
        &self.deps.events
    }

    pub fn settings(&self) -> &Settings {
        &self.deps.settings
    }
}

/// Build the full application state from settings.
pub fn build_state(settings: Settings) -> Result<AppState> {
    let db_path = crate::db::database_path(&settings.data_dir);
    let conn = crate::db::open_database(&db_path)?;

    // A changed embedding model leaves the vector index misaligned; recall
    // degrades to full text until the index is repopulated.
    if let Ok(Some(stored)) = crate::db::migrations::get_embedding_model(&conn) {
        if stored != crate::agent::local::EMBEDDING_MODEL {
            warn!(
                stored = %stored,
                configured = crate::agent::local::EMBEDDING_MODEL,
                "embedding model changed; existing vectors will not match"
            );
        }
    }

    let db = Arc::new(Mutex::new(conn));

    let embedder = match settings.provider {
        ProviderKind::Local => LocalProvider::from_settings(&settings).ok().map(Arc::new),
        _ => None,
    };

    let settings_path = Settings::settings_path(&settings.data_dir);
    let settings = Arc::new(settings);
    let deps = AgentDeps {
        db: Arc::clone(&db),
        settings: Arc::clone(&settings),
        events: EventSender::new(),
    };
    let scheduler = Scheduler::new(deps.clone(), settings.max_concurrent_sessions);
    let query = Arc::new(QueryEngine::new(db, embedder.clone()));

    Ok(AppState {
        deps,
        scheduler,
        query,
        embedder,
        settings_path,
        transcript_root: dirs::home_dir().map(|h| h.join(".codex").join("sessions")),
        started_at: Instant::now(),
    })
}

/// Assemble the router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Session ingest
        .route("/sessions/init", post(sessions::init_session))
        .route("/sessions/{id}/init", post(sessions::init_session_legacy))
        .route("/sessions/observations", post(sessions::queue_observation))
        .route("/sessions/summarize", post(sessions::queue_summarize))
        .route("/sessions/{id}", delete(sessions::delete_session))
        // Queries
        .route("/observations", get(queries::observations_page))
        .route("/observations/batch", post(queries::observations_batch))
        .route("/summaries", get(queries::summaries_page))
        .route("/prompts", get(queries::prompts_page))
        .route("/search", get(queries::search))
        .route("/search/prompts", get(queries::search_prompts))
        .route("/timeline", get(queries::timeline))
        .route("/context", get(queries::context))
        .route("/projects", get(queries::projects))
        .route("/projects/diagnostics", get(queries::projects_diagnostics))
        // Settings / ops
        .route("/settings", get(settings_api::get_settings))
        .route("/settings", put(settings_api::put_settings))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/ollama/models", get(ollama::list_models))
        .route("/events", get(events_stream))
        // The viewer is a plain browser page on another origin
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(120)))
        .with_state(state)
}

/// Bind to loopback and serve until ctrl-c. Also runs the singleton lock
/// and the periodic processing-status broadcast.
pub async fn serve(settings: Settings) -> Result<()> {
    let data_dir = settings.data_dir.clone();
    let port = settings.worker_port;
    let host = settings.worker_host.clone();

    let _lock = crate::lockfile::WorkerLock::acquire(&data_dir, port)
        .context("another worker already owns this data directory")?;

    let state = build_state(settings)?;
    let scheduler = Arc::clone(&state.scheduler);

    // Resume any queued work left over from a previous run.
    scheduler.kick().await;

    spawn_status_broadcast(state.clone());

    let bind_addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "worker listening");

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl-c");
            info!("shutting down, cancelling agent tasks");
            scheduler.cancel_all();
        })
        .await?;

    Ok(())
}

/// Periodic `processing_status` SSE heartbeat.
fn spawn_status_broadcast(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let deps = state.deps.clone();
            let age_and_depth = crate::agent::with_db(&deps, |conn| {
                Ok((
                    queue::get_oldest_active_message_age_ms(conn, None)?,
                    queue::get_total_active_count(conn)?,
                ))
            })
            .await;

            match age_and_depth {
                Ok((oldest_pending_age_ms, queue_depth)) => {
                    state.events().send(SseEvent::ProcessingStatus {
                        oldest_pending_age_ms,
                        active_providers: vec![state.settings().provider.as_str().to_string()],
                        queue_depth,
                        active_sessions: state.scheduler.active_count(),
                    });
                }
                Err(e) => warn!(error = %e, "status broadcast skipped"),
            }
        }
    });
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "port": state.settings().worker_port,
        "uptime_s": state.started_at.elapsed().as_secs(),
    }))
}

async fn stats(State(state): State<AppState>) -> error::ApiResult<Json<serde_json::Value>> {
    let deps = state.deps.clone();
    let (sessions, prompts, observations, summaries, queue_depth, oldest_age, pending, db_size) =
        crate::agent::with_db(&deps, |conn| {
            let count = |table: &str| -> anyhow::Result<i64> {
                Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?)
            };
            let page_count: i64 = conn.pragma_query_value(None, "page_count", |r| r.get(0))?;
            let page_size: i64 = conn.pragma_query_value(None, "page_size", |r| r.get(0))?;
            Ok((
                count("sessions")?,
                count("user_prompts")?,
                count("observations")?,
                count("summaries")?,
                queue::get_total_active_count(conn)?,
                queue::get_oldest_active_message_age_ms(conn, None)?,
                queue::get_queue_messages(conn)?,
                page_count * page_size,
            ))
        })
        .await?;

    let deps = state.deps.clone();
    let prompt_vectors = crate::agent::with_db(&deps, |conn| {
        crate::memory::vector::count(conn, crate::memory::vector::VectorKind::Prompt)
    })
    .await
    .unwrap_or(0);

    let now = crate::memory::now_epoch_ms();
    let pending: Vec<serde_json::Value> = pending
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "sessionId": m.session_id,
                "type": m.payload.message_type().as_str(),
                "ageMs": (now - m.created_at_epoch).max(0),
            })
        })
        .collect();

    Ok(Json(json!({
        "sessions": sessions,
        "prompts": prompts,
        "observations": observations,
        "summaries": summaries,
        "queueDepth": queue_depth,
        "oldestPendingAgeMs": oldest_age,
        "activeSessions": state.scheduler.active_count(),
        "promptVectors": prompt_vectors,
        "dbSizeBytes": db_size,
        "pending": pending,
    })))
}

/// `GET /events`: the viewer's live feed.
async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<axum::response::sse::Event, std::convert::Infallible>>> {
    let rx = state.events().subscribe();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((Ok(event.to_sse()), rx)),
                // Lagged viewers skip dropped events and keep streaming
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
