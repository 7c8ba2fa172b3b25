#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use mnemo::agent::AgentDeps;
use mnemo::config::{FallbackPolicy, ProviderKind, Settings};
use mnemo::memory::sessions::create_or_get_session;
use mnemo::memory::types::{ObservationDraft, ObservationType, PendingPayload, Platform};
use mnemo::query::QueryEngine;
use mnemo::scheduler::Scheduler;
use mnemo::server::events::EventSender;
use mnemo::server::AppState;
use rusqlite::Connection;

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    mnemo::db::open_in_memory().unwrap()
}

/// Settings that never reach a network or a real binary: unreachable local
/// daemon, fallback disabled.
pub fn test_settings(data_dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.provider = ProviderKind::Local;
    settings.base_url = "http://127.0.0.1:1".into();
    settings.fallback_policy = FallbackPolicy::Off;
    settings.cli_binary = String::new();
    settings.data_dir = data_dir.to_path_buf();
    settings.timeout_ms = 200;
    settings
}

/// Build a full AppState over an in-memory database.
pub fn test_state(data_dir: &std::path::Path) -> AppState {
    let db = Arc::new(Mutex::new(test_db()));
    let settings = Arc::new(test_settings(data_dir));
    let deps = AgentDeps {
        db: Arc::clone(&db),
        settings: Arc::clone(&settings),
        events: EventSender::new(),
    };
    let scheduler = Scheduler::new(deps.clone(), settings.max_concurrent_sessions);
    let query = Arc::new(QueryEngine::new(db, None));

    AppState {
        deps,
        scheduler,
        query,
        embedder: None,
        settings_path: Settings::settings_path(data_dir),
        transcript_root: None,
        started_at: std::time::Instant::now(),
    }
}

/// Create a session and return its db id.
pub fn seed_session(conn: &Connection, content_session_id: &str, project: &str) -> i64 {
    create_or_get_session(conn, content_session_id, project, None, Platform::HostedAgent)
        .unwrap()
        .id
}

/// A queue payload for a tool event.
pub fn obs_payload(tool: &str) -> PendingPayload {
    PendingPayload::Observation {
        tool_name: tool.into(),
        tool_input: serde_json::Value::Null,
        tool_response: format!("{tool} output"),
        cwd: None,
    }
}

/// A queue payload for an end-of-turn summary.
pub fn sum_payload() -> PendingPayload {
    PendingPayload::Summarize {
        last_assistant_message: Some("all done".into()),
    }
}

/// An observation draft with the given title.
pub fn draft(title: &str, ty: ObservationType) -> ObservationDraft {
    ObservationDraft {
        observation_type: Some(ty),
        title: title.into(),
        ..Default::default()
    }
}
