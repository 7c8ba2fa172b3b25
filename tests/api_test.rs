mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use mnemo::config::MASK_SENTINEL;
use mnemo::server::events::SseEvent;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn private_prompt_is_skipped_not_stored() {
    let dir = tempfile::tempdir().unwrap();
    let state = helpers::test_state(dir.path());
    let mut events = state.events().subscribe();
    let app = mnemo::server::build_router(state.clone());

    let response = app
        .oneshot(post(
            "/sessions/init",
            serde_json::json!({
                "contentSessionId": "sess-private",
                "project": "demo",
                "prompt": "<private>secret</private>",
                "platform": "transcript",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["skipped"], true);
    assert_eq!(body["reason"], "private");

    // No prompt row was stored
    let prompt_count: i64 = {
        let conn = state.deps.db.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM user_prompts", [], |r| r.get(0))
            .unwrap()
    };
    assert_eq!(prompt_count, 0);

    // And no new_prompt broadcast
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, SseEvent::NewPrompt { .. }),
            "private prompt must not broadcast new_prompt"
        );
    }
}

#[tokio::test]
async fn observer_bootstrap_is_acknowledged_and_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let state = helpers::test_state(dir.path());
    let app = mnemo::server::build_router(state.clone());

    let init = app
        .clone()
        .oneshot(post(
            "/sessions/init",
            serde_json::json!({
                "contentSessionId": "sess-1",
                "project": "demo",
                "prompt": "hello",
                "platform": "transcript",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(init.status(), StatusCode::OK);

    let response = app
        .oneshot(post(
            "/sessions/observations",
            serde_json::json!({
                "contentSessionId": "sess-1",
                "tool_name": "Bash",
                "tool_response": "You are the memory observer for this session. Bootstrapping.",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "skipped");
    assert_eq!(body["reason"], "observer_bootstrap");

    let depth: i64 = {
        let conn = state.deps.db.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM pending_messages", [], |r| r.get(0))
            .unwrap()
    };
    assert_eq!(depth, 0);
}

#[tokio::test]
async fn normal_observation_queues_and_broadcasts_once() {
    let dir = tempfile::tempdir().unwrap();
    let state = helpers::test_state(dir.path());
    let app = mnemo::server::build_router(state.clone());

    app.clone()
        .oneshot(post(
            "/sessions/init",
            serde_json::json!({
                "contentSessionId": "sess-1",
                "project": "demo",
                "prompt": "hello",
                "platform": "transcript",
            }),
        ))
        .await
        .unwrap();

    let mut events = state.events().subscribe();
    let response = app
        .oneshot(post(
            "/sessions/observations",
            serde_json::json!({
                "contentSessionId": "sess-1",
                "tool_name": "Bash",
                "tool_response": "ran cargo test: 42 passed",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "queued");

    let mut queued_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SseEvent::ObservationQueued { .. }) {
            queued_events += 1;
        }
    }
    assert_eq!(queued_events, 1);
}

#[tokio::test]
async fn observation_for_unknown_session_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let state = helpers::test_state(dir.path());
    let app = mnemo::server::build_router(state);

    let response = app
        .oneshot(post(
            "/sessions/observations",
            serde_json::json!({
                "contentSessionId": "never-initialized",
                "tool_name": "Bash",
                "tool_response": "output",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn prompt_search_falls_back_to_relational_backend() {
    let dir = tempfile::tempdir().unwrap();
    let state = helpers::test_state(dir.path());
    {
        let conn = state.deps.db.lock().unwrap();
        helpers::seed_session(&conn, "sess-1", "codex-mem");
        mnemo::memory::sessions::append_user_prompt(
            &conn,
            "sess-1",
            "run the PLAYWRIGHT suite before merging",
        )
        .unwrap();
    }
    let app = mnemo::server::build_router(state);

    let response = app
        .oneshot(get(
            "/search/prompts?query=PLAYWRIGHT&project=codex-mem&limit=5",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["source"], "sqlite");
    assert_eq!(
        body["header"],
        "Found 1 user prompt(s) matching \"PLAYWRIGHT\""
    );
    assert_eq!(body["prompts"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn settings_read_masks_api_keys() {
    let dir = tempfile::tempdir().unwrap();
    let state = helpers::test_state(dir.path());
    std::fs::create_dir_all(dir.path()).unwrap();
    std::fs::write(
        &state.settings_path,
        serde_json::json!({"apiKey": "sk-abcdef123456", "model": "m1"}).to_string(),
    )
    .unwrap();
    let app = mnemo::server::build_router(state);

    let response = app.oneshot(get("/settings")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    let masked = body["apiKey"].as_str().unwrap();
    assert!(masked.starts_with(MASK_SENTINEL));
    assert!(masked.ends_with("3456"));
    assert!(!masked.contains("abcdef"));
    // Non-secret values pass through unmasked
    assert_eq!(body["model"], "m1");
}

#[tokio::test]
async fn settings_put_validates_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let state = helpers::test_state(dir.path());
    let app = mnemo::server::build_router(state.clone());

    // Out-of-range port is rejected
    let bad = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/settings")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"workerPort": 99999}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

    // A valid update lands on disk
    let ok = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/settings")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"model": "new-model"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let saved = std::fs::read_to_string(&state.settings_path).unwrap();
    assert!(saved.contains("new-model"));
}

#[tokio::test]
async fn health_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    let state = helpers::test_state(dir.path());
    let app = mnemo::server::build_router(state);

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn over_cap_enqueue_maps_to_429() {
    let dir = tempfile::tempdir().unwrap();
    let state = helpers::test_state(dir.path());
    // Fill the queue directly so the scheduler cannot drain it first
    {
        let conn = state.deps.db.lock().unwrap();
        let sid = helpers::seed_session(&conn, "sess-1", "demo");
        for i in 0..state.settings().queue_cap {
            mnemo::memory::queue::enqueue(
                &conn,
                sid,
                "sess-1",
                &helpers::obs_payload(&format!("t{i}")),
                state.settings().queue_cap,
            )
            .unwrap();
        }
    }
    let app = mnemo::server::build_router(state);

    let response = app
        .oneshot(post(
            "/sessions/observations",
            serde_json::json!({
                "contentSessionId": "sess-1",
                "tool_name": "Bash",
                "tool_response": "overflow",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
