mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mnemo::agent::conversation::Conversation;
use mnemo::agent::{
    run_session_with_providers, AgentDeps, ChatProvider, ProviderError, ProviderReply,
};
use mnemo::config::Settings;
use mnemo::memory::queue::enqueue;
use mnemo::server::events::EventSender;
use tokio::sync::watch;

/// A scripted provider: pops one canned result per call.
struct ScriptedProvider {
    name: &'static str,
    replies: Mutex<Vec<Result<String, ProviderError>>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(name: &'static str, replies: Vec<Result<String, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            replies: Mutex::new(replies),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn complete(&self, _conversation: &Conversation) -> Result<ProviderReply, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(ProviderError::Empty);
        }
        replies.remove(0).map(|text| ProviderReply {
            text,
            usage: None,
        })
    }
}

fn deps() -> AgentDeps {
    let conn = mnemo::db::open_in_memory().unwrap();
    AgentDeps {
        db: Arc::new(Mutex::new(conn)),
        settings: Arc::new(Settings::default()),
        events: EventSender::new(),
    }
}

const OBSERVATION_REPLY: &str = r#"
<observation>
<type>bugfix</type>
<title>Fixed the retry loop</title>
<fact>backoff now doubles</fact>
</observation>
"#;

const SUMMARY_REPLY: &str = r#"
<summary>
<request>fix retries</request>
<completed>backoff corrected</completed>
</summary>
"#;

#[tokio::test]
async fn session_drains_and_persists_with_original_timestamps() {
    let deps = deps();
    let sid = {
        let conn = deps.db.lock().unwrap();
        let sid = helpers::seed_session(&conn, "s1", "demo");
        enqueue(&conn, sid, "s1", &helpers::obs_payload("Bash"), 10).unwrap();
        enqueue(&conn, sid, "s1", &helpers::sum_payload(), 10).unwrap();
        // Backdate both messages to a known event time
        conn.execute(
            "UPDATE pending_messages SET created_at_epoch = 1700000000000",
            [],
        )
        .unwrap();
        sid
    };

    // Summarize claims first, then the observation
    let provider = ScriptedProvider::new(
        "scripted",
        vec![Ok(SUMMARY_REPLY.into()), Ok(OBSERVATION_REPLY.into())],
    );
    let (_tx, rx) = watch::channel(false);

    let outcome =
        run_session_with_providers(deps.clone(), sid, rx, provider.clone(), None)
            .await
            .unwrap();

    assert_eq!(outcome.messages_processed, 2);
    assert_eq!(outcome.observations_stored, 1);
    assert_eq!(outcome.summaries_stored, 1);

    let conn = deps.db.lock().unwrap();
    let (title, epoch): (String, i64) = conn
        .query_row(
            "SELECT title, created_at_epoch FROM observations",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(title, "Fixed the retry loop");
    // Original event time, not processing time
    assert_eq!(epoch, 1_700_000_000_000);

    let request: String = conn
        .query_row("SELECT request FROM summaries", [], |row| row.get(0))
        .unwrap();
    assert_eq!(request, "fix retries");

    // The queue is drained
    let depth: i64 = conn
        .query_row("SELECT COUNT(*) FROM pending_messages", [], |r| r.get(0))
        .unwrap();
    assert_eq!(depth, 0);

    // memory_session_id was minted and persisted
    let mem_id: Option<String> = conn
        .query_row("SELECT memory_session_id FROM sessions", [], |r| r.get(0))
        .unwrap();
    assert!(mem_id.is_some());
}

#[tokio::test]
async fn fallback_provider_replays_the_failed_message() {
    let deps = deps();
    let sid = {
        let conn = deps.db.lock().unwrap();
        let sid = helpers::seed_session(&conn, "s1", "demo");
        enqueue(&conn, sid, "s1", &helpers::obs_payload("Bash"), 10).unwrap();
        sid
    };

    let primary = ScriptedProvider::new(
        "primary",
        vec![Err(ProviderError::Upstream {
            status: 503,
            message: "unavailable".into(),
        })],
    );
    let fallback = ScriptedProvider::new("fallback", vec![Ok(OBSERVATION_REPLY.into())]);
    let (_tx, rx) = watch::channel(false);

    let outcome = run_session_with_providers(
        deps.clone(),
        sid,
        rx,
        primary.clone(),
        Some(fallback.clone() as Arc<dyn ChatProvider>),
    )
    .await
    .unwrap();

    assert_eq!(primary.calls(), 1);
    assert_eq!(fallback.calls(), 1);
    assert_eq!(outcome.observations_stored, 1);

    // The claimed message was not lost despite the primary failure
    let conn = deps.db.lock().unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM observations", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn permanent_error_does_not_fall_back() {
    let deps = deps();
    let sid = {
        let conn = deps.db.lock().unwrap();
        let sid = helpers::seed_session(&conn, "s1", "demo");
        enqueue(&conn, sid, "s1", &helpers::obs_payload("Bash"), 10).unwrap();
        sid
    };

    let primary = ScriptedProvider::new(
        "primary",
        vec![Err(ProviderError::Permanent {
            status: 401,
            message: "bad credentials".into(),
        })],
    );
    let fallback = ScriptedProvider::new("fallback", vec![Ok(OBSERVATION_REPLY.into())]);
    let (_tx, rx) = watch::channel(false);

    run_session_with_providers(
        deps.clone(),
        sid,
        rx,
        primary,
        Some(fallback.clone() as Arc<dyn ChatProvider>),
    )
    .await
    .unwrap();

    // Permanent failures surface without a fallback call
    assert_eq!(fallback.calls(), 0);
}

#[tokio::test]
async fn unparseable_observation_reply_synthesizes_fallback_record() {
    let deps = deps();
    let sid = {
        let conn = deps.db.lock().unwrap();
        let sid = helpers::seed_session(&conn, "s1", "demo");
        enqueue(&conn, sid, "s1", &helpers::obs_payload("Grep"), 10).unwrap();
        sid
    };

    let provider = ScriptedProvider::new("scripted", vec![Ok("nothing structured here".into())]);
    let (_tx, rx) = watch::channel(false);

    let outcome = run_session_with_providers(deps.clone(), sid, rx, provider, None)
        .await
        .unwrap();
    assert_eq!(outcome.observations_stored, 1);

    let conn = deps.db.lock().unwrap();
    let title: String = conn
        .query_row("SELECT title FROM observations", [], |r| r.get(0))
        .unwrap();
    // Memory is preserved as a synthetic record describing the raw event
    assert_eq!(title, "Tool event: Grep");
}

#[tokio::test]
async fn cancelled_session_commits_nothing_for_current_turn() {
    let deps = deps();
    let sid = {
        let conn = deps.db.lock().unwrap();
        let sid = helpers::seed_session(&conn, "s1", "demo");
        enqueue(&conn, sid, "s1", &helpers::obs_payload("Bash"), 10).unwrap();
        sid
    };

    let (tx, rx) = watch::channel(false);
    // Cancel before the loop claims anything
    tx.send(true).unwrap();

    let provider = ScriptedProvider::new("scripted", vec![Ok(OBSERVATION_REPLY.into())]);
    let outcome = run_session_with_providers(deps.clone(), sid, rx, provider.clone(), None)
        .await
        .unwrap();

    assert_eq!(outcome.messages_processed, 0);
    assert_eq!(provider.calls(), 0);

    let conn = deps.db.lock().unwrap();
    // Queue left intact for a later run
    let depth: i64 = conn
        .query_row("SELECT COUNT(*) FROM pending_messages", [], |r| r.get(0))
        .unwrap();
    assert_eq!(depth, 1);
}
