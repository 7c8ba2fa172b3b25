//! SSE event fan-out.
//!
//! Events are broadcast on a tokio channel; each `/events` subscriber gets
//! its own receiver. Per session, events are sent in the order their
//! triggering writes committed.

use axum::response::sse::Event;
use serde::Serialize;
use tokio::sync::broadcast;

/// Broadcast capacity; slow viewers drop old events rather than blocking
/// writers.
const CHANNEL_CAPACITY: usize = 256;

/// One event on the `/events` stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SseEvent {
    NewPrompt {
        content_session_id: String,
        prompt_number: i64,
        project: String,
    },
    SessionStarted {
        session_id: i64,
        content_session_id: String,
        project: String,
    },
    ObservationQueued {
        session_id: i64,
        content_session_id: String,
        tool_name: String,
    },
    SummarizeQueued {
        session_id: i64,
        content_session_id: String,
    },
    SessionCompleted {
        session_id: i64,
        content_session_id: String,
    },
    ProcessingStatus {
        oldest_pending_age_ms: Option<i64>,
        active_providers: Vec<String>,
        queue_depth: i64,
        active_sessions: usize,
    },
}

impl SseEvent {
    pub fn session_completed(session_id: i64, content_session_id: &str) -> Self {
        Self::SessionCompleted {
            session_id,
            content_session_id: content_session_id.to_string(),
        }
    }

    /// Event-type string carried in the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewPrompt { .. } => "new_prompt",
            Self::SessionStarted { .. } => "session_started",
            Self::ObservationQueued { .. } => "observation_queued",
            Self::SummarizeQueued { .. } => "summarize_queued",
            Self::SessionCompleted { .. } => "session_completed",
            Self::ProcessingStatus { .. } => "processing_status",
        }
    }

    pub fn to_sse(&self) -> Event {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".into());
        Event::default().event(self.kind()).data(data)
    }
}

/// Cheap clonable sender handle shared across handlers and agent tasks.
#[derive(Clone)]
pub struct EventSender {
    tx: broadcast::Sender<SseEvent>,
}

impl EventSender {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Fire-and-forget; an event with no subscribers is fine.
    pub fn send(&self, event: SseEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SseEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_matches_wire_names() {
        let e = SseEvent::NewPrompt {
            content_session_id: "s".into(),
            prompt_number: 1,
            project: "p".into(),
        };
        assert_eq!(e.kind(), "new_prompt");
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"type\":\"new_prompt\""));
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let sender = EventSender::new();
        let mut rx = sender.subscribe();

        sender.send(SseEvent::session_completed(1, "a"));
        sender.send(SseEvent::session_completed(2, "b"));

        match rx.recv().await.unwrap() {
            SseEvent::SessionCompleted { session_id, .. } => assert_eq!(session_id, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            SseEvent::SessionCompleted { session_id, .. } => assert_eq!(session_id, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn send_without_subscribers_is_fine() {
        let sender = EventSender::new();
        sender.send(SseEvent::session_completed(1, "a"));
    }
}
