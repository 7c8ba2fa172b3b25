//! The provider-polymorphic agent: consumes queued messages for one session,
//! calls an LLM with a growing conversation, parses the XML-tagged reply,
//! and persists observations and summaries.
//!
//! Fallback is explicit composition: when the primary provider fails with a
//! fallback-eligible error, the same session (same conversation history) is
//! handed to the alternate provider, which replays the claimed backlog
//! before new work.

pub mod cli;
pub mod conversation;
pub mod hosted;
pub mod limiter;
pub mod local;
pub mod mode;
pub mod parser;
pub mod prompts;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{FallbackPolicy, ProviderKind, Settings};
use crate::memory::types::{ObservationDraft, ObservationType, PendingMessage, PendingPayload};
use crate::memory::{observations, queue, sessions};
use crate::server::events::{EventSender, SseEvent};
use conversation::Conversation;
use parser::TokenUsage;

/// Failure taxonomy for provider calls (spec'd retry/fallback behavior
/// keys off these variants).
#[derive(Debug)]
pub enum ProviderError {
    /// 429 — retry with backoff, then fall back.
    RateLimited,
    /// 5xx — transient upstream failure.
    Upstream { status: u16, message: String },
    /// Connection-level failure.
    Network(String),
    /// Per-request timeout elapsed.
    Timeout,
    /// The provider returned no usable text.
    Empty,
    /// Model rejected by the provider (handled inside the hosted provider
    /// by retrying its named fallback model once; surfaced if that fails too).
    BadModel { model: String },
    /// 4xx other than 429, malformed credentials — never retried.
    Permanent { status: u16, message: String },
    /// Misconfiguration detected before any request was made.
    Invalid(String),
}

impl ProviderError {
    /// Errors that justify handing the session to the fallback provider.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::Upstream { .. }
                | Self::Network(_)
                | Self::Timeout
                | Self::Empty
        )
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate limited"),
            Self::Upstream { status, message } => write!(f, "upstream {status}: {message}"),
            Self::Network(e) => write!(f, "network error: {e}"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Empty => write!(f, "empty response"),
            Self::BadModel { model } => write!(f, "model not available: {model}"),
            Self::Permanent { status, message } => write!(f, "permanent {status}: {message}"),
            Self::Invalid(e) => write!(f, "invalid provider configuration: {e}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// One completed provider call.
#[derive(Debug)]
pub struct ProviderReply {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// The uniform provider contract. Implementations: [`hosted::HostedProvider`],
/// [`local::LocalProvider`], [`cli::CliProvider`].
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Complete the conversation; the final turn is the pending user turn.
    async fn complete(&self, conversation: &Conversation) -> Result<ProviderReply, ProviderError>;
}

/// Build the primary provider from settings.
pub fn build_provider(settings: &Settings) -> Result<Arc<dyn ChatProvider>, ProviderError> {
    match settings.provider {
        ProviderKind::Hosted => Ok(Arc::new(hosted::HostedProvider::from_settings(settings)?)),
        ProviderKind::Local => Ok(Arc::new(local::LocalProvider::from_settings(settings)?)),
        ProviderKind::Cli => Ok(Arc::new(cli::CliProvider::from_settings(settings))),
    }
}

/// Build the fallback provider selected by policy, if any. `auto` prefers
/// the CLI provider when a binary is configured, else hosted.
pub fn build_fallback(settings: &Settings) -> Option<Arc<dyn ChatProvider>> {
    let kind = match settings.fallback_policy {
        FallbackPolicy::Off => return None,
        FallbackPolicy::Cli => ProviderKind::Cli,
        FallbackPolicy::Hosted => ProviderKind::Hosted,
        FallbackPolicy::Auto => {
            if !settings.cli_binary.is_empty() {
                ProviderKind::Cli
            } else {
                ProviderKind::Hosted
            }
        }
    };
    if kind == settings.provider {
        return None;
    }
    let mut alt = settings.clone();
    alt.provider = kind;
    build_provider(&alt).ok()
}

/// Everything a session agent task needs.
#[derive(Clone)]
pub struct AgentDeps {
    pub db: Arc<Mutex<Connection>>,
    pub settings: Arc<Settings>,
    pub events: EventSender,
}

/// Outcome of one drained session.
#[derive(Debug, Default)]
pub struct SessionOutcome {
    pub messages_processed: usize,
    pub observations_stored: usize,
    pub summaries_stored: usize,
}

/// Run the agent loop for one session until its queue drains or the task is
/// cancelled. This is the entry point the scheduler spawns; providers come
/// from settings.
pub async fn run_session(
    deps: AgentDeps,
    session_id: i64,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<SessionOutcome> {
    let primary = build_provider(&deps.settings)
        .map_err(|e| anyhow::anyhow!("cannot build provider: {e}"))?;
    let fallback = build_fallback(&deps.settings);
    run_session_with_providers(deps, session_id, cancel, primary, fallback).await
}

/// The loop itself, with explicit providers (tests inject scripted ones).
pub async fn run_session_with_providers(
    deps: AgentDeps,
    session_id: i64,
    mut cancel: watch::Receiver<bool>,
    primary: Arc<dyn ChatProvider>,
    fallback: Option<Arc<dyn ChatProvider>>,
) -> anyhow::Result<SessionOutcome> {
    let session = with_db(&deps, move |conn| sessions::get_session(conn, session_id)).await?;
    let Some(session) = session else {
        anyhow::bail!("unknown session {session_id}");
    };

    // Mint the memory session id on first contact; deterministic so a crashed
    // first turn mints the same id on retry. An already-assigned id wins.
    let minted = uuid::Uuid::new_v5(
        &uuid::Uuid::NAMESPACE_OID,
        session.content_session_id.as_bytes(),
    )
    .to_string();
    let memory_session_id = with_db(&deps, move |conn| {
        sessions::assign_memory_session_id(conn, session_id, &minted)
    })
    .await?;

    let mode = mode::resolve_mode(&deps.settings.mode);

    let mut conversation = Conversation::new();
    conversation.push_user(prompts::build_init_prompt(
        &mode,
        &session.project,
        &session.content_session_id,
        session.initial_prompt.as_deref(),
    ));

    let mut outcome = SessionOutcome::default();
    let mut active: Arc<dyn ChatProvider> = primary;
    let mut fallback = fallback;

    loop {
        if *cancel.borrow() {
            info!(session_id, "agent cancelled, leaving queue intact");
            return Ok(outcome);
        }

        let claimed =
            with_db(&deps, move |conn| queue::claim_and_delete(conn, session_id)).await?;
        let Some(message) = claimed else {
            // Drained. Re-check atomically before surrendering the slot: an
            // enqueue may have raced the previous claim.
            let depth =
                with_db(&deps, move |conn| queue::get_session_depth(conn, session_id)).await?;
            if depth == 0 {
                break;
            }
            continue;
        };

        let result = process_message(
            &deps,
            &mode,
            &session.project,
            session.initial_prompt.as_deref(),
            &memory_session_id,
            &mut conversation,
            active.as_ref(),
            &message,
            &mut cancel,
        )
        .await;

        match result {
            Ok(TurnResult::Stored {
                observations: o,
                summary,
            }) => {
                outcome.messages_processed += 1;
                outcome.observations_stored += o;
                if summary {
                    outcome.summaries_stored += 1;
                }
            }
            Ok(TurnResult::Cancelled) => {
                info!(session_id, "agent cancelled mid-turn, nothing committed");
                return Ok(outcome);
            }
            Err(e) if e.is_fallback_eligible() && fallback.is_some() => {
                let next = fallback.take().expect("checked is_some");
                warn!(
                    session_id,
                    from = active.name(),
                    to = next.name(),
                    error = %e,
                    "provider failed, handing session to fallback"
                );
                // Replay the claimed message through the new provider before
                // any new claims; the conversation history travels with it.
                conversation.pop_unanswered_user();
                active = next;
                match process_message(
                    &deps,
                    &mode,
                    &session.project,
                    session.initial_prompt.as_deref(),
                    &memory_session_id,
                    &mut conversation,
                    active.as_ref(),
                    &message,
                    &mut cancel,
                )
                .await
                {
                    Ok(TurnResult::Stored {
                        observations: o,
                        summary,
                    }) => {
                        outcome.messages_processed += 1;
                        outcome.observations_stored += o;
                        if summary {
                            outcome.summaries_stored += 1;
                        }
                    }
                    Ok(TurnResult::Cancelled) => return Ok(outcome),
                    Err(e2) => {
                        warn!(session_id, error = %e2, "fallback provider also failed; message lost");
                        conversation.pop_unanswered_user();
                        outcome.messages_processed += 1;
                    }
                }
            }
            Err(e) => {
                // A single bad message never kills the session: log, count,
                // continue with the next claim.
                warn!(session_id, error = %e, "turn failed; continuing");
                conversation.pop_unanswered_user();
                outcome.messages_processed += 1;
            }
        }
    }

    deps.events.send(SseEvent::session_completed(
        session_id,
        &session.content_session_id,
    ));
    info!(
        session_id,
        processed = outcome.messages_processed,
        observations = outcome.observations_stored,
        "session drained"
    );
    Ok(outcome)
}

enum TurnResult {
    Stored { observations: usize, summary: bool },
    Cancelled,
}

/// Process one claimed message end-to-end. Persists nothing on cancellation.
#[allow(clippy::too_many_arguments)]
async fn process_message(
    deps: &AgentDeps,
    mode: &mode::Mode,
    project: &str,
    initial_prompt: Option<&str>,
    memory_session_id: &str,
    conversation: &mut Conversation,
    provider: &dyn ChatProvider,
    message: &PendingMessage,
    cancel: &mut watch::Receiver<bool>,
) -> Result<TurnResult, ProviderError> {
    let is_summarize = matches!(message.payload, PendingPayload::Summarize { .. });

    let prompt = match &message.payload {
        PendingPayload::Observation {
            tool_name,
            tool_input,
            tool_response,
            cwd,
        } => prompts::build_observation_prompt(
            mode,
            tool_name,
            tool_input,
            tool_response,
            cwd.as_deref(),
            message.created_at_epoch,
        ),
        PendingPayload::Summarize {
            last_assistant_message,
        } => prompts::build_summary_prompt(mode, last_assistant_message.as_deref()),
    };

    conversation.push_user(prompt);

    let completion = tokio::select! {
        r = provider.complete(conversation) => Some(r),
        _ = cancel.changed() => None,
    };
    let Some(completion) = completion else {
        conversation.pop_unanswered_user();
        return Ok(TurnResult::Cancelled);
    };
    let reply = completion?;

    conversation.push_assistant(reply.text.clone());

    let mut parsed = parser::parse_reply(&reply.text);
    let tokens = reply.usage.map(|u| u.total()).unwrap_or(0);
    for obs in &mut parsed.observations {
        obs.tokens_used = tokens;
        if let PendingPayload::Observation { cwd, .. } = &message.payload {
            obs.cwd = cwd.clone();
        }
        // Clamp types the active mode does not allow
        if let Some(ty) = obs.observation_type {
            if !mode.allows(ty) {
                obs.observation_type = Some(ObservationType::Discovery);
            }
        }
    }

    if is_summarize && parsed.summary.is_none() {
        // Unstructured summarize reply: synthesize rather than fail.
        parsed.summary = Some(parser::fallback_summary(initial_prompt, &reply.text));
    }

    if !is_summarize && !parsed.is_productive() {
        // parse-empty: keep the raw event as a synthetic observation so
        // memory is never lost.
        if let PendingPayload::Observation {
            tool_name,
            tool_response,
            cwd,
            ..
        } = &message.payload
        {
            parsed.observations.push(ObservationDraft {
                observation_type: Some(ObservationType::Discovery),
                title: format!("Tool event: {tool_name}"),
                narrative: tool_response.chars().take(1000).collect(),
                tokens_used: tokens,
                cwd: cwd.clone(),
                ..Default::default()
            });
            debug!(tool = %tool_name, "synthesized fallback observation for unparsed reply");
        }
    }

    if *cancel.borrow() {
        return Ok(TurnResult::Cancelled);
    }

    let drafts = parsed.observations;
    let summary = parsed.summary;
    let stored_observations = drafts.len();
    let stored_summary = summary.is_some();
    let event_epoch = message.created_at_epoch;
    let memory_session_id = memory_session_id.to_string();
    let project = project.to_string();
    let session_id = message.session_id;

    with_db(deps, move |conn| {
        observations::store_observations(
            conn,
            session_id,
            &memory_session_id,
            &project,
            &drafts,
            summary.as_ref(),
            Some(event_epoch),
        )
    })
    .await
    .map_err(|e| ProviderError::Invalid(format!("store failed: {e}")))?;

    Ok(TurnResult::Stored {
        observations: stored_observations,
        summary: stored_summary,
    })
}

/// Run a synchronous store operation on the blocking pool. The connection
/// mutex is never held across an await point.
pub async fn with_db<T, F>(deps: &AgentDeps, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
{
    let db = Arc::clone(&deps.db);
    tokio::task::spawn_blocking(move || {
        let mut conn = db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
        f(&mut conn)
    })
    .await
    .map_err(|e| anyhow::anyhow!("db task failed: {e}"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_eligibility_follows_taxonomy() {
        assert!(ProviderError::RateLimited.is_fallback_eligible());
        assert!(ProviderError::Timeout.is_fallback_eligible());
        assert!(ProviderError::Empty.is_fallback_eligible());
        assert!(ProviderError::Upstream {
            status: 503,
            message: String::new()
        }
        .is_fallback_eligible());
        assert!(!ProviderError::Permanent {
            status: 401,
            message: String::new()
        }
        .is_fallback_eligible());
        assert!(!ProviderError::Invalid("bad".into()).is_fallback_eligible());
    }

    #[test]
    fn auto_policy_prefers_cli_when_binary_configured() {
        let mut settings = Settings::default();
        settings.provider = ProviderKind::Local;
        settings.fallback_policy = FallbackPolicy::Auto;
        settings.api_key = Some("sk-test".into());
        settings.cli_binary = "codex".into();
        let fb = build_fallback(&settings).expect("fallback expected");
        assert_eq!(fb.name(), "cli");

        settings.cli_binary = String::new();
        let fb = build_fallback(&settings).expect("fallback expected");
        assert_eq!(fb.name(), "hosted");
    }

    #[test]
    fn off_policy_disables_fallback() {
        let mut settings = Settings::default();
        settings.fallback_policy = FallbackPolicy::Off;
        assert!(build_fallback(&settings).is_none());
    }

    #[test]
    fn fallback_never_duplicates_primary() {
        let mut settings = Settings::default();
        settings.provider = ProviderKind::Cli;
        settings.fallback_policy = FallbackPolicy::Cli;
        assert!(build_fallback(&settings).is_none());
    }
}
