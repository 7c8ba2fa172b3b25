//! Core record and enum definitions.
//!
//! Defines [`ObservationType`] (the six distilled event categories),
//! [`Platform`] (where a session originated), [`PendingPayload`] (the tagged
//! queue message body), and the full record structs that mirror the tables
//! in `db::schema`.

use serde::{Deserialize, Serialize};

/// The six observation categories an agent may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationType {
    /// Something learned about the codebase or its behavior.
    Discovery,
    /// A defect found and corrected.
    Bugfix,
    /// New functionality added.
    Feature,
    /// Restructuring without behavior change.
    Refactor,
    /// A design or direction decision.
    Decision,
    /// Any other concrete modification.
    Change,
}

impl ObservationType {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Bugfix => "bugfix",
            Self::Feature => "feature",
            Self::Refactor => "refactor",
            Self::Decision => "decision",
            Self::Change => "change",
        }
    }

    /// All variants, in display order.
    pub fn all() -> &'static [ObservationType] {
        &[
            Self::Discovery,
            Self::Bugfix,
            Self::Feature,
            Self::Refactor,
            Self::Decision,
            Self::Change,
        ]
    }
}

impl std::fmt::Display for ObservationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObservationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovery" => Ok(Self::Discovery),
            "bugfix" => Ok(Self::Bugfix),
            "feature" => Ok(Self::Feature),
            "refactor" => Ok(Self::Refactor),
            "decision" => Ok(Self::Decision),
            "change" => Ok(Self::Change),
            _ => Err(format!("unknown observation type: {s}")),
        }
    }
}

/// Where a session originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    /// Live session in the hosted coding agent (hook-driven ingest).
    HostedAgent,
    /// Replayed from an on-disk transcript file.
    Transcript,
    /// Cursor-style editor integration.
    Cursor,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostedAgent => "hosted-agent",
            Self::Transcript => "transcript",
            Self::Cursor => "cursor",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hosted-agent" => Ok(Self::HostedAgent),
            "transcript" => Ok(Self::Transcript),
            "cursor" => Ok(Self::Cursor),
            _ => Err(format!("unknown platform: {s}")),
        }
    }
}

/// Queue message priority: summarize always drains before observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Summarize,
    Observation,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summarize => "summarize",
            Self::Observation => "observation",
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summarize" => Ok(Self::Summarize),
            "observation" => Ok(Self::Observation),
            _ => Err(format!("unknown message type: {s}")),
        }
    }
}

/// Body of a queued message. Stored as tagged JSON in `pending_messages.payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingPayload {
    /// A raw tool-use event awaiting distillation.
    Observation {
        tool_name: String,
        #[serde(default)]
        tool_input: serde_json::Value,
        tool_response: String,
        #[serde(default)]
        cwd: Option<String>,
    },
    /// An end-of-turn signal carrying the last assistant transcript message.
    Summarize {
        #[serde(default)]
        last_assistant_message: Option<String>,
    },
}

impl PendingPayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Observation { .. } => MessageType::Observation,
            Self::Summarize { .. } => MessageType::Summarize,
        }
    }
}

/// A session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Monotonic database id.
    pub id: i64,
    /// Opaque upstream session identifier; unique.
    pub content_session_id: String,
    pub platform: Platform,
    pub project: String,
    pub initial_prompt: Option<String>,
    /// LLM-conversation id; minted by the agent on first turn, then stable.
    pub memory_session_id: Option<String>,
    pub created_at_epoch: i64,
    pub updated_at_epoch: i64,
}

/// A stored user prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPromptRecord {
    pub id: i64,
    pub content_session_id: String,
    pub prompt_number: i64,
    pub prompt_text: String,
    pub created_at_epoch: i64,
}

/// A claimed queue message, as returned by `claim_and_delete`.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub id: i64,
    pub session_id: i64,
    pub content_session_id: String,
    pub payload: PendingPayload,
    pub created_at_epoch: i64,
}

/// A fully distilled observation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub id: i64,
    pub session_id: i64,
    pub memory_session_id: String,
    pub project: String,
    #[serde(rename = "type")]
    pub observation_type: ObservationType,
    pub title: String,
    pub subtitle: String,
    pub narrative: String,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub tokens_used: i64,
    pub cwd: Option<String>,
    /// Original event time, not agent-processing time.
    pub created_at_epoch: i64,
}

/// A parsed observation before persistence (no ids assigned yet).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationDraft {
    #[serde(rename = "type")]
    pub observation_type: Option<ObservationType>,
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub narrative: String,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub files_read: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub tokens_used: i64,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// A per-session end-of-turn summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub id: i64,
    pub session_id: i64,
    pub memory_session_id: String,
    pub project: String,
    pub request: String,
    pub investigated: String,
    pub learned: String,
    pub completed: String,
    pub next_steps: String,
    pub notes: String,
    pub created_at_epoch: i64,
}

/// A parsed summary before persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryDraft {
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub investigated: String,
    #[serde(default)]
    pub learned: String,
    #[serde(default)]
    pub completed: String,
    #[serde(default)]
    pub next_steps: String,
    #[serde(default)]
    pub notes: String,
}

impl SummaryDraft {
    /// True when every field is empty (nothing parseable in the reply).
    pub fn is_empty(&self) -> bool {
        self.request.is_empty()
            && self.investigated.is_empty()
            && self.learned.is_empty()
            && self.completed.is_empty()
            && self.next_steps.is_empty()
            && self.notes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_type_round_trips() {
        for ty in ObservationType::all() {
            let parsed: ObservationType = ty.as_str().parse().unwrap();
            assert_eq!(parsed, *ty);
        }
        assert!("sidequest".parse::<ObservationType>().is_err());
    }

    #[test]
    fn pending_payload_tagged_json() {
        let payload = PendingPayload::Observation {
            tool_name: "Bash".into(),
            tool_input: serde_json::json!({"command": "ls"}),
            tool_response: "src tests".into(),
            cwd: Some("/work/demo".into()),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"kind\":\"observation\""));
        let back: PendingPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn summarize_payload_tolerates_missing_message() {
        let back: PendingPayload = serde_json::from_str(r#"{"kind":"summarize"}"#).unwrap();
        assert_eq!(
            back,
            PendingPayload::Summarize {
                last_assistant_message: None
            }
        );
    }
}
