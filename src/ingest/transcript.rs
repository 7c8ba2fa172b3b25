//! Transcript line parsing and record selection.
//!
//! Two on-disk JSON-lines formats are supported: legacy flat records
//! (`{session_id, ts, text}`) and structured session transcripts tagged
//! `session_meta` / `event_msg` / `response_item`. Malformed lines are
//! skipped, never fatal.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// One parsed transcript line, tagged by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptLine {
    SessionMeta {
        session_id: String,
        cwd: Option<String>,
    },
    UserMessage {
        text: String,
    },
    AgentMessage {
        text: String,
    },
    /// Assistant output item with a phase tag; `final_answer` items are
    /// preferred for summaries over commentary agent messages.
    ResponseItem {
        phase: Option<String>,
        text: String,
    },
    /// Legacy flat record.
    Flat {
        session_id: String,
        ts: i64,
        text: String,
    },
}

#[derive(Deserialize)]
struct TaggedLine {
    #[serde(rename = "type")]
    line_type: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Deserialize)]
struct FlatLine {
    session_id: String,
    #[serde(default)]
    ts: i64,
    text: String,
}

/// Parse a single line; `None` for blank or malformed input.
pub fn parse_line(line: &str) -> Option<TranscriptLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(tagged) = serde_json::from_str::<TaggedLine>(trimmed) {
        return parse_tagged(tagged);
    }
    if let Ok(flat) = serde_json::from_str::<FlatLine>(trimmed) {
        return Some(TranscriptLine::Flat {
            session_id: flat.session_id,
            ts: flat.ts,
            text: flat.text,
        });
    }
    None
}

fn parse_tagged(line: TaggedLine) -> Option<TranscriptLine> {
    match line.line_type.as_str() {
        "session_meta" => {
            let session_id = line.payload.get("id")?.as_str()?.to_string();
            let cwd = line
                .payload
                .get("cwd")
                .and_then(|v| v.as_str())
                .map(String::from);
            Some(TranscriptLine::SessionMeta { session_id, cwd })
        }
        "event_msg" => {
            let subtype = line.payload.get("type")?.as_str()?;
            let text = line
                .payload
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            match subtype {
                "user_message" => Some(TranscriptLine::UserMessage { text }),
                "agent_message" => Some(TranscriptLine::AgentMessage { text }),
                _ => None,
            }
        }
        "response_item" => {
            let payload = &line.payload;
            if payload.get("role").and_then(|v| v.as_str()) != Some("assistant") {
                return None;
            }
            let phase = payload
                .get("phase")
                .and_then(|v| v.as_str())
                .map(String::from);
            let text = payload
                .get("content")
                .and_then(|v| v.as_array())
                .map(|parts| {
                    parts
                        .iter()
                        .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("output_text"))
                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            Some(TranscriptLine::ResponseItem { phase, text })
        }
        _ => None,
    }
}

/// A record selected for ingestion: a user-visible text with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRecord {
    pub line_number: u64,
    pub session_id: String,
    pub cwd: Option<String>,
    pub ts: i64,
    pub text: String,
}

/// A parsed file: selectable records plus the material for summaries.
#[derive(Debug, Default)]
pub struct ParsedHistoryFile {
    pub records: Vec<IngestRecord>,
    /// Commentary agent messages per session, last one wins.
    pub last_agent_message: HashMap<String, String>,
    /// Final-answer response items per session, last one wins.
    pub last_final_answer: HashMap<String, String>,
    pub malformed_lines: u64,
}

/// Parse a whole file's contents. Line numbers are 1-based. Structured
/// files carry their session id in `session_meta`; records before any meta
/// line are attributed to the file-stem session id.
pub fn parse_history_file_contents(contents: &str, path: &Path) -> ParsedHistoryFile {
    let default_session = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".into());

    let mut parsed = ParsedHistoryFile::default();
    let mut current_session = default_session;
    let mut current_cwd: Option<String> = None;

    for (idx, raw) in contents.lines().enumerate() {
        let line_number = (idx + 1) as u64;
        if raw.trim().is_empty() {
            continue;
        }
        let Some(line) = parse_line(raw) else {
            parsed.malformed_lines += 1;
            continue;
        };

        match line {
            TranscriptLine::SessionMeta { session_id, cwd } => {
                current_session = session_id;
                current_cwd = cwd;
            }
            TranscriptLine::UserMessage { text } => {
                parsed.records.push(IngestRecord {
                    line_number,
                    session_id: current_session.clone(),
                    cwd: current_cwd.clone(),
                    ts: 0,
                    text,
                });
            }
            TranscriptLine::AgentMessage { text } => {
                if !text.trim().is_empty() {
                    parsed
                        .last_agent_message
                        .insert(current_session.clone(), text);
                }
            }
            TranscriptLine::ResponseItem { phase, text } => {
                if !text.trim().is_empty() && phase.as_deref() == Some("final_answer") {
                    parsed
                        .last_final_answer
                        .insert(current_session.clone(), text);
                }
            }
            TranscriptLine::Flat {
                session_id,
                ts,
                text,
            } => {
                parsed.records.push(IngestRecord {
                    line_number,
                    session_id,
                    cwd: None,
                    ts,
                    text,
                });
            }
        }
    }

    parsed
}

/// System/warning prefixes that are skipped unless `include_system` is set.
const SYSTEM_PREFIXES: &[&str] = &["⚠", "[experimental]"];

fn is_system_line(text: &str) -> bool {
    let trimmed = text.trim_start();
    SYSTEM_PREFIXES.iter().any(|p| trimmed.starts_with(p))
        || (trimmed.contains("MCP") && trimmed.contains("timed out"))
}

/// Selection options for [`select_records_for_ingestion`].
#[derive(Debug, Clone, Default)]
pub struct SelectionOptions {
    pub include_system: bool,
    pub since_ts: Option<i64>,
    /// Per-file checkpoint: only lines strictly greater are selected.
    pub after_line: u64,
    /// Global cap across the selection.
    pub limit: Option<usize>,
}

/// Apply the ingestibility rules: non-empty, non-system (unless asked),
/// newer than `since_ts`, past the checkpoint, sorted by line number, then
/// capped.
pub fn select_records_for_ingestion(
    records: &[IngestRecord],
    options: &SelectionOptions,
) -> Vec<IngestRecord> {
    let mut selected: Vec<IngestRecord> = records
        .iter()
        .filter(|r| !r.text.trim().is_empty())
        .filter(|r| options.include_system || !is_system_line(&r.text))
        .filter(|r| options.since_ts.map_or(true, |since| r.ts >= since))
        .filter(|r| r.line_number > options.after_line)
        .cloned()
        .collect();

    selected.sort_by_key(|r| r.line_number);
    if let Some(limit) = options.limit {
        selected.truncate(limit);
    }
    selected
}

/// Pick the summary text for a session: final-answer items win over
/// commentary, and the last user text is the fallback.
pub fn summary_text_for_session<'a>(
    parsed: &'a ParsedHistoryFile,
    session_id: &str,
    last_user_text: Option<&'a str>,
) -> Option<&'a str> {
    parsed
        .last_final_answer
        .get(session_id)
        .map(String::as_str)
        .or_else(|| parsed.last_agent_message.get(session_id).map(String::as_str))
        .or(last_user_text)
}
