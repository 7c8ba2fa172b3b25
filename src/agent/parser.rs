//! Parsing of XML-tagged provider responses into observation and summary
//! drafts.
//!
//! The contract is forgiving: missing fields default, malformed blocks are
//! skipped with a warning, and an unstructured summarize reply is converted
//! into a usable fallback summary rather than failing the turn.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::memory::types::{ObservationDraft, SummaryDraft};

static OBSERVATION_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<observation>(.*?)</observation>").expect("observation pattern compiles")
});

static SUMMARY_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<summary>(.*?)</summary>").expect("summary pattern compiles"));

/// Everything extracted from one assistant reply.
#[derive(Debug, Default)]
pub struct ParsedReply {
    pub observations: Vec<ObservationDraft>,
    pub summary: Option<SummaryDraft>,
    /// Count of blocks dropped as malformed.
    pub skipped_blocks: usize,
}

impl ParsedReply {
    /// A turn counts as productive when at least one well-formed block came out.
    pub fn is_productive(&self) -> bool {
        !self.observations.is_empty() || self.summary.is_some()
    }
}

/// Parse an assistant reply for observation and summary blocks.
pub fn parse_reply(text: &str) -> ParsedReply {
    let mut parsed = ParsedReply::default();

    for cap in OBSERVATION_BLOCK.captures_iter(text) {
        let body = &cap[1];
        match parse_observation_block(body) {
            Some(draft) => parsed.observations.push(draft),
            None => {
                parsed.skipped_blocks += 1;
                warn!(block = %truncate(body, 120), "skipping malformed observation block");
            }
        }
    }

    if let Some(cap) = SUMMARY_BLOCK.captures(text) {
        let draft = parse_summary_block(&cap[1]);
        if draft.is_empty() {
            parsed.skipped_blocks += 1;
            warn!("skipping empty summary block");
        } else {
            parsed.summary = Some(draft);
        }
    }

    parsed
}

/// A block is well-formed when it has a non-empty title; everything else
/// defaults.
fn parse_observation_block(body: &str) -> Option<ObservationDraft> {
    let title = tag_value(body, "title")?;
    if title.trim().is_empty() {
        return None;
    }

    let observation_type = tag_value(body, "type").and_then(|t| t.trim().parse().ok());

    Some(ObservationDraft {
        observation_type,
        title: title.trim().to_string(),
        subtitle: tag_value(body, "subtitle").unwrap_or_default().trim().into(),
        narrative: tag_value(body, "narrative").unwrap_or_default().trim().into(),
        facts: tag_values(body, "fact"),
        concepts: tag_values(body, "concept"),
        files_read: tag_values(body, "file_read"),
        files_modified: tag_values(body, "file_modified"),
        tokens_used: 0,
        cwd: None,
    })
}

fn parse_summary_block(body: &str) -> SummaryDraft {
    SummaryDraft {
        request: tag_value(body, "request").unwrap_or_default().trim().into(),
        investigated: tag_value(body, "investigated").unwrap_or_default().trim().into(),
        learned: tag_value(body, "learned").unwrap_or_default().trim().into(),
        completed: tag_value(body, "completed").unwrap_or_default().trim().into(),
        next_steps: tag_value(body, "next_steps").unwrap_or_default().trim().into(),
        notes: tag_value(body, "notes").unwrap_or_default().trim().into(),
    }
}

/// Synthesize a summary from an unstructured summarize reply so the turn is
/// preserved instead of lost: the original request plus the raw text.
pub fn fallback_summary(initial_prompt: Option<&str>, raw_reply: &str) -> SummaryDraft {
    SummaryDraft {
        request: initial_prompt.unwrap_or_default().trim().to_string(),
        notes: truncate(raw_reply.trim(), 2000),
        ..Default::default()
    }
}

/// Token usage as reported (or estimated) for one provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: i64,
    pub output: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.input + self.output
    }
}

/// Split a bare total into input/output using the 70/30 accounting
/// heuristic for providers that report only a combined count.
pub fn split_token_usage(total: i64) -> TokenUsage {
    let input = total * 70 / 100;
    TokenUsage {
        input,
        output: total - input,
    }
}

fn tag_value(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}

fn tag_values(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut values = Vec::new();
    let mut cursor = 0;
    while let Some(rel) = body[cursor..].find(&open) {
        let start = cursor + rel + open.len();
        let Some(end_rel) = body[start..].find(&close) else {
            break;
        };
        let end = start + end_rel;
        let value = body[start..end].trim();
        if !value.is_empty() {
            values.push(value.to_string());
        }
        cursor = end + close.len();
    }
    values
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}
