//! Recognition and stripping of the two XML-like wrappers that appear in
//! stored text: the context-block wrapper (canonical `<session-context>`
//! and legacy `<mnemo-context>` spellings) and the `<private>` wrapper.
//!
//! Stripping is idempotent and bounded by [`MAX_TAGS_PER_PAYLOAD`] so a
//! pathological payload cannot turn regex work into a hot loop.

use once_cell::sync::Lazy;
use regex::Regex;

/// Upper bound on wrapper occurrences processed per payload.
pub const MAX_TAGS_PER_PAYLOAD: usize = 64;

static CONTEXT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<(session-context|mnemo-context)>.*?</(session-context|mnemo-context)>")
        .expect("context-block pattern compiles")
});

static PRIVATE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<private>.*?</private>").expect("private pattern compiles"));

/// Remove context-block wrappers (both spellings) from text, preserving
/// surrounding content.
pub fn strip_context_blocks(text: &str) -> String {
    strip_bounded(&CONTEXT_BLOCK, text)
}

/// Remove `<private>…</private>` spans from text, preserving surrounding
/// content.
pub fn strip_private_blocks(text: &str) -> String {
    strip_bounded(&PRIVATE_BLOCK, text)
}

/// Full ingest-side cleanup: context blocks, then private spans, trimmed.
pub fn sanitize_prompt(text: &str) -> String {
    let stripped = strip_private_blocks(&strip_context_blocks(text));
    stripped.trim().to_string()
}

/// True when a prompt carries no storable content: either empty after
/// stripping, or fully enclosed in a `<private>` wrapper.
pub fn is_fully_private(text: &str) -> bool {
    sanitize_prompt(text).is_empty()
}

fn strip_bounded(pattern: &Regex, text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (count, m) in pattern.find_iter(text).enumerate() {
        if count >= MAX_TAGS_PER_PAYLOAD {
            break;
        }
        out.push_str(&text[cursor..m.start()]);
        cursor = m.end();
    }
    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_both_context_spellings() {
        let text = "before <session-context>ctx</session-context> mid <mnemo-context>old</mnemo-context> after";
        assert_eq!(strip_context_blocks(text), "before  mid  after");
    }

    #[test]
    fn stripping_is_idempotent() {
        let text = "keep <private>secret</private> this";
        let once = strip_private_blocks(text);
        assert_eq!(once, "keep  this");
        assert_eq!(strip_private_blocks(&once), once);
    }

    #[test]
    fn fully_private_prompt_detected() {
        assert!(is_fully_private("<private>api key is hunter2</private>"));
        assert!(is_fully_private("   "));
        assert!(!is_fully_private("deploy <private>with the key</private> now"));
    }

    #[test]
    fn surrounding_text_preserved() {
        let text = "a <private>b</private> c";
        assert_eq!(sanitize_prompt(text), "a  c");
    }

    #[test]
    fn tag_count_is_bounded() {
        let payload = "<private>x</private>".repeat(MAX_TAGS_PER_PAYLOAD + 10);
        let stripped = strip_private_blocks(&payload);
        // The first MAX_TAGS_PER_PAYLOAD occurrences are removed; the tail survives
        assert_eq!(stripped.matches("<private>").count(), 10);
    }

    #[test]
    fn unclosed_tags_are_left_alone() {
        let text = "start <private>never closed";
        assert_eq!(strip_private_blocks(text), text);
    }
}
