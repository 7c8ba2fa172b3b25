//! The typed store: every read and write of mnemo's durable state goes
//! through this module. The queue table lives here too so crash recovery
//! resumes in-flight work from the same database.

pub mod observations;
pub mod queue;
pub mod search;
pub mod sessions;
pub mod timeline;
pub mod types;
pub mod vector;

/// Current wall-clock time as epoch milliseconds — the canonical stored unit.
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Serialize a string list for a JSON-array column.
pub(crate) fn to_json_column(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".into())
}

/// Deserialize a JSON-array column, tolerating junk.
pub(crate) fn from_json_column(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Escape a user query for FTS5 MATCH syntax.
///
/// Wraps each whitespace-delimited word in double quotes and joins with
/// spaces so FTS5 treats them as individual terms (implicit AND).
pub(crate) fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| {
            let clean = word.replace('"', "");
            format!("\"{clean}\"")
        })
        .filter(|w| w != "\"\"")
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_column_round_trip() {
        let items = vec!["a".to_string(), "b c".to_string()];
        assert_eq!(from_json_column(&to_json_column(&items)), items);
        assert!(from_json_column("not json").is_empty());
    }

    #[test]
    fn escape_fts_query_quotes_terms() {
        assert_eq!(escape_fts_query("hello world"), "\"hello\" \"world\"");
        assert_eq!(escape_fts_query("a \"b\" c"), "\"a\" \"b\" \"c\"");
        assert_eq!(escape_fts_query("  "), "");
    }
}
