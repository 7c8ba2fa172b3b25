//! The transcript ingestion engine: reads JSON-lines history files
//! incrementally and replays them into the worker over its HTTP API.
//!
//! Files process in mtime order, oldest first. The per-file checkpoint
//! advances only after a record's POST succeeds, so a failed run re-does
//! exactly the unfinished work (idempotent re-run).

pub mod checkpoint;
pub mod discover;
pub mod retry;
pub mod transcript;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use checkpoint::IngestState;
use discover::project_name_from_cwd;
use retry::{post_json_with_retry, RetryPolicy};
use transcript::{
    parse_history_file_contents, select_records_for_ingestion, summary_text_for_session,
    IngestRecord, SelectionOptions,
};

/// Session-id prefix applied to transcript-sourced sessions.
const SESSION_PREFIX: &str = "codex-";

/// Tool name attached to replayed history records.
const HISTORY_TOOL_NAME: &str = "CodexHistoryEntry";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Worker base URL, e.g. `http://127.0.0.1:37777`.
    pub worker_url: String,
    /// Fallback workspace when a record carries no cwd.
    pub workspace: Option<String>,
    pub include_system: bool,
    pub since_ts: Option<i64>,
    pub limit: Option<usize>,
    pub skip_summaries: bool,
    pub retry: RetryPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            worker_url: format!("http://127.0.0.1:{}", crate::config::DEFAULT_PORT),
            workspace: None,
            include_system: false,
            since_ts: None,
            limit: None,
            skip_summaries: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Totals from one engine run.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub files_processed: usize,
    pub records_posted: usize,
    pub sessions_initialized: usize,
    pub summaries_requested: usize,
    pub malformed_lines: u64,
}

pub struct IngestionEngine {
    options: IngestOptions,
    client: reqwest::Client,
    state: IngestState,
    state_path: PathBuf,
}

impl IngestionEngine {
    pub fn new(options: IngestOptions, state_path: PathBuf) -> Result<Self> {
        let state = IngestState::load(&state_path)?;
        Ok(Self {
            options,
            client: reqwest::Client::new(),
            state,
            state_path,
        })
    }

    /// Ingest every `.jsonl` under the root, mtime-ascending. Stops at the
    /// first hard failure, leaving that file's checkpoint at the last
    /// successful record.
    pub async fn run_root(&mut self, root: &Path) -> Result<IngestReport> {
        let mut files = discover::collect_jsonl_files(root)?;
        discover::sort_by_mtime(&mut files);
        self.run_files(&files).await
    }

    pub async fn run_files(&mut self, files: &[PathBuf]) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let mut remaining_limit = self.options.limit;

        for path in files {
            if remaining_limit == Some(0) {
                break;
            }
            let outcome = self.ingest_file(path, remaining_limit, &mut report).await;
            self.state
                .save(&self.state_path)
                .context("failed to persist ingest state")?;
            match outcome {
                Ok(posted) => {
                    report.files_processed += 1;
                    if let Some(limit) = remaining_limit.as_mut() {
                        *limit = limit.saturating_sub(posted);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ingestion stopped at this file");
                    return Err(e);
                }
            }
        }

        info!(
            files = report.files_processed,
            records = report.records_posted,
            "ingestion run complete"
        );
        Ok(report)
    }

    /// Ingest one file. Returns the number of records posted.
    async fn ingest_file(
        &mut self,
        path: &Path,
        limit: Option<usize>,
        report: &mut IngestReport,
    ) -> Result<usize> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let parsed = parse_history_file_contents(&contents, path);
        report.malformed_lines += parsed.malformed_lines;

        let selection = SelectionOptions {
            include_system: self.options.include_system,
            since_ts: self.options.since_ts,
            after_line: self.state.checkpoint_for(path),
            limit,
        };
        let records = select_records_for_ingestion(&parsed.records, &selection);
        if records.is_empty() {
            return Ok(0);
        }

        let mut initialized: HashSet<String> = HashSet::new();
        let mut last_user_text: std::collections::HashMap<String, String> =
            std::collections::HashMap::new();
        let mut posted = 0usize;

        for record in &records {
            let content_session_id = format!("{SESSION_PREFIX}{}", record.session_id);
            let cwd = record
                .cwd
                .clone()
                .or_else(|| self.options.workspace.clone());
            let project = project_name_from_cwd(cwd.as_deref(), path);

            if initialized.insert(content_session_id.clone()) {
                self.post_init(&content_session_id, &project, record).await?;
                report.sessions_initialized += 1;
            }

            self.post_observation(&content_session_id, record, path, cwd.as_deref())
                .await?;
            posted += 1;
            report.records_posted += 1;
            last_user_text.insert(record.session_id.clone(), record.text.clone());

            // Only now is the record durable on the worker side.
            self.state.advance(path, record.line_number);
        }

        if !self.options.skip_summaries {
            for session_id in initialized {
                let raw_id = session_id
                    .strip_prefix(SESSION_PREFIX)
                    .unwrap_or(&session_id);
                let summary_text = summary_text_for_session(
                    &parsed,
                    raw_id,
                    last_user_text.get(raw_id).map(String::as_str),
                );
                self.post_summarize(&session_id, summary_text).await?;
                report.summaries_requested += 1;
            }
        }

        Ok(posted)
    }

    async fn post_init(
        &self,
        content_session_id: &str,
        project: &str,
        record: &IngestRecord,
    ) -> Result<()> {
        let body = json!({
            "contentSessionId": content_session_id,
            "project": project,
            "prompt": record.text,
            "platform": "transcript",
        });
        post_json_with_retry(
            &self.client,
            &format!("{}/sessions/init", self.options.worker_url),
            &body,
            &self.options.retry,
        )
        .await
        .map_err(|e| anyhow::anyhow!("session init failed: {e}"))?;
        Ok(())
    }

    async fn post_observation(
        &self,
        content_session_id: &str,
        record: &IngestRecord,
        source_path: &Path,
        cwd: Option<&str>,
    ) -> Result<()> {
        let body = json!({
            "contentSessionId": content_session_id,
            "tool_name": HISTORY_TOOL_NAME,
            "tool_input": {
                "sourcePath": source_path.to_string_lossy(),
                "lineNumber": record.line_number,
                "ts": record.ts,
            },
            "tool_response": record.text,
            "cwd": cwd,
        });
        post_json_with_retry(
            &self.client,
            &format!("{}/sessions/observations", self.options.worker_url),
            &body,
            &self.options.retry,
        )
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "observation for line {} failed: {e}",
                record.line_number
            )
        })?;
        Ok(())
    }

    async fn post_summarize(
        &self,
        content_session_id: &str,
        last_assistant_message: Option<&str>,
    ) -> Result<()> {
        let body = json!({
            "contentSessionId": content_session_id,
            "last_assistant_message": last_assistant_message,
        });
        post_json_with_retry(
            &self.client,
            &format!("{}/sessions/summarize", self.options.worker_url),
            &body,
            &self.options.retry,
        )
        .await
        .map_err(|e| anyhow::anyhow!("summarize failed: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_point_at_local_worker() {
        let options = IngestOptions::default();
        assert_eq!(options.worker_url, "http://127.0.0.1:37777");
        assert!(!options.skip_summaries);
    }

    #[test]
    fn engine_loads_existing_state() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join(checkpoint::CHECKPOINT_FILE);
        std::fs::write(
            &state_path,
            r#"{"historyPath": "/h/a.jsonl", "lastProcessedLineNumber": 3}"#,
        )
        .unwrap();

        let engine = IngestionEngine::new(IngestOptions::default(), state_path).unwrap();
        assert_eq!(engine.state.checkpoint_for(Path::new("/h/a.jsonl")), 3);
    }
}
