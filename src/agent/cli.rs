//! CLI subprocess provider: drives an external agent binary over a
//! temp-file round-trip.
//!
//! The conversation is rendered into a prompt file; the child writes its
//! final message to an output file and reports token usage on stdout as a
//! `tokens used: N` line. A per-request timeout terminates the child.

use std::process::Stdio;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::agent::conversation::Conversation;
use crate::agent::parser::{split_token_usage, TokenUsage};
use crate::agent::{ChatProvider, ProviderError, ProviderReply};
use crate::config::Settings;

static USAGE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)tokens used:\s*(\d+)").expect("usage pattern compiles"));

pub struct CliProvider {
    binary: String,
    reasoning_effort: String,
    timeout_ms: u64,
    /// Route through the local daemon by injecting its URL into the child env.
    open_bridge: Option<String>,
}

impl CliProvider {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            binary: settings.cli_binary.clone(),
            reasoning_effort: settings.reasoning_effort.clone(),
            timeout_ms: settings.timeout_ms,
            open_bridge: settings
                .cli_open_bridge
                .then(|| settings.base_url.clone()),
        }
    }

    /// Render the conversation for a single-shot CLI invocation.
    fn render_prompt(conversation: &Conversation) -> String {
        let mut out = String::new();
        for turn in conversation.turns() {
            out.push_str(&format!("[{}]\n{}\n\n", turn.role.as_str(), turn.text));
        }
        out
    }
}

#[async_trait]
impl ChatProvider for CliProvider {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn complete(&self, conversation: &Conversation) -> Result<ProviderReply, ProviderError> {
        if self.binary.is_empty() {
            return Err(ProviderError::Invalid("no CLI binary configured".into()));
        }

        let workdir = tempfile::tempdir()
            .map_err(|e| ProviderError::Invalid(format!("temp dir: {e}")))?;
        let prompt_path = workdir.path().join("prompt.md");
        let output_path = workdir.path().join("last-message.md");

        tokio::fs::write(&prompt_path, Self::render_prompt(conversation))
            .await
            .map_err(|e| ProviderError::Invalid(format!("write prompt file: {e}")))?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec")
            .arg("--prompt-file")
            .arg(&prompt_path)
            .arg("--last-message-file")
            .arg(&output_path)
            .arg("--reasoning-effort")
            .arg(&self.reasoning_effort)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(base_url) = &self.open_bridge {
            cmd.arg("--oss").env("OLLAMA_HOST", base_url);
        }

        debug!(binary = %self.binary, "spawning CLI provider");
        let mut child = cmd
            .spawn()
            .map_err(|e| ProviderError::Network(format!("spawn {}: {e}", self.binary)))?;

        // Drain stdout concurrently so a chatty child never fills the pipe
        // and blocks before exit.
        let mut stdout = child.stdout.take().expect("stdout piped");
        let stdout_reader = tokio::spawn(async move {
            let mut text = String::new();
            let _ = stdout.read_to_string(&mut text).await;
            text
        });

        let timeout = std::time::Duration::from_millis(self.timeout_ms);
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(ProviderError::Network(format!("wait: {e}"))),
            Err(_) => {
                // Timed out: terminate the child before surfacing the error.
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to signal timed-out CLI child");
                }
                let _ = child.wait().await;
                stdout_reader.abort();
                return Err(ProviderError::Timeout);
            }
        };

        let stdout_text = stdout_reader.await.unwrap_or_default();

        if !status.success() {
            return Err(ProviderError::Upstream {
                status: status.code().unwrap_or(-1).unsigned_abs() as u16,
                message: stdout_text.chars().take(500).collect(),
            });
        }

        let text = tokio::fs::read_to_string(&output_path)
            .await
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(ProviderError::Empty);
        }

        Ok(ProviderReply {
            usage: parse_usage_line(&stdout_text),
            text,
        })
    }
}

/// Extract `tokens used: N` from child stdout; the bare total splits 70/30.
fn parse_usage_line(stdout: &str) -> Option<TokenUsage> {
    USAGE_LINE
        .captures(stdout)
        .and_then(|cap| cap[1].parse::<i64>().ok())
        .map(split_token_usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_line_parses_case_insensitively() {
        let usage = parse_usage_line("done\nTokens Used: 420\n").unwrap();
        assert_eq!(usage.total(), 420);
        assert_eq!(usage.input, 294);
    }

    #[test]
    fn missing_usage_line_is_none() {
        assert!(parse_usage_line("no usage reported").is_none());
    }

    #[test]
    fn prompt_render_labels_roles() {
        let mut c = Conversation::new();
        c.push_user("hello");
        c.push_assistant("hi");
        let rendered = CliProvider::render_prompt(&c);
        assert!(rendered.contains("[user]\nhello"));
        assert!(rendered.contains("[assistant]\nhi"));
    }

    #[tokio::test]
    async fn empty_binary_is_invalid() {
        let provider = CliProvider {
            binary: String::new(),
            reasoning_effort: "medium".into(),
            timeout_ms: 1000,
            open_bridge: None,
        };
        let err = provider.complete(&Conversation::new()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Invalid(_)));
    }
}
