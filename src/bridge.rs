//! The search bridge: a stdio MCP server exposing exactly three tools —
//! `search`, `timeline`, `get_observations` — each a thin proxy over the
//! worker's HTTP API.
//!
//! stdout belongs to the JSON-RPC framing; all logging goes to stderr (set
//! up in `main` before anything else can log). If the worker is down, the
//! bridge spawns it and polls `/health` for up to ~35 seconds, then retries
//! the call once.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rmcp::handler::server::tool::{Parameters, ToolRouter};
use rmcp::schemars::JsonSchema;
use rmcp::{tool, tool_handler, tool_router, ServerHandler, ServiceExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Settings;

/// How long to wait for a spawned worker to become healthy.
const STARTUP_WAIT: Duration = Duration::from_secs(35);
const STARTUP_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SearchParams {
    /// Natural language query over stored observations, summaries, and prompts.
    #[schemars(description = "Search query. Returns a compact index table; fetch full records with get_observations.")]
    pub query: String,

    #[schemars(description = "Filter by project name")]
    pub project: Option<String>,

    #[schemars(description = "Record kind: 'observations' (default), 'summaries', 'prompts', or 'all'")]
    pub r#type: Option<String>,

    #[schemars(description = "Maximum results per kind (default 10)")]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TimelineParams {
    #[schemars(description = "Observation id to anchor the window on")]
    pub anchor: Option<i64>,

    #[schemars(description = "Query to locate the anchor when no id is known")]
    pub query: Option<String>,

    #[schemars(description = "Entries before the anchor (default 5)")]
    pub depth_before: Option<i64>,

    #[schemars(description = "Entries after the anchor (default 5)")]
    pub depth_after: Option<i64>,

    #[schemars(description = "Filter by project name")]
    pub project: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetObservationsParams {
    /// Required: ids from a previous filtered search.
    #[schemars(description = "Observation ids to fetch in full. Always search first; never fetch unfiltered.")]
    pub ids: Vec<i64>,
}

/// The bridge tool handler.
#[derive(Clone)]
pub struct BridgeTools {
    tool_router: ToolRouter<Self>,
    client: reqwest::Client,
    worker_url: String,
}

#[tool_router]
impl BridgeTools {
    pub fn new(worker_url: String) -> Self {
        Self {
            tool_router: Self::tool_router(),
            client: reqwest::Client::new(),
            worker_url,
        }
    }

    /// Probe the worker, spawning it if absent.
    async fn ensure_worker(&self) -> Result<(), String> {
        if self.probe_health().await {
            return Ok(());
        }

        info!("worker not responding, attempting to spawn it");
        let exe = std::env::current_exe().map_err(|e| format!("cannot locate worker binary: {e}"))?;
        std::process::Command::new(exe)
            .arg("serve")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| format!("failed to spawn worker: {e}"))?;

        let deadline = std::time::Instant::now() + STARTUP_WAIT;
        while std::time::Instant::now() < deadline {
            if self.probe_health().await {
                info!("worker is up");
                return Ok(());
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }
        Err("worker did not become healthy in time".into())
    }

    async fn probe_health(&self) -> bool {
        self.client
            .get(format!("{}/health", self.worker_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// GET with one retry after an ensure_worker round.
    async fn get_with_recovery(&self, path_and_query: &str) -> Result<serde_json::Value, String> {
        let url = format!("{}{path_and_query}", self.worker_url);
        match self.try_get(&url).await {
            Ok(value) => Ok(value),
            Err(first_err) => {
                warn!(error = %first_err, "worker call failed, recovering");
                self.ensure_worker().await?;
                self.try_get(&url).await
            }
        }
    }

    async fn try_get(&self, url: &str) -> Result<serde_json::Value, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("worker unreachable: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("worker returned HTTP {}", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| format!("bad worker response: {e}"))
    }

    /// Render the worker's `{content: [{text}]}` payload as the tool reply.
    fn content_text(value: serde_json::Value) -> String {
        value["content"]
            .as_array()
            .and_then(|blocks| blocks.first())
            .and_then(|b| b["text"].as_str())
            .map(String::from)
            .unwrap_or_else(|| value.to_string())
    }

    /// Search stored memory.
    #[tool(description = "Search coding-session memory (observations, summaries, prompts). Returns a compact index table; use get_observations for full records.")]
    async fn search(&self, Parameters(params): Parameters<SearchParams>) -> Result<String, String> {
        let mut query = format!("/search?query={}", urlencode(&params.query));
        if let Some(project) = &params.project {
            query.push_str(&format!("&project={}", urlencode(project)));
        }
        if let Some(kind) = &params.r#type {
            query.push_str(&format!("&type={}", urlencode(kind)));
        }
        if let Some(limit) = params.limit {
            query.push_str(&format!("&limit={limit}"));
        }

        let value = self.get_with_recovery(&query).await?;
        Ok(Self::content_text(value))
    }

    /// Chronological context around a memory.
    #[tool(description = "Show the chronological timeline of observations and summaries around an anchor (id or best search match).")]
    async fn timeline(
        &self,
        Parameters(params): Parameters<TimelineParams>,
    ) -> Result<String, String> {
        let mut query = String::from("/timeline?");
        if let Some(anchor) = params.anchor {
            query.push_str(&format!("anchor={anchor}"));
        } else if let Some(q) = &params.query {
            query.push_str(&format!("query={}", urlencode(q)));
        } else {
            return Err("timeline requires anchor or query".into());
        }
        if let Some(d) = params.depth_before {
            query.push_str(&format!("&depth_before={d}"));
        }
        if let Some(d) = params.depth_after {
            query.push_str(&format!("&depth_after={d}"));
        }
        if let Some(project) = &params.project {
            query.push_str(&format!("&project={}", urlencode(project)));
        }

        let value = self.get_with_recovery(&query).await?;
        Ok(Self::content_text(value))
    }

    /// Hydrate full observation records.
    #[tool(description = "Fetch full observation records by id. Call only after filtering with search or timeline.")]
    async fn get_observations(
        &self,
        Parameters(params): Parameters<GetObservationsParams>,
    ) -> Result<String, String> {
        if params.ids.is_empty() {
            return Err("ids must not be empty".into());
        }

        let url = format!("{}/observations/batch", self.worker_url);
        let body = serde_json::json!({"ids": params.ids});
        let post = |url: String, body: serde_json::Value| {
            let client = self.client.clone();
            async move {
                let response = client
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| format!("worker unreachable: {e}"))?;
                if !response.status().is_success() {
                    return Err(format!("worker returned HTTP {}", response.status()));
                }
                response
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|e| format!("bad worker response: {e}"))
            }
        };

        let value = match post(url.clone(), body.clone()).await {
            Ok(v) => v,
            Err(first_err) => {
                warn!(error = %first_err, "worker call failed, recovering");
                self.ensure_worker().await?;
                post(url, body).await?
            }
        };

        serde_json::to_string_pretty(&value).map_err(|e| format!("serialization failed: {e}"))
    }
}

#[tool_handler]
impl ServerHandler for BridgeTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "mnemo remembers past coding sessions. Use search to find relevant \
                 observations, timeline for chronological context, and get_observations \
                 to hydrate full records after filtering."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}

/// Run the bridge over stdio until the client disconnects.
pub async fn serve_stdio(settings: &Settings) -> Result<()> {
    let worker_url = format!(
        "http://{}:{}",
        settings.worker_host, settings.worker_port
    );
    let tools = BridgeTools::new(worker_url);
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    info!("search bridge running on stdio");
    server.waiting().await?;
    info!("search bridge shut down");
    Ok(())
}

/// Minimal percent-encoding for query values.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("hello world"), "hello%20world");
        assert_eq!(urlencode("a&b=c"), "a%26b%3Dc");
        assert_eq!(urlencode("plain-text_1.0~x"), "plain-text_1.0~x");
    }

    #[test]
    fn content_text_unwraps_tool_payload() {
        let value = serde_json::json!({
            "content": [{"type": "text", "text": "| id | title |"}]
        });
        assert_eq!(BridgeTools::content_text(value), "| id | title |");

        // Non-content payloads fall back to raw JSON
        let raw = serde_json::json!({"observations": []});
        assert!(BridgeTools::content_text(raw).contains("observations"));
    }
}
