//! Local-daemon model discovery: the tags API first, the CLI `list` output
//! as a fallback, and an explicit `none` source when both fail.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::server::error::ApiResult;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ModelsParams {
    #[serde(rename = "baseUrl")]
    pub base_url: Option<String>,
}

/// `GET /ollama/models?baseUrl=`
pub async fn list_models(
    State(state): State<AppState>,
    Query(params): Query<ModelsParams>,
) -> ApiResult<Json<Value>> {
    let base_url = params
        .base_url
        .unwrap_or_else(|| state.settings().base_url.clone());

    if let Some(models) = models_from_api(&base_url).await {
        return Ok(Json(json!({"models": models, "source": "api"})));
    }
    if let Some(models) = models_from_cli().await {
        return Ok(Json(json!({"models": models, "source": "cli"})));
    }
    Ok(Json(json!({"models": [], "source": "none"})))
}

/// Try the daemon's tags endpoint.
async fn models_from_api(base_url: &str) -> Option<Vec<String>> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(3))
        .build()
        .ok()?;

    let response = client.get(&url).send().await.ok()?;
    if !response.status().is_success() {
        debug!(status = %response.status(), "tags API unavailable");
        return None;
    }
    let payload: Value = response.json().await.ok()?;
    let models: Vec<String> = payload["models"]
        .as_array()?
        .iter()
        .filter_map(|m| m["name"].as_str().map(String::from))
        .collect();
    (!models.is_empty()).then_some(models)
}

/// Fall back to parsing `ollama list` output.
async fn models_from_cli() -> Option<Vec<String>> {
    let output = tokio::process::Command::new("ollama")
        .arg("list")
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let models = parse_cli_list(&text);
    (!models.is_empty()).then_some(models)
}

/// First whitespace-delimited token of each non-header line.
fn parse_cli_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1) // header row
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect()
}
