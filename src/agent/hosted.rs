//! Hosted chat provider: HTTPS chat-completions REST with per-model rate
//! limiting and a single bad-model retry against the configured fallback
//! model.

use async_trait::async_trait;
use serde_json::json;

use crate::agent::conversation::Conversation;
use crate::agent::limiter::{RateLimiter, RateTable};
use crate::agent::parser::{split_token_usage, TokenUsage};
use crate::agent::{ChatProvider, ProviderError, ProviderReply};
use crate::config::Settings;

pub struct HostedProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    fallback_model: String,
    temperature: f64,
    limiter: RateLimiter,
}

impl HostedProvider {
    pub fn from_settings(settings: &Settings) -> Result<Self, ProviderError> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::Invalid("hosted provider requires an API key".into()))?;
        if settings.model.trim().is_empty() {
            return Err(ProviderError::Invalid("hosted provider requires a model".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| ProviderError::Invalid(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: settings.model.clone(),
            fallback_model: settings.fallback_model.clone(),
            temperature: settings.temperature,
            limiter: RateLimiter::new(RateTable::default()),
        })
    }

    async fn call_model(
        &self,
        model: &str,
        conversation: &Conversation,
    ) -> Result<ProviderReply, ProviderError> {
        self.limiter.acquire(model).await;

        let messages: Vec<serde_json::Value> = conversation
            .turns()
            .iter()
            .map(|t| json!({"role": t.role.as_str(), "content": t.text}))
            .collect();

        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": self.temperature,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        let payload: serde_json::Value = match status {
            200..=299 => response
                .json()
                .await
                .map_err(|e| ProviderError::Network(e.to_string()))?,
            429 => return Err(ProviderError::RateLimited),
            500..=599 => {
                let message = response.text().await.unwrap_or_default();
                return Err(ProviderError::Upstream { status, message });
            }
            _ => {
                let message = response.text().await.unwrap_or_default();
                if is_bad_model_error(status, &message) {
                    return Err(ProviderError::BadModel {
                        model: model.to_string(),
                    });
                }
                return Err(ProviderError::Permanent { status, message });
            }
        };

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if text.trim().is_empty() {
            return Err(ProviderError::Empty);
        }

        Ok(ProviderReply {
            usage: extract_usage(&payload),
            text,
        })
    }
}

#[async_trait]
impl ChatProvider for HostedProvider {
    fn name(&self) -> &'static str {
        "hosted"
    }

    async fn complete(&self, conversation: &Conversation) -> Result<ProviderReply, ProviderError> {
        match self.call_model(&self.model, conversation).await {
            Err(ProviderError::BadModel { model }) if self.fallback_model != model => {
                tracing::warn!(
                    model,
                    fallback = %self.fallback_model,
                    "model rejected, retrying once with fallback model"
                );
                self.call_model(&self.fallback_model, conversation).await
            }
            other => other,
        }
    }
}

fn classify_transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Model-not-found shows up as a 404 or as a 400 mentioning the model.
fn is_bad_model_error(status: u16, body: &str) -> bool {
    status == 404 || (status == 400 && body.to_ascii_lowercase().contains("model"))
}

/// Usage may come as an input/output pair or only as a total; a bare total
/// is split 70/30 for accounting.
fn extract_usage(payload: &serde_json::Value) -> Option<TokenUsage> {
    let usage = payload.get("usage")?;
    match (
        usage.get("prompt_tokens").and_then(|v| v.as_i64()),
        usage.get("completion_tokens").and_then(|v| v.as_i64()),
    ) {
        (Some(input), Some(output)) => Some(TokenUsage { input, output }),
        _ => usage
            .get("total_tokens")
            .and_then(|v| v.as_i64())
            .map(split_token_usage),
    }
}
