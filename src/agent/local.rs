//! Local-daemon chat provider (Ollama-style API over loopback HTTP).
//!
//! Also exposes the embeddings call that feeds the vector index; when the
//! daemon is unreachable the index simply receives nothing and search falls
//! back to full text.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::agent::conversation::Conversation;
use crate::agent::parser::TokenUsage;
use crate::agent::{ChatProvider, ProviderError, ProviderReply};
use crate::config::Settings;

/// Embedding model requested from the daemon.
pub const EMBEDDING_MODEL: &str = "nomic-embed-text";

#[derive(Debug)]
pub struct LocalProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    context_size: u32,
    temperature: f64,
    extra_options: Map<String, Value>,
}

impl LocalProvider {
    pub fn from_settings(settings: &Settings) -> Result<Self, ProviderError> {
        // extra_options is typed as a map in Settings; a scalar or array in
        // the settings file never reaches here. Guard anyway for values fed
        // through the constructor directly.
        Self::new(
            &settings.base_url,
            &settings.model,
            settings.context_size,
            settings.temperature,
            Value::Object(settings.extra_options.clone()),
            settings.timeout_ms,
        )
    }

    pub fn new(
        base_url: &str,
        model: &str,
        context_size: u32,
        temperature: f64,
        extra_options: Value,
        timeout_ms: u64,
    ) -> Result<Self, ProviderError> {
        let extra_options = match extra_options {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ProviderError::Invalid(format!(
                    "options must be a plain map, got {}",
                    json_type_name(&other)
                )))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| ProviderError::Invalid(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            context_size,
            temperature,
            extra_options,
        })
    }

    fn chat_options(&self) -> Value {
        let mut options = self.extra_options.clone();
        options
            .entry("temperature".to_string())
            .or_insert(json!(self.temperature));
        options
            .entry("num_ctx".to_string())
            .or_insert(json!(self.context_size));
        Value::Object(options)
    }

    /// Fetch an embedding for the vector index. Returns an error the caller
    /// is expected to swallow (the index is best-effort).
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&json!({"model": EMBEDDING_MODEL, "prompt": text}))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        if !(200..=299).contains(&status) {
            return Err(ProviderError::Upstream {
                status,
                message: response.text().await.unwrap_or_default(),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let embedding: Vec<f32> = payload["embedding"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .unwrap_or_default();

        if embedding.is_empty() {
            return Err(ProviderError::Empty);
        }
        Ok(embedding)
    }
}

#[async_trait]
impl ChatProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn complete(&self, conversation: &Conversation) -> Result<ProviderReply, ProviderError> {
        let messages: Vec<Value> = conversation
            .turns()
            .iter()
            .map(|t| json!({"role": t.role.as_str(), "content": t.text}))
            .collect();

        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": self.chat_options(),
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        let payload: Value = match status {
            200..=299 => response
                .json()
                .await
                .map_err(|e| ProviderError::Network(e.to_string()))?,
            429 => return Err(ProviderError::RateLimited),
            500..=599 => {
                return Err(ProviderError::Upstream {
                    status,
                    message: response.text().await.unwrap_or_default(),
                })
            }
            _ => {
                return Err(ProviderError::Permanent {
                    status,
                    message: response.text().await.unwrap_or_default(),
                })
            }
        };

        let text = payload["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if text.trim().is_empty() {
            return Err(ProviderError::Empty);
        }

        let usage = match (
            payload["prompt_eval_count"].as_i64(),
            payload["eval_count"].as_i64(),
        ) {
            (Some(input), Some(output)) => Some(TokenUsage { input, output }),
            _ => None,
        };

        Ok(ProviderReply { text, usage })
    }
}

fn classify_transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Network(e.to_string())
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
