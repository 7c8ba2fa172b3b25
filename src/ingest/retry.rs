//! Exponential-backoff retry for the ingestion engine's worker POSTs.
//!
//! Retries only transient HTTP statuses (408/425/429/5xx) and network
//! errors; anything else fails on the first attempt.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

/// Attempt count and base delay; delay doubles per retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` (1-based) failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms << (attempt - 1))
    }
}

/// Why one attempt failed.
#[derive(Debug, Clone)]
pub enum AttemptError {
    Status { status: u16, body: String },
    Network(String),
}

impl AttemptError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status { status, .. } => is_retryable_status(*status),
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status { status, body } => write!(f, "HTTP {status}: {body}"),
            Self::Network(e) => write!(f, "network: {e}"),
        }
    }
}

impl std::error::Error for AttemptError {}

/// 408 Request Timeout, 425 Too Early, 429 Too Many Requests, any 5xx.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..=599).contains(&status)
}

/// Drive an operation through the policy. The operation receives the
/// 1-based attempt number.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, AttemptError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max => {
                let delay = policy.delay_after(attempt);
                debug!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// POST a JSON body with retry; returns the response body on 2xx.
pub async fn post_json_with_retry<B: Serialize>(
    client: &reqwest::Client,
    url: &str,
    body: &B,
    policy: &RetryPolicy,
) -> Result<serde_json::Value, AttemptError> {
    run_with_retry(policy, |_attempt| async {
        let response = client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| AttemptError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if (200..=299).contains(&status) {
            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| AttemptError::Network(e.to_string()))
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(AttemptError::Status {
                status,
                body: text.chars().take(300).collect(),
            })
        }
    })
    .await
}
