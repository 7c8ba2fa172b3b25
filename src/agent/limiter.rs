//! Per-model request spacing for the hosted provider.
//!
//! Tracks a millisecond-precision last-request time per model and enforces
//! `(60_000 / RPM) + margin` between calls, waiting the remainder before
//! each request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Safety margin added on top of the computed spacing.
const MARGIN_MS: u64 = 250;

/// Requests-per-minute table keyed by model name, with a default for
/// unknown models.
#[derive(Debug, Clone)]
pub struct RateTable {
    limits: HashMap<String, u32>,
    default_rpm: u32,
}

impl Default for RateTable {
    fn default() -> Self {
        let mut limits = HashMap::new();
        limits.insert("large-latest".to_string(), 30);
        limits.insert("small-latest".to_string(), 120);
        Self {
            limits,
            default_rpm: 60,
        }
    }
}

impl RateTable {
    pub fn with_limit(mut self, model: &str, rpm: u32) -> Self {
        self.limits.insert(model.to_string(), rpm);
        self
    }

    fn rpm_for(&self, model: &str) -> u32 {
        *self.limits.get(model).unwrap_or(&self.default_rpm)
    }

    /// Minimum spacing between requests for a model.
    pub fn spacing_for(&self, model: &str) -> Duration {
        let rpm = self.rpm_for(model).max(1);
        Duration::from_millis(60_000 / rpm as u64 + MARGIN_MS)
    }
}

/// Enforces the spacing. One instance per hosted provider.
pub struct RateLimiter {
    table: RateTable,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(table: RateTable) -> Self {
        Self {
            table,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    /// How long the caller must still wait before hitting this model.
    /// Also stamps the model as about-to-be-requested when the wait is zero.
    fn reserve(&self, model: &str) -> Duration {
        let spacing = self.table.spacing_for(model);
        let mut last = self.last_request.lock().expect("rate limiter lock");
        let now = Instant::now();
        match last.get(model) {
            Some(prev) => {
                let elapsed = now.duration_since(*prev);
                if elapsed >= spacing {
                    last.insert(model.to_string(), now);
                    Duration::ZERO
                } else {
                    spacing - elapsed
                }
            }
            None => {
                last.insert(model.to_string(), now);
                Duration::ZERO
            }
        }
    }

    /// Wait until a request to `model` is allowed. The only sanctioned sleep
    /// on the request path.
    pub async fn acquire(&self, model: &str) {
        loop {
            let wait = self.reserve(model);
            if wait.is_zero() {
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }
}
