//! Bounded exponential backoff and transient/permanent error classification.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::FetchError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = 1 + max_retries.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay: Duration::from_millis(2500),
            max_delay: Duration::from_secs(120),
            jitter_ratio: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff { policy: self.clone(), retries: 0 }
    }
}

/// Retry budget for one operation. `next_delay` yields `None` once exhausted.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(self.retries).unwrap_or(u32::MAX);
        let delay = self
            .policy
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.policy.max_delay)
            .min(self.policy.max_delay);
        self.retries += 1;
        Some(with_jitter(delay, self.policy.jitter_ratio))
    }

    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }
}

fn with_jitter(delay: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0.0..=ratio);
    delay.mul_f64(1.0 + extra)
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut backoff = policy.backoff();
    loop {
        match op().await {
            Ok(value) => {
                if backoff.attempts() > 1 {
                    debug!(what, attempts = backoff.attempts(), "Request recovered after retries");
                }
                return Ok(value);
            }
            Err(FetchError::TransientNetwork(reason)) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        what,
                        attempt = backoff.attempts() - 1,
                        max_attempts = policy.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Transient failure, backing off"
                    );
                    metrics::counter!("xrpl_md_rpc_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
                None => {
                    let attempts = backoff.attempts();
                    error!(what, attempts, error = %reason, "Retries exhausted");
                    return Err(FetchError::RetriesExhausted { attempts, last_error: reason });
                }
            },
            Err(other) => return Err(other),
        }
    }
}

/// Decides which failures are transient. Both lists come from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassifier {
    pub transient_status_codes: Vec<u16>,
    pub transient_rpc_errors: Vec<String>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            transient_status_codes: vec![408, 425, 429, 500, 502, 503, 504],
            transient_rpc_errors: ["tooBusy", "noNetwork", "noCurrent", "noClosed", "slowDown"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ErrorClassifier {
    pub fn classify_status(&self, status: u16, body: &str) -> FetchError {
        let reason = format!("HTTP {}: {}", status, truncate(body, 200));
        if self.transient_status_codes.contains(&status) {
            FetchError::TransientNetwork(reason)
        } else {
            FetchError::PermanentProtocol(reason)
        }
    }

    /// Pull `result` out of a JSON-RPC envelope, classifying node-side errors.
    pub fn extract_result(&self, mut envelope: Value) -> Result<Value, FetchError> {
        let result = envelope
            .get_mut("result")
            .map(Value::take)
            .ok_or_else(|| FetchError::PermanentProtocol("response has no `result`".into()))?;

        let is_error = result.get("status").and_then(Value::as_str) == Some("error") || result.get("error").is_some();
        if !is_error {
            return Ok(result);
        }

        let code = result.get("error").and_then(Value::as_str).unwrap_or("unknown").to_string();
        let message = result
            .get("error_message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let reason = format!("rpc error {}: {}", code, message);
        if self.transient_rpc_errors.iter().any(|c| *c == code) {
            Err(FetchError::TransientNetwork(reason))
        } else {
            Err(FetchError::PermanentProtocol(reason))
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
