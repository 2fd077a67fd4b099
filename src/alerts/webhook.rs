//! Webhook delivery.
//!
//! One POST per alert. 204 (or any 2xx) is success; a 429 waits out the
//! server-indicated `X-RateLimit-Reset-After` and retries once; anything
//! else is a counted failure — delivery problems never block scanning.

use std::time::Duration;

use async_trait::async_trait;

use super::embed::WebhookPayload;
use crate::error::WebhookError;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn post(&self, payload: &WebhookPayload) -> Result<(), WebhookError>;
}

pub struct DiscordWebhook {
    client: reqwest::Client,
    url: String,
}

impl DiscordWebhook {
    pub fn new(url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, url })
    }
}

fn reset_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("X-RateLimit-Reset-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

#[async_trait]
impl AlertSink for DiscordWebhook {
    async fn post(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        for attempt in 0..2 {
            let resp = self
                .client
                .post(&self.url)
                .json(payload)
                .send()
                .await
                .map_err(|e| WebhookError::Transport(e.to_string()))?;

            let status = resp.status().as_u16();
            if resp.status().is_success() {
                return Ok(());
            }
            if status == 429 && attempt == 0 {
                let wait = reset_after(resp.headers()).unwrap_or(Duration::from_secs(2));
                tracing::warn!(
                    wait_ms = wait.as_millis() as u64,
                    "webhook rate limited, retrying after reset"
                );
                tokio::time::sleep(wait).await;
                continue;
            }
            return Err(WebhookError::Status(status));
        }
        unreachable!("loop either returns or retries once")
    }
}

/// Test sink that records everything posted to it.
#[cfg(test)]
pub struct MemorySink {
    pub posted: std::sync::Mutex<Vec<WebhookPayload>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            posted: std::sync::Mutex::new(Vec::new()),
            fail: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn count(&self) -> usize {
        self.posted.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl AlertSink for MemorySink {
    async fn post(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(WebhookError::Status(500));
        }
        self.posted.lock().unwrap().push(payload.clone());
        Ok(())
    }
}
