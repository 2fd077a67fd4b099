//! HTTP transport seam.
//!
//! The fetcher talks to the provider through this trait so tests can inject
//! a scripted fake and assert on exactly which requests were issued.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::FetchError;

/// Minimal view of an HTTP response: status, server-indicated wait, payload.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: Value,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<HttpResponse, FetchError>;
}

/// Production transport: pooled reqwest client with bounded timeouts.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// `request_timeout` bounds the whole call; connects are capped at 5 s
    /// and idle pool slots at 30 per host.
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(30)
            .build()?;
        Ok(Self { client })
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    for name in ["Retry-After", "X-RateLimit-Reset-After"] {
        if let Some(value) = headers.get(name) {
            if let Ok(text) = value.to_str() {
                if let Ok(secs) = text.trim().parse::<f64>() {
                    if secs.is_finite() && secs >= 0.0 {
                        return Some(Duration::from_secs_f64(secs));
                    }
                }
            }
        }
    }
    None
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<HttpResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = resp.status().as_u16();
        let retry_after = parse_retry_after(resp.headers());

        let body = if resp.status().is_success() {
            resp.json::<Value>()
                .await
                .map_err(|e| FetchError::DataValidation(format!("malformed JSON body: {e}")))?
        } else {
            // Error bodies are not interesting; classification happens on
            // the status alone.
            Value::Null
        };

        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Scripted transport for tests: pops a queued response per request.
#[cfg(test)]
pub struct ScriptedTransport {
    responses: std::sync::Mutex<std::collections::VecDeque<HttpResponse>>,
    pub requests: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl ScriptedTransport {
    pub fn new(bodies: Vec<Value>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            responses: std::sync::Mutex::new(
                bodies
                    .into_iter()
                    .map(|body| HttpResponse {
                        status: 200,
                        retry_after: None,
                        body,
                    })
                    .collect(),
            ),
            requests: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, _url: &str, _query: &[(String, String)]) -> Result<HttpResponse, FetchError> {
        self.requests
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.responses
            .lock()
            .expect("scripted transport lock poisoned")
            .pop_front()
            .ok_or_else(|| FetchError::Transient("no scripted response".into()))
    }
}
