// src/clients/http.rs
//! Shared HTTP plumbing for the feed and store clients: client construction,
//! response classification, and the bounded retry loop.

use std::future::Future;
use std::time::Duration;

use crate::error::{ConfigFault, FaultBody, HttpFault};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Longest pause between two attempts, whatever the attempt number.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Connection settings shared by every call a client makes.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub strict_tls: bool,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            strict_tls: true,
        }
    }
}

/// Build a `reqwest::Client` with a per-call timeout. A hung peer surfaces as
/// a timeout (no response) instead of blocking the cycle forever.
pub fn build_client(settings: &HttpSettings) -> Result<reqwest::Client, ConfigFault> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(settings.timeout.min(Duration::from_secs(10)))
        .timeout(settings.timeout)
        .danger_accept_invalid_certs(!settings.strict_tls)
        .build()
        .map_err(|e| ConfigFault::Invalid {
            key: "services.*.timeout_ms",
            message: e.to_string(),
        })
}

/// How many times one logical call may be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// `max_retry_count` of 0 still allows the first attempt.
    pub fn new(max_retry_count: u32) -> Self {
        Self {
            max_attempts: max_retry_count.max(1),
            backoff: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn delay_before(&self, next_attempt: u32) -> Duration {
        if self.backoff.is_zero() {
            return Duration::ZERO;
        }
        let shift = next_attempt.saturating_sub(2).min(16);
        self.backoff.saturating_mul(1u32 << shift).min(MAX_BACKOFF)
    }
}

/// One attempt, classified by status class.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    Success { status: u16, body: String },
    ServerError { status: u16, body: String },
    ClientError { status: u16, body: String },
    /// A failure the caller recognised from its body as final, whatever the
    /// status class.
    Final { status: u16, body: String },
    NoResponse(String),
}

impl Attempt {
    fn from_status(status: u16, body: String) -> Self {
        match status {
            200..=299 => Attempt::Success { status, body },
            500..=u16::MAX => Attempt::ServerError { status, body },
            _ => Attempt::ClientError { status, body },
        }
    }
}

/// A successful exchange plus how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub status: u16,
    pub body: String,
    pub attempts: u32,
}

impl Delivered {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Send a prepared request and classify what came back.
pub async fn execute(request: reqwest::RequestBuilder) -> Attempt {
    let resp = match request.send().await {
        Ok(r) => r,
        Err(e) => return Attempt::NoResponse(e.to_string()),
    };
    let status = resp.status().as_u16();
    // A body that cannot be read still has a status worth acting on.
    let body = resp.text().await.unwrap_or_default();
    Attempt::from_status(status, body)
}

/// Drive `attempt` under `policy`:
/// - 2xx returns immediately,
/// - 5xx is retried with the same payload until `max_attempts` is spent,
/// - no response, [`Attempt::Final`] and every other status fail at once.
pub async fn with_retry<F, Fut>(policy: RetryPolicy, url: &str, mut attempt: F) -> Result<Delivered, HttpFault>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt>,
{
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Attempt::Success { status, body } => {
                return Ok(Delivered {
                    status,
                    body,
                    attempts,
                })
            }
            Attempt::NoResponse(message) => {
                return Err(HttpFault::NoResponse {
                    url: url.to_string(),
                    message,
                })
            }
            Attempt::ClientError { status, body } | Attempt::Final { status, body } => {
                return Err(HttpFault::Status {
                    url: url.to_string(),
                    status,
                    body: FaultBody::from_text(&body),
                    attempts,
                })
            }
            Attempt::ServerError { status, body } => {
                if attempts >= policy.max_attempts {
                    return Err(HttpFault::Status {
                        url: url.to_string(),
                        status,
                        body: FaultBody::from_text(&body),
                        attempts,
                    });
                }
                tracing::warn!(
                    target: "sync",
                    %url,
                    status,
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    "server error, retrying"
                );
                let delay = policy.delay_before(attempts + 1);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Decode a JSON body, keeping the URL in the fault.
pub fn decode<T: serde::de::DeserializeOwned>(url: &str, body: &str) -> Result<T, HttpFault> {
    serde_json::from_str(body).map_err(|e| HttpFault::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}
