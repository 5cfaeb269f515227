// src/clients/feed.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::clients::http::{self, Attempt, Delivered, HttpSettings, RetryPolicy};
use crate::error::{ConfigFault, FaultBody, HttpFault, UpstreamFault};
use crate::sync::types::{de_opt_token, Posting, PollRequest, PollResult, Token};

/// Error text the feed uses when it cannot place a cursor.
pub const NO_ANCHOR_FOUND: &str = "No anchor found";

/// Upstream change-stream API.
#[async_trait]
pub trait PostingFeed: Send + Sync {
    /// Resolve a cursor for the given wall-clock position.
    async fn anchor(&self, timestamp: DateTime<Utc>) -> Result<Token, UpstreamFault>;

    /// Read everything after `req.anchor` for the requested location.
    async fn poll(&self, req: &PollRequest) -> Result<PollResult, UpstreamFault>;
}

/// Feed API over HTTP.
pub struct HttpFeedClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    policy: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct AnchorBody {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    anchor: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PollBody {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, deserialize_with = "de_opt_token")]
    anchor: Option<Token>,
    #[serde(default)]
    postings: Vec<Posting>,
}

impl HttpFeedClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        settings: &HttpSettings,
        policy: RetryPolicy,
    ) -> Result<Self, ConfigFault> {
        if base_url.trim().is_empty() {
            return Err(ConfigFault::Missing("services.feed.url"));
        }
        Ok(Self {
            client: http::build_client(settings)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            policy,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Delivered, UpstreamFault> {
        let mut params: Vec<(&str, String)> = query.to_vec();
        if let Some(key) = &self.api_key {
            params.push(("auth_token", key.clone()));
        }

        http::with_retry(self.policy, url, || {
            let request = self.client.get(url).query(&params);
            async move { settle_no_anchor(http::execute(request).await) }
        })
        .await
        .map_err(anchor_or_http)
    }
}

/// The feed also reports failures as `success: false` with a 2xx.
fn reported_failure(
    url: &str,
    delivered: &Delivered,
    success: Option<bool>,
    error: Option<&str>,
) -> Result<(), UpstreamFault> {
    if success == Some(false) || error.is_some() {
        return Err(anchor_or_http(HttpFault::Status {
            url: url.to_string(),
            status: delivered.status,
            body: FaultBody::from_text(&delivered.body),
            attempts: delivered.attempts,
        }));
    }
    Ok(())
}

fn is_no_anchor(body: &FaultBody) -> bool {
    body.error_message()
        .is_some_and(|msg| msg.trim().eq_ignore_ascii_case(NO_ANCHOR_FOUND))
}

/// "No anchor found" is final even behind a 5xx; retrying cannot change it.
fn settle_no_anchor(attempt: Attempt) -> Attempt {
    match attempt {
        Attempt::ServerError { status, body } if is_no_anchor(&FaultBody::from_text(&body)) => {
            Attempt::Final { status, body }
        }
        other => other,
    }
}

/// Promote a fault whose body says "No anchor found" to its own kind.
fn anchor_or_http(fault: HttpFault) -> UpstreamFault {
    if let HttpFault::Status { body, .. } = &fault {
        if is_no_anchor(body) {
            return UpstreamFault::AnchorNotFound {
                message: body.error_message().unwrap_or(NO_ANCHOR_FOUND).to_string(),
            };
        }
    }
    UpstreamFault::Http(fault)
}

#[async_trait]
impl PostingFeed for HttpFeedClient {
    async fn anchor(&self, timestamp: DateTime<Utc>) -> Result<Token, UpstreamFault> {
        let url = self.url("anchor");
        let delivered = self
            .get(&url, &[("timestamp", timestamp.timestamp().to_string())])
            .await?;
        let body: AnchorBody = http::decode(&url, &delivered.body)?;
        reported_failure(&url, &delivered, body.success, body.error.as_deref())?;
        match body.anchor {
            Some(Value::Null) | None => Err(UpstreamFault::AnchorNotFound {
                message: format!("feed returned no anchor for {}", timestamp.to_rfc3339()),
            }),
            Some(v) => Token::deserialize(v).map_err(|e| {
                UpstreamFault::Http(HttpFault::Decode {
                    url,
                    message: e.to_string(),
                })
            }),
        }
    }

    async fn poll(&self, req: &PollRequest) -> Result<PollResult, UpstreamFault> {
        let url = self.url("poll");
        let location_key = format!("location.{}", req.location.key());
        let delivered = self
            .get(
                &url,
                &[
                    ("anchor", req.anchor.to_string()),
                    (location_key.as_str(), req.location.value().to_string()),
                ],
            )
            .await?;
        let body: PollBody = http::decode(&url, &delivered.body)?;
        reported_failure(&url, &delivered, body.success, body.error.as_deref())?;
        Ok(PollResult {
            anchor: body.anchor,
            postings: body.postings,
        })
    }
}
