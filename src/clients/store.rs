// src/clients/store.rs
use async_trait::async_trait;

use crate::clients::http::{self, HttpSettings, RetryPolicy};
use crate::error::{ConfigFault, HttpFault, StoreFault};
use crate::sync::types::{LocationFilter, Posting};

/// Id prefix the store uses for records that came from the feed.
pub const DEFAULT_SOURCE: &str = "3taps";

/// What a dispatch cost, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    /// Logical calls that completed (chunks or single removals).
    pub calls: u32,
    /// Extra attempts spent on server errors across those calls.
    pub retries: u32,
}

impl Dispatch {
    fn add(&mut self, d: &http::Delivered) {
        self.calls += 1;
        self.retries += d.retries();
    }
}

/// Dispatch failure plus what was already committed before it happened.
#[derive(Debug, Clone)]
pub struct DispatchFailure {
    pub fault: StoreFault,
    pub completed: Dispatch,
}

impl DispatchFailure {
    /// Retries spent, including the ones burned by the failing call.
    pub fn retries(&self) -> u32 {
        self.completed.retries + self.fault.http().retries()
    }
}

impl std::fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} call(s) already applied)",
            self.fault, self.completed.calls
        )
    }
}

/// Downstream posting store.
#[async_trait]
pub trait PostingStore: Send + Sync {
    /// Most recently created posting for the location, if any.
    async fn latest(&self, location: &LocationFilter) -> Result<Option<Posting>, StoreFault>;

    /// Bulk write in chunks, strictly in input order. Stops at the first chunk
    /// that exhausts its retries; earlier chunks stay applied.
    async fn upsert(&self, batch: &[Posting]) -> Result<Dispatch, DispatchFailure>;

    /// One delete per posting, in order. Stops at the first record that
    /// exhausts `max_attempts`.
    async fn remove(&self, batch: &[Posting], max_attempts: u32) -> Result<Dispatch, DispatchFailure>;
}

/// Posting store over HTTP.
pub struct HttpStoreClient {
    client: reqwest::Client,
    base_url: String,
    source: String,
    max_chunk: usize,
    policy: RetryPolicy,
}

impl HttpStoreClient {
    pub fn new(
        base_url: &str,
        source: &str,
        max_chunk: usize,
        settings: &HttpSettings,
        policy: RetryPolicy,
    ) -> Result<Self, ConfigFault> {
        if base_url.trim().is_empty() {
            return Err(ConfigFault::Missing("services.postings.url"));
        }
        if max_chunk == 0 {
            return Err(ConfigFault::Invalid {
                key: "services.postings.max_bulk_upsert_count",
                message: "must be at least 1".into(),
            });
        }
        let source = if source.trim().is_empty() {
            DEFAULT_SOURCE
        } else {
            source.trim()
        };
        Ok(Self {
            client: http::build_client(settings)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            source: source.to_string(),
            max_chunk,
            policy,
        })
    }

    /// Store-side id of a feed posting, e.g. `3taps:12345`.
    pub fn record_id(&self, posting: &Posting) -> String {
        format!("{}:{}", self.source, posting.id)
    }
}

#[async_trait]
impl PostingStore for HttpStoreClient {
    async fn latest(&self, location: &LocationFilter) -> Result<Option<Posting>, StoreFault> {
        let url = format!("{}/latest", self.base_url);
        let query = [(location.key(), location.value())];

        let res = http::with_retry(self.policy, &url, || {
            http::execute(self.client.get(&url).query(&query))
        })
        .await;

        let delivered = match res {
            Ok(d) => d,
            Err(HttpFault::Status { status: 404, .. }) => return Ok(None),
            Err(fault) => return Err(StoreFault::Latest(fault)),
        };

        let body = delivered.body.trim();
        if delivered.status == 204 || body.is_empty() || body == "null" {
            return Ok(None);
        }
        http::decode(&url, body).map(Some).map_err(StoreFault::Latest)
    }

    async fn upsert(&self, batch: &[Posting]) -> Result<Dispatch, DispatchFailure> {
        let mut done = Dispatch::default();
        for (idx, chunk) in batch.chunks(self.max_chunk).enumerate() {
            let res = http::with_retry(self.policy, &self.base_url, || {
                http::execute(self.client.put(&self.base_url).json(chunk))
            })
            .await;
            match res {
                Ok(d) => {
                    tracing::trace!(
                        target: "sync",
                        chunk = idx,
                        size = chunk.len(),
                        attempts = d.attempts,
                        "chunk upserted"
                    );
                    done.add(&d);
                }
                Err(fault) => {
                    return Err(DispatchFailure {
                        fault: StoreFault::Upsert {
                            chunk: idx,
                            size: chunk.len(),
                            fault,
                        },
                        completed: done,
                    })
                }
            }
        }
        Ok(done)
    }

    async fn remove(&self, batch: &[Posting], max_attempts: u32) -> Result<Dispatch, DispatchFailure> {
        let policy = RetryPolicy {
            max_attempts: max_attempts.max(1),
            ..self.policy
        };
        let mut done = Dispatch::default();
        for posting in batch {
            let id = self.record_id(posting);
            let url = format!("{}/{}", self.base_url, id);
            let res = http::with_retry(policy, &url, || {
                http::execute(self.client.delete(&url))
            })
            .await;
            match res {
                Ok(d) => done.add(&d),
                Err(fault) => {
                    return Err(DispatchFailure {
                        fault: StoreFault::Remove { id, fault },
                        completed: done,
                    })
                }
            }
        }
        Ok(done)
    }
}
