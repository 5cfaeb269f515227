// src/sync/anchor.rs
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::clients::{PostingFeed, PostingStore};
use crate::error::{CycleFault, UpstreamFault};
use crate::sync::diagnostics::{Diagnostics, Phase};
use crate::sync::types::{Anchor, LocationFilter, Token};

/// Hours the reference timestamp moves forward after "no anchor found".
pub const DEFAULT_HOURS_INCREMENT: i64 = 12;

/// Owns the feed cursor between cycles.
///
/// - A cursor from the previous poll is reused without any network call.
/// - Otherwise a cursor is derived from the reference timestamp, which is
///   refreshed from the newest record in the store unless a bump set it.
///   A bumped reference is kept, and bumps accumulate across cycles, until the
///   feed hands out a cursor.
/// - Nothing here survives a restart.
pub struct AnchorManager {
    feed: Arc<dyn PostingFeed>,
    store: Arc<dyn PostingStore>,
    diagnostics: Arc<Diagnostics>,
    location: LocationFilter,
    current: Option<Anchor>,
    reference: DateTime<Utc>,
    bumped: bool,
}

impl AnchorManager {
    pub fn new(
        feed: Arc<dyn PostingFeed>,
        store: Arc<dyn PostingStore>,
        diagnostics: Arc<Diagnostics>,
        location: LocationFilter,
    ) -> Self {
        Self {
            feed,
            store,
            diagnostics,
            location,
            current: None,
            reference: Utc::now(),
            bumped: false,
        }
    }

    pub fn current(&self) -> Option<&Anchor> {
        self.current.as_ref()
    }

    pub fn reference_timestamp(&self) -> DateTime<Utc> {
        self.reference
    }

    /// Cursor for the next poll.
    pub async fn acquire(&mut self) -> Result<Anchor, CycleFault> {
        if let Some(anchor) = &self.current {
            return Ok(anchor.clone());
        }

        if !self.bumped {
            self.refresh_reference().await?;
        }

        let timestamp = self.reference.min(Utc::now());
        tracing::trace!(target: "sync", %timestamp, "retrieving anchor");

        let t0 = Instant::now();
        let res = self.feed.anchor(timestamp).await;
        let elapsed = t0.elapsed();
        self.diagnostics.record(Phase::Anchors, elapsed, res.is_ok());
        if let Err(UpstreamFault::Http(h)) = &res {
            self.diagnostics.record_retries(Phase::Anchors, h.retries());
        }

        let cursor = res?;
        self.bumped = false;
        tracing::trace!(
            target: "sync",
            anchor = %cursor,
            %timestamp,
            elapsed_ms = elapsed.as_millis() as u64,
            "anchor retrieved"
        );
        let anchor = Anchor {
            cursor,
            derived_at: timestamp,
        };
        self.current = Some(anchor.clone());
        Ok(anchor)
    }

    /// Adopt the cursor carried by a poll response, or forget the current one
    /// so the next cycle derives a fresh cursor.
    pub fn advance(&mut self, next: Option<Token>) {
        match next {
            Some(cursor) => {
                tracing::trace!(target: "sync", anchor = %cursor, "updating anchor");
                self.current = Some(Anchor {
                    cursor,
                    derived_at: Utc::now(),
                });
            }
            None => self.current = None,
        }
    }

    /// Move the reference timestamp forward by `hours` and force a fresh cursor.
    pub fn bump(&mut self, hours: i64) {
        self.bump_at(hours, Utc::now());
    }

    /// [`bump`](Self::bump) against an explicit "now"; the result never passes it.
    pub fn bump_at(&mut self, hours: i64, now: DateTime<Utc>) {
        let moved = self
            .reference
            .checked_add_signed(ChronoDuration::hours(hours))
            .unwrap_or(now);
        self.reference = moved.min(now);
        self.current = None;
        self.bumped = true;
        tracing::info!(target: "sync", reference = %self.reference, "anchor timestamp bumped");
    }

    async fn refresh_reference(&mut self) -> Result<(), CycleFault> {
        let t0 = Instant::now();
        match self.store.latest(&self.location).await? {
            Some(p) => match p.created_at {
                Some(created) => {
                    tracing::debug!(
                        target: "sync",
                        created_at = %created,
                        elapsed_ms = t0.elapsed().as_millis() as u64,
                        "found latest posting"
                    );
                    self.reference = created.min(Utc::now());
                    tracing::info!(target: "sync", reference = %self.reference, "setting anchor timestamp");
                }
                None => {
                    tracing::warn!(target: "sync", id = %p.id, "latest posting has no createdAt");
                }
            },
            None => {
                tracing::warn!(
                    target: "sync",
                    reference = %self.reference,
                    "no recent postings found, keeping reference timestamp"
                );
            }
        }
        Ok(())
    }
}
