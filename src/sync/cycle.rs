// src/sync/cycle.rs
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::clients::{PostingFeed, PostingStore};
use crate::error::{CycleFault, UpstreamFault};
use crate::sync::anchor::{AnchorManager, DEFAULT_HOURS_INCREMENT};
use crate::sync::classify::classify;
use crate::sync::diagnostics::{Diagnostics, Phase};
use crate::sync::scheduler::CycleJob;
use crate::sync::types::{LocationFilter, PollRequest, Posting, Token};

/// Outcome of one successful cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Cursor the poll was issued with.
    pub anchor: Option<Token>,
    pub polled: usize,
    pub removed: usize,
    pub upserted: usize,
    /// Removals failed part-way; the cycle carried on.
    pub removal_failed: bool,
    /// The first attempt hit "no anchor found" and was retried after a bump.
    pub bumped: bool,
}

/// One end-to-end sync pass: acquire anchor, poll, classify, dispatch, advance.
pub struct SyncCycle {
    feed: Arc<dyn PostingFeed>,
    store: Arc<dyn PostingStore>,
    diagnostics: Arc<Diagnostics>,
    anchors: Mutex<AnchorManager>,
    location: LocationFilter,
    max_retry_count: u32,
}

impl SyncCycle {
    pub fn new(
        feed: Arc<dyn PostingFeed>,
        store: Arc<dyn PostingStore>,
        diagnostics: Arc<Diagnostics>,
        location: LocationFilter,
        max_retry_count: u32,
    ) -> Self {
        let anchors = AnchorManager::new(
            feed.clone(),
            store.clone(),
            diagnostics.clone(),
            location.clone(),
        );
        Self {
            feed,
            store,
            diagnostics,
            anchors: Mutex::new(anchors),
            location,
            max_retry_count,
        }
    }

    pub fn location(&self) -> &LocationFilter {
        &self.location
    }

    /// Current cursor, if one is held for the next cycle.
    pub async fn current_anchor(&self) -> Option<Token> {
        self.anchors.lock().await.current().map(|a| a.cursor.clone())
    }

    /// Run a cycle. "No anchor found" bumps the reference timestamp and
    /// re-runs at once, a single time; any other fault ends the cycle.
    pub async fn run_once(&self) -> Result<CycleReport, CycleFault> {
        let mut anchors = self.anchors.lock().await;
        match self.attempt(&mut anchors).await {
            Err(e) if e.is_anchor_not_found() => {
                tracing::warn!(
                    target: "sync",
                    reference = %anchors.reference_timestamp(),
                    "no anchor found, adjusting timestamp and retrying"
                );
                anchors.bump(DEFAULT_HOURS_INCREMENT);
                let mut report = self.attempt(&mut anchors).await?;
                report.bumped = true;
                Ok(report)
            }
            other => other,
        }
    }

    async fn attempt(&self, anchors: &mut AnchorManager) -> Result<CycleReport, CycleFault> {
        let anchor = anchors.acquire().await?;
        let mut report = CycleReport {
            anchor: Some(anchor.cursor.clone()),
            ..CycleReport::default()
        };

        let req = PollRequest {
            anchor: anchor.cursor,
            location: self.location.clone(),
        };
        let t0 = Instant::now();
        let res = self.feed.poll(&req).await;
        let elapsed = t0.elapsed();
        self.diagnostics.record(Phase::Polling, elapsed, res.is_ok());
        if let Err(UpstreamFault::Http(h)) = &res {
            self.diagnostics.record_retries(Phase::Polling, h.retries());
        }
        tracing::trace!(
            target: "sync",
            anchor = %req.anchor,
            elapsed_ms = elapsed.as_millis() as u64,
            "poll completed"
        );
        if let Err(UpstreamFault::AnchorNotFound { .. }) = &res {
            // the cursor itself was rejected
            anchors.advance(None);
        }
        let result = res?;

        if result.postings.is_empty() {
            tracing::trace!(target: "sync", "no new postings retrieved");
            if result.anchor.is_some() {
                anchors.advance(result.anchor);
            }
            return Ok(report);
        }

        report.polled = result.postings.len();
        tracing::info!(
            target: "sync",
            count = report.polled,
            anchor = %req.anchor,
            "successfully retrieved postings"
        );

        let next_anchor = result.anchor;
        let batch = classify(result.postings);
        self.diagnostics.record_dispatch_cycle();

        match self.dispatch_removals(&batch.removals, &req.anchor).await {
            Ok(n) => report.removed = n,
            Err(n) => {
                report.removed = n;
                report.removal_failed = true;
            }
        }

        report.upserted = self.dispatch_upserts(&batch.upserts, &req.anchor).await?;

        anchors.advance(next_anchor);
        Ok(report)
    }

    /// Best effort: failures are logged and counted, never returned.
    /// `Err` carries how many removals were applied before the failure.
    async fn dispatch_removals(&self, removals: &[Posting], anchor: &Token) -> Result<usize, usize> {
        if removals.is_empty() {
            return Ok(0);
        }
        tracing::debug!(target: "sync", count = removals.len(), "sending request to remove postings");

        let t0 = Instant::now();
        let res = self.store.remove(removals, self.max_retry_count).await;
        let elapsed = t0.elapsed();
        self.diagnostics.record(Phase::Postings, elapsed, res.is_ok());

        match res {
            Ok(done) => {
                self.diagnostics.record_retries(Phase::Postings, done.retries);
                self.diagnostics.record_removed(removals.len());
                tracing::trace!(
                    target: "sync",
                    count = removals.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "removal of postings completed"
                );
                Ok(removals.len())
            }
            Err(failure) => {
                let applied = failure.completed.calls as usize;
                self.diagnostics.record_retries(Phase::Postings, failure.retries());
                self.diagnostics.record_removed(applied);
                tracing::error!(
                    target: "sync",
                    phase = "remove",
                    %anchor,
                    count = removals.len(),
                    applied,
                    error = %failure,
                    "unable to remove some postings"
                );
                Err(applied)
            }
        }
    }

    /// Blocking: a failure ends the cycle before the anchor advances.
    async fn dispatch_upserts(&self, upserts: &[Posting], anchor: &Token) -> Result<usize, CycleFault> {
        if upserts.is_empty() {
            return Ok(0);
        }
        tracing::debug!(target: "sync", count = upserts.len(), "sending postings to the store");

        let t0 = Instant::now();
        let res = self.store.upsert(upserts).await;
        let elapsed = t0.elapsed();
        self.diagnostics.record(Phase::Postings, elapsed, res.is_ok());

        match res {
            Ok(done) => {
                self.diagnostics.record_retries(Phase::Postings, done.retries);
                self.diagnostics.record_upserted(upserts.len());
                tracing::trace!(
                    target: "sync",
                    count = upserts.len(),
                    chunks = done.calls,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "saving postings completed"
                );
                Ok(upserts.len())
            }
            Err(failure) => {
                self.diagnostics.record_retries(Phase::Postings, failure.retries());
                tracing::error!(
                    target: "sync",
                    phase = "upsert",
                    %anchor,
                    count = upserts.len(),
                    chunks_applied = failure.completed.calls,
                    error = %failure,
                    "error encountered sending postings to the store"
                );
                Err(failure.fault.into())
            }
        }
    }
}

#[async_trait]
impl CycleJob for SyncCycle {
    async fn run(&self) {
        match self.run_once().await {
            Ok(r) => tracing::debug!(
                target: "sync",
                polled = r.polled,
                removed = r.removed,
                upserted = r.upserted,
                "sync cycle finished"
            ),
            Err(e) => tracing::error!(
                target: "sync",
                location = %self.location,
                error = %e,
                "sync cycle failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{Dispatch, DispatchFailure};
    use crate::error::{FaultBody, HttpFault, StoreFault};
    use crate::sync::types::{PollResult, PostingState};
    use chrono::{DateTime, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct ScriptedFeed {
        anchors: StdMutex<VecDeque<Result<Token, UpstreamFault>>>,
        polls: StdMutex<VecDeque<Result<PollResult, UpstreamFault>>>,
        anchor_calls: StdMutex<u32>,
        polled_with: StdMutex<Vec<Token>>,
    }

    impl ScriptedFeed {
        fn poll_returns(&self, r: Result<PollResult, UpstreamFault>) {
            self.polls.lock().unwrap().push_back(r);
        }
    }

    #[async_trait]
    impl PostingFeed for ScriptedFeed {
        async fn anchor(&self, _t: DateTime<Utc>) -> Result<Token, UpstreamFault> {
            let n = {
                let mut calls = self.anchor_calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            self.anchors
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Token::new(format!("A{n}"))))
        }

        async fn poll(&self, req: &PollRequest) -> Result<PollResult, UpstreamFault> {
            self.polled_with.lock().unwrap().push(req.anchor.clone());
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(PollResult::default()))
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        latest: Option<Posting>,
        latest_reads: StdMutex<u32>,
        upserted: StdMutex<Vec<Vec<String>>>,
        removed: StdMutex<Vec<String>>,
        fail_upsert: bool,
        fail_remove: bool,
    }

    fn unavailable(url: &str) -> HttpFault {
        HttpFault::Status {
            url: url.into(),
            status: 503,
            body: FaultBody::Empty,
            attempts: 3,
        }
    }

    #[async_trait]
    impl PostingStore for RecordingStore {
        async fn latest(&self, _l: &LocationFilter) -> Result<Option<Posting>, StoreFault> {
            *self.latest_reads.lock().unwrap() += 1;
            Ok(self.latest.clone())
        }

        async fn upsert(&self, batch: &[Posting]) -> Result<Dispatch, DispatchFailure> {
            if self.fail_upsert {
                return Err(DispatchFailure {
                    fault: StoreFault::Upsert {
                        chunk: 0,
                        size: batch.len(),
                        fault: unavailable("http://store/v1/postings"),
                    },
                    completed: Dispatch::default(),
                });
            }
            let ids = batch.iter().map(|p| p.id.to_string()).collect();
            self.upserted.lock().unwrap().push(ids);
            Ok(Dispatch { calls: 1, retries: 0 })
        }

        async fn remove(&self, batch: &[Posting], _max: u32) -> Result<Dispatch, DispatchFailure> {
            if self.fail_remove {
                return Err(DispatchFailure {
                    fault: StoreFault::Remove {
                        id: batch[0].id.to_string(),
                        fault: unavailable("http://store/v1/postings/3taps:x"),
                    },
                    completed: Dispatch::default(),
                });
            }
            let mut removed = self.removed.lock().unwrap();
            removed.extend(batch.iter().map(|p| p.id.to_string()));
            Ok(Dispatch {
                calls: batch.len() as u32,
                retries: 0,
            })
        }
    }

    fn cycle(feed: Arc<dyn PostingFeed>, store: Arc<RecordingStore>) -> (SyncCycle, Arc<Diagnostics>) {
        let diagnostics = Arc::new(Diagnostics::new());
        let c = SyncCycle::new(
            feed,
            store,
            diagnostics.clone(),
            LocationFilter::State("USA-WA".into()),
            5,
        );
        (c, diagnostics)
    }

    fn posting(id: &str, ts: i64, state: PostingState) -> Posting {
        let mut p = Posting::new(id, ts);
        p.state = state;
        p
    }

    fn mixed_batch(next: &str) -> PollResult {
        let mut flagged = posting("4", 5, PostingState::Active);
        flagged.flagged_status = Some(1);
        PollResult {
            anchor: Some(Token::new(next)),
            postings: vec![
                posting("1", 30, PostingState::Active),
                posting("2", 10, PostingState::Expired),
                posting("3", 20, PostingState::Unknown),
                flagged,
            ],
        }
    }

    #[tokio::test]
    async fn empty_poll_adopts_new_anchor_without_store_writes() {
        let feed = Arc::new(ScriptedFeed::default());
        feed.poll_returns(Ok(PollResult {
            anchor: Some(Token::new("B1")),
            postings: vec![],
        }));
        let store = Arc::new(RecordingStore::default());
        let (c, diag) = cycle(feed.clone(), store.clone());

        let report = c.run_once().await.unwrap();
        assert_eq!(report.polled, 0);
        assert_eq!(report.anchor, Some(Token::new("A1")));
        assert_eq!(c.current_anchor().await, Some(Token::new("B1")));
        assert!(store.upserted.lock().unwrap().is_empty());

        let snap = diag.snapshot();
        assert_eq!(snap.anchors.total_request_count, 1);
        assert_eq!(snap.polling.total_request_count, 1);
        assert_eq!(snap.postings.requests.total_request_count, 0);
        assert_eq!(snap.postings.average_posting_count, None);
    }

    #[tokio::test]
    async fn empty_poll_without_anchor_keeps_cursor() {
        let feed = Arc::new(ScriptedFeed::default());
        let (c, _) = cycle(feed.clone(), Arc::new(RecordingStore::default()));

        c.run_once().await.unwrap();
        c.run_once().await.unwrap();
        assert_eq!(c.current_anchor().await, Some(Token::new("A1")));
        assert_eq!(*feed.anchor_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn splits_removals_from_ordered_upserts() {
        let feed = Arc::new(ScriptedFeed::default());
        feed.poll_returns(Ok(mixed_batch("B1")));
        let store = Arc::new(RecordingStore::default());
        let (c, diag) = cycle(feed.clone(), store.clone());

        let report = c.run_once().await.unwrap();
        assert_eq!(report.polled, 4);
        assert_eq!(report.removed, 2);
        assert_eq!(report.upserted, 2);
        assert!(!report.removal_failed);

        assert_eq!(*store.upserted.lock().unwrap(), vec![vec!["3".to_string(), "1".to_string()]]);
        let mut removed = store.removed.lock().unwrap().clone();
        removed.sort();
        assert_eq!(removed, vec!["2", "4"]);
        assert_eq!(c.current_anchor().await, Some(Token::new("B1")));

        let snap = diag.snapshot();
        assert_eq!(snap.postings.total_postings_removed, 2);
        assert_eq!(snap.postings.total_postings_upserted, 2);
        assert_eq!(snap.postings.requests.total_request_count, 2);
        assert_eq!(snap.postings.average_posting_count, Some(4.0));
    }

    #[tokio::test]
    async fn no_anchor_found_bumps_and_retries_once() {
        let feed = Arc::new(ScriptedFeed::default());
        feed.poll_returns(Err(UpstreamFault::AnchorNotFound {
            message: "No anchor found".into(),
        }));
        feed.poll_returns(Ok(mixed_batch("C1")));
        let (c, _) = cycle(feed.clone(), Arc::new(RecordingStore::default()));

        let report = c.run_once().await.unwrap();
        assert!(report.bumped);
        assert_eq!(report.anchor, Some(Token::new("A2")));
        assert_eq!(report.upserted, 2);
        assert_eq!(
            *feed.polled_with.lock().unwrap(),
            vec![Token::new("A1"), Token::new("A2")]
        );
        assert_eq!(c.current_anchor().await, Some(Token::new("C1")));
    }

    #[tokio::test]
    async fn repeated_no_anchor_found_ends_the_cycle() {
        let feed = Arc::new(ScriptedFeed::default());
        for _ in 0..3 {
            feed.poll_returns(Err(UpstreamFault::AnchorNotFound {
                message: "no anchor found".into(),
            }));
        }
        let (c, diag) = cycle(feed.clone(), Arc::new(RecordingStore::default()));

        let err = c.run_once().await.unwrap_err();
        assert!(err.is_anchor_not_found());
        assert_eq!(feed.polled_with.lock().unwrap().len(), 2);
        assert_eq!(c.current_anchor().await, None);
        assert_eq!(diag.snapshot().polling.total_error_count, 2);
    }

    #[tokio::test]
    async fn failed_removals_do_not_block_upserts() {
        let feed = Arc::new(ScriptedFeed::default());
        feed.poll_returns(Ok(mixed_batch("B1")));
        let store = Arc::new(RecordingStore {
            fail_remove: true,
            ..RecordingStore::default()
        });
        let (c, diag) = cycle(feed, store.clone());

        let report = c.run_once().await.unwrap();
        assert!(report.removal_failed);
        assert_eq!(report.removed, 0);
        assert_eq!(report.upserted, 2);
        assert_eq!(store.upserted.lock().unwrap().len(), 1);
        assert_eq!(c.current_anchor().await, Some(Token::new("B1")));

        let snap = diag.snapshot().postings;
        assert_eq!(snap.requests.total_error_count, 1);
        assert_eq!(snap.requests.total_retry_count, 2);
    }

    #[tokio::test]
    async fn failed_upsert_keeps_the_old_anchor() {
        let feed = Arc::new(ScriptedFeed::default());
        feed.poll_returns(Ok(mixed_batch("B1")));
        let store = Arc::new(RecordingStore {
            fail_upsert: true,
            ..RecordingStore::default()
        });
        let (c, diag) = cycle(feed.clone(), store);

        let err = c.run_once().await.unwrap_err();
        assert!(matches!(err, CycleFault::Store(StoreFault::Upsert { .. })));
        assert_eq!(c.current_anchor().await, Some(Token::new("A1")));
        assert_eq!(diag.snapshot().postings.total_postings_upserted, 0);

        // next cycle re-polls from the same cursor
        c.run_once().await.unwrap();
        assert_eq!(
            *feed.polled_with.lock().unwrap(),
            vec![Token::new("A1"), Token::new("A1")]
        );
    }

    /// Refuses cursors for anything older than `oldest`.
    struct RetentionFeed {
        oldest: DateTime<Utc>,
        asked: StdMutex<Vec<DateTime<Utc>>>,
        polls: StdMutex<u32>,
    }

    #[async_trait]
    impl PostingFeed for RetentionFeed {
        async fn anchor(&self, t: DateTime<Utc>) -> Result<Token, UpstreamFault> {
            self.asked.lock().unwrap().push(t);
            if t < self.oldest {
                return Err(UpstreamFault::AnchorNotFound {
                    message: "No anchor found".into(),
                });
            }
            Ok(Token::new("R1"))
        }

        async fn poll(&self, _req: &PollRequest) -> Result<PollResult, UpstreamFault> {
            *self.polls.lock().unwrap() += 1;
            Ok(PollResult {
                anchor: Some(Token::new("R2")),
                postings: vec![],
            })
        }
    }

    #[tokio::test]
    async fn bumps_accumulate_across_triggers_until_an_anchor_is_found() {
        let now = Utc::now();
        let feed = Arc::new(RetentionFeed {
            oldest: now - chrono::Duration::hours(20),
            asked: StdMutex::new(Vec::new()),
            polls: StdMutex::new(0),
        });
        let mut latest = Posting::new("9", 0);
        latest.created_at = Some(now - chrono::Duration::hours(48));
        let store = Arc::new(RecordingStore {
            latest: Some(latest),
            ..RecordingStore::default()
        });
        let (c, _) = cycle(feed.clone(), store.clone());

        // -48h, -36h | -36h, -24h | -24h, -12h
        assert!(c.run_once().await.unwrap_err().is_anchor_not_found());
        assert!(c.run_once().await.unwrap_err().is_anchor_not_found());
        let report = c.run_once().await.unwrap();
        assert!(report.bumped);
        assert_eq!(report.anchor, Some(Token::new("R1")));
        assert_eq!(c.current_anchor().await, Some(Token::new("R2")));
        assert_eq!(*feed.polls.lock().unwrap(), 1);

        // the store is consulted once; bumped references are never reset from it
        assert_eq!(*store.latest_reads.lock().unwrap(), 1);
        let asked = feed.asked.lock().unwrap().clone();
        assert_eq!(asked.len(), 6);
        assert!(asked.windows(2).all(|w| w[0] <= w[1]));

        // a held cursor needs neither the store nor the anchor call
        c.run_once().await.unwrap();
        assert_eq!(*store.latest_reads.lock().unwrap(), 1);
        assert_eq!(feed.asked.lock().unwrap().len(), 6);
    }
}
