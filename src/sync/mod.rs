// src/sync/mod.rs
//! Posting synchronization engine.
pub mod anchor;
pub mod cadence;
pub mod classify;
pub mod cycle;
pub mod diagnostics;
pub mod scheduler;
pub mod types;

use std::sync::Arc;

use serde::Serialize;

use crate::clients::{PostingFeed, PostingStore};
use crate::error::ConfigFault;
use cadence::Cadence;
use cycle::SyncCycle;
use diagnostics::{Diagnostics, SyncStatus};
use scheduler::{Scheduler, SchedulerState};
use types::LocationFilter;

/// Active polling configuration, as reported next to the diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct PollingOptions {
    pub location: LocationFilter,
    pub interval: String,
    #[serde(rename = "maxRetryCount")]
    pub max_retry_count: u32,
}

/// Lifecycle facade the host process talks to.
pub struct SyncEngine {
    cycle: Arc<SyncCycle>,
    scheduler: Scheduler,
    diagnostics: Arc<Diagnostics>,
    max_retry_count: u32,
}

impl SyncEngine {
    pub fn new(
        feed: Arc<dyn PostingFeed>,
        store: Arc<dyn PostingStore>,
        location: LocationFilter,
        max_retry_count: u32,
    ) -> Self {
        let diagnostics = Arc::new(Diagnostics::new());
        let cycle = Arc::new(SyncCycle::new(
            feed,
            store,
            diagnostics.clone(),
            location,
            max_retry_count,
        ));
        let scheduler = Scheduler::new(cycle.clone(), diagnostics.clone());
        Self {
            cycle,
            scheduler,
            diagnostics,
            max_retry_count,
        }
    }

    /// Start polling on `cadence` (e.g. "every 5 minutes").
    pub fn begin_synchronization(&self, cadence: &str) -> Result<(), ConfigFault> {
        let cadence = Cadence::parse(cadence)?;
        tracing::info!(
            target: "sync",
            location = %self.cycle.location(),
            interval = %cadence.expression,
            "beginning polling"
        );
        self.scheduler.start(&cadence);
        Ok(())
    }

    /// Stop triggering new cycles; resolves once any running cycle is done.
    pub async fn stop_synchronization(&self) {
        self.scheduler.request_stop().await;
        tracing::info!(target: "sync", "synchronization stopped");
    }

    pub fn diagnostics(&self) -> SyncStatus {
        self.diagnostics.snapshot()
    }

    pub fn polling_options(&self) -> PollingOptions {
        PollingOptions {
            location: self.cycle.location().clone(),
            interval: self.diagnostics.snapshot().schedule.interval,
            max_retry_count: self.max_retry_count,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn cycle(&self) -> &Arc<SyncCycle> {
        &self.cycle
    }
}
