// src/context.rs
use std::sync::Arc;

use crate::clients::{HttpFeedClient, HttpStoreClient, PostingFeed, PostingStore};
use crate::config::AppConfig;
use crate::error::ConfigFault;
use crate::sync::SyncEngine;

/// Everything built from configuration at startup, once.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub engine: Arc<SyncEngine>,
}

impl AppContext {
    pub fn from_config(config: AppConfig) -> Result<Self, ConfigFault> {
        config.validate()?;
        let location = config.location()?;

        let feed_cfg = &config.services.feed;
        let feed: Arc<dyn PostingFeed> = Arc::new(HttpFeedClient::new(
            &feed_cfg.url,
            Some(feed_cfg.api_key.clone()),
            &feed_cfg.http(),
            feed_cfg.retry(),
        )?);

        let store_cfg = &config.services.postings;
        let store: Arc<dyn PostingStore> = Arc::new(HttpStoreClient::new(
            &store_cfg.url,
            &store_cfg.source,
            store_cfg.max_bulk_upsert_count,
            &store_cfg.http(),
            store_cfg.retry(),
        )?);

        let engine = SyncEngine::new(feed, store, location, config.models.postings.max_retry_count);
        Ok(Self::with_engine(config, Arc::new(engine)))
    }

    /// Wrap an engine built elsewhere (e.g. over in-memory clients).
    pub fn with_engine(config: AppConfig, engine: Arc<SyncEngine>) -> Self {
        Self {
            config: Arc::new(config),
            engine,
        }
    }

    /// Start polling on the configured cadence.
    pub fn begin(&self) -> Result<(), ConfigFault> {
        self.engine
            .begin_synchronization(&self.config.models.postings.schedule.interval)
    }
}
