// src/clients/mod.rs
//! Boundary clients: the upstream feed and the downstream posting store.
pub mod feed;
pub mod http;
pub mod store;

pub use feed::{HttpFeedClient, PostingFeed};
pub use store::{Dispatch, DispatchFailure, HttpStoreClient, PostingStore};
