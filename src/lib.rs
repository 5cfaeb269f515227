// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod clients;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod sync;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::context::AppContext;
pub use crate::sync::SyncEngine;
