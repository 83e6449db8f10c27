//! Toolpulse Analytics API Library
//!
//! Engine modules for download analytics (event store, rollups, compaction,
//! growth and trending, token pool) plus the HTTP surface that exposes them.

pub mod app;
pub mod auth;
pub mod compaction;
pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod github;
pub mod growth;
pub mod metadata;
pub mod rollups;
pub mod stats;
pub mod telemetry;
pub mod token_pool;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use app::{build_router, AppState};
pub use config::ServiceConfig;
