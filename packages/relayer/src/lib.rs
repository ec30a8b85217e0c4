//! Ionize Bridge Relayer - Library interface
//!
//! Re-exports internal modules for use in integration tests.

pub mod api;
pub mod config;
pub mod contracts;
pub mod db;
pub mod executor;
pub mod memo;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod stellar_client;
pub mod types;
pub mod watchers;
pub mod writers;
