//! # tf-core
//!
//! Core crate for the ticker feed pipeline, providing:
//!
//! - **Types** (`types`): ticker snapshots, bus messages, symbol utils
//! - **Configuration** (`config`): JSON config deserialization
//! - **Error types** (`error`): domain-specific `TfError` via thiserror
//! - **Backoff** (`backoff`): exponential backoff with jitter
//! - **Metrics** (`metrics`): per-shard counter aggregation with atomic drain
//! - **Monitor** (`monitor`): periodic metric reports over HTTP
//! - **Worker** (`worker`): start/stop lifecycle trait for long-running roles
//! - **WebSocket** (`ws`): WS client with auto-reconnect
//! - **Time utilities** (`time_util`): wall-clock and latency helpers
//! - **Logging** (`logging`): tracing-based structured logging

pub mod backoff;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod time_util;
pub mod types;
pub mod worker;
pub mod ws;

// Re-export types at crate root for convenience.
pub use types::*;
