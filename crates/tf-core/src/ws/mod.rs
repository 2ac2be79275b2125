//! WebSocket client with auto-reconnect.

pub mod client;

pub use client::{WsConnConfig, WsConnection};
