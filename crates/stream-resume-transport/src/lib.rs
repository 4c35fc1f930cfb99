//! Transport layer for resumable event streams.
//!
//! Provides:
//! - Wire protocol (JSON)
//! - WebSocket transport (feature: websocket)
//! - Server-sent events with `Last-Event-ID` resumption (feature: sse)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "sse")]
pub mod sse;

pub use protocol::{ClientMessage, ServerMessage};
