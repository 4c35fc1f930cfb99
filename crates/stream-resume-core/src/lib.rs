//! Core of resumable streaming sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `EventLog` - Bounded per-stream buffers plus a global id index
//! - `Event`, `EventId`, `StreamId` - The event record and its identifiers
//! - `EventLogConfig` - Per-stream capacity
//! - `EventStore` and `EventSink` traits

pub mod config;
pub mod event;
pub mod event_log;
pub mod traits;

pub use config::{ConfigError, EventLogConfig};
pub use event::{Event, EventId, StreamId};
pub use event_log::{EventLog, EventLogStats};
pub use traits::{EventSink, EventStore, ReplayError, SinkError};
