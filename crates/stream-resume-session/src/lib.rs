//! Session layer for resumable event streams.
//!
//! Provides:
//! - `StreamSessionManager` - Open, publish to, resume and close streams
//! - `Resumed` - Replayed history followed by live events

pub mod manager;

pub use manager::{LIVE_CHANNEL_CAPACITY, Resumed, SessionError, StreamSessionManager};
