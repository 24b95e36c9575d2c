//! Server-sent events: backpressure buffering and the session streamer.
//!
//! - `backpressure` - bounded per-connection queue, slow-client detection
//! - `streamer` - joins a session's event log and formats SSE frames

pub mod backpressure;
pub mod streamer;

pub use backpressure::{
    BackpressureBuffer, BackpressureConfig, BackpressureManager, BufferMetricsSnapshot, SseEvent,
};
pub use streamer::StreamerConfig;
