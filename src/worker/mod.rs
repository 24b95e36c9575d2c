//! Worker-side dispatch and event publishing
//!
//! - `publisher` - synchronous per-session event appender with cancellation polling
//! - `dispatcher` - lock-guarded, retrying agent dispatch

pub mod dispatcher;
pub mod publisher;

pub use dispatcher::{
    AgentExecutionError, AgentExecutor, AgentOutcome, AgentRunContext, DemoAgentExecutor,
    Dispatcher, DispatcherConfig,
};
pub use publisher::{EventMetadata, EventPublisher, PublisherError};
