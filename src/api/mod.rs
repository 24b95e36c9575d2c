//! API server and routes

pub mod auth;
pub mod extractors;
pub mod middleware;
pub mod rate_limit;
pub mod routes;
mod server;
pub mod types;

use std::sync::Arc;

use crate::core::config::AppConfig;
use crate::data::eventlog::EventLog;
use crate::data::session::SessionStore;
use crate::data::store::{RateLimiter, StoreBackend};
use crate::metrics::Metrics;
use crate::sse::BackpressureManager;
use crate::worker::{Dispatcher, EventPublisher};

pub use server::ApiServer;

/// Shared handler state: an `Arc`-cloned view onto `CoreApp`'s collaborators,
/// built once in [`ApiServer::start`]. Cheap to clone per-request since
/// every field is either an `Arc` or wrapped in one.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn StoreBackend>,
    pub sessions: Arc<SessionStore>,
    pub event_log: Arc<EventLog>,
    pub rate_limiter: Arc<RateLimiter>,
    pub backpressure: Arc<BackpressureManager>,
    pub publisher: Arc<EventPublisher>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<Metrics>,
}
