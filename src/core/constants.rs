// =============================================================================
// Application Identity
// =============================================================================

pub const APP_NAME: &str = "AgentStream";
pub const APP_NAME_LOWER: &str = "agent-stream";

// =============================================================================
// Environment Variables - Server
// =============================================================================

pub const ENV_HOST: &str = "HOST";
pub const ENV_PORT: &str = "PORT";
pub const ENV_WORKERS: &str = "WORKERS";
pub const ENV_LOG: &str = "RUST_LOG";
pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;

// =============================================================================
// Environment Variables - Store
// =============================================================================

pub const ENV_STORE_URL: &str = "STORE_URL";
pub const ENV_STORE_MAX_CONNECTIONS: &str = "STORE_MAX_CONNECTIONS";
pub const ENV_STORE_SOCKET_TIMEOUT: &str = "STORE_SOCKET_TIMEOUT";

pub const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_STORE_MAX_CONNECTIONS: u32 = 20;
pub const DEFAULT_STORE_SOCKET_TIMEOUT_SECS: u64 = 5;

/// Pool size reserved for the streamer's blocking `XREADGROUP` connections,
/// kept separate from `DEFAULT_STORE_MAX_CONNECTIONS` so a slow consumer
/// group read never starves ordinary command traffic.
pub const DEFAULT_STREAM_STORE_POOL_SIZE: u32 = 10;

// =============================================================================
// Environment Variables - Session
// =============================================================================

pub const ENV_SESSION_TTL_SECONDS: &str = "SESSION_TTL_SECONDS";
pub const DEFAULT_SESSION_TTL_SECONDS: u64 = 3600;

// =============================================================================
// Environment Variables - SSE / Event Log
// =============================================================================

pub const ENV_SSE_HEARTBEAT_INTERVAL: &str = "SSE_HEARTBEAT_INTERVAL";
pub const ENV_SSE_IDLE_TIMEOUT_SEC: &str = "SSE_IDLE_TIMEOUT_SEC";
pub const ENV_SSE_MAX_QUEUE_SIZE: &str = "SSE_MAX_QUEUE_SIZE";
pub const ENV_STREAM_MAXLEN: &str = "STREAM_MAXLEN";
pub const ENV_STREAM_BLOCK_TIMEOUT_MS: &str = "STREAM_BLOCK_TIMEOUT_MS";
pub const ENV_STREAM_MAX_PENDING_CLAIM_AGE_MS: &str = "STREAM_MAX_PENDING_CLAIM_AGE_MS";

pub const DEFAULT_SSE_HEARTBEAT_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_SSE_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SSE_MAX_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_STREAM_MAXLEN: u64 = 10_000;
pub const DEFAULT_STREAM_BLOCK_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_STREAM_MAX_PENDING_CLAIM_AGE_MS: u64 = 30_000;

// =============================================================================
// Environment Variables - Distributed Lock
// =============================================================================

pub const ENV_LOCK_TTL_SECONDS: &str = "LOCK_TTL_SECONDS";
pub const DEFAULT_LOCK_TTL_SECONDS: u64 = 30;

// =============================================================================
// Environment Variables - Rate Limiting
// =============================================================================

pub const ENV_RATE_LIMIT_REQUESTS: &str = "RATE_LIMIT_REQUESTS";
pub const ENV_RATE_LIMIT_WINDOW: &str = "RATE_LIMIT_WINDOW";

pub const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 60;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

// =============================================================================
// Environment Variables - Agent Dispatch
// =============================================================================

pub const ENV_AGENT_TASK_TIMEOUT: &str = "AGENT_TASK_TIMEOUT";
pub const ENV_AGENT_MAX_RETRIES: &str = "AGENT_MAX_RETRIES";
pub const ENV_AGENT_MAX_CONCURRENCY: &str = "AGENT_MAX_CONCURRENCY";

pub const DEFAULT_AGENT_TASK_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_AGENT_MAX_RETRIES: u32 = 3;
pub const AGENT_RETRY_BASE_DELAY_SECS: u64 = 5;
pub const AGENT_RETRY_MAX_DELAY_SECS: u64 = 60;
/// Bounded per-worker concurrency (spec.md §5: "default 4 ... prefetch = 1
/// to preserve fairness").
pub const DEFAULT_AGENT_MAX_CONCURRENCY: usize = 4;

// =============================================================================
// Environment Variables - Auth
// =============================================================================

pub const ENV_API_KEYS: &str = "API_KEYS";
pub const ENV_JWT_SECRET: &str = "JWT_SECRET";

// =============================================================================
// Shutdown
// =============================================================================

pub const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Stale-resource cleanup (background sweeper, `system prune`)
// =============================================================================

pub const DEFAULT_BACKPRESSURE_STALE_IDLE_SECS: u64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_WORKER_HEALTH_CHECK_INTERVAL_SECS: u64 = 15;
