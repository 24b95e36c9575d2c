use clap::{Parser, Subcommand};

use super::constants::{
    ENV_AGENT_MAX_CONCURRENCY, ENV_AGENT_MAX_RETRIES, ENV_AGENT_TASK_TIMEOUT, ENV_HOST, ENV_LOCK_TTL_SECONDS,
    ENV_PORT, ENV_RATE_LIMIT_REQUESTS, ENV_RATE_LIMIT_WINDOW, ENV_SESSION_TTL_SECONDS,
    ENV_SSE_HEARTBEAT_INTERVAL, ENV_SSE_IDLE_TIMEOUT_SEC, ENV_SSE_MAX_QUEUE_SIZE,
    ENV_STORE_MAX_CONNECTIONS, ENV_STORE_SOCKET_TIMEOUT, ENV_STORE_URL, ENV_STREAM_BLOCK_TIMEOUT_MS,
    ENV_STREAM_MAXLEN, ENV_STREAM_MAX_PENDING_CLAIM_AGE_MS, ENV_WORKERS,
};

#[derive(Parser)]
#[command(name = "agent-stream-server")]
#[command(version, about = "Horizontally-scalable agent execution backend", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server host address
    #[arg(long, short = 'H', global = true, env = ENV_HOST)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', global = true, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Number of worker threads for the async runtime
    #[arg(long, global = true, env = ENV_WORKERS)]
    pub workers: Option<usize>,

    /// Store connection URL (redis://... )
    #[arg(long, global = true, env = ENV_STORE_URL)]
    pub store_url: Option<String>,

    /// Maximum store connections in the command pool
    #[arg(long, global = true, env = ENV_STORE_MAX_CONNECTIONS)]
    pub store_max_connections: Option<u32>,

    /// Store socket timeout in seconds
    #[arg(long, global = true, env = ENV_STORE_SOCKET_TIMEOUT)]
    pub store_socket_timeout: Option<u64>,

    /// Session TTL in seconds
    #[arg(long, global = true, env = ENV_SESSION_TTL_SECONDS)]
    pub session_ttl_seconds: Option<u64>,

    /// SSE heartbeat interval in seconds
    #[arg(long, global = true, env = ENV_SSE_HEARTBEAT_INTERVAL)]
    pub sse_heartbeat_interval: Option<u64>,

    /// SSE idle timeout in seconds (no events delivered)
    #[arg(long, global = true, env = ENV_SSE_IDLE_TIMEOUT_SEC)]
    pub sse_idle_timeout_sec: Option<u64>,

    /// Maximum buffered events per slow consumer before dropping
    #[arg(long, global = true, env = ENV_SSE_MAX_QUEUE_SIZE)]
    pub sse_max_queue_size: Option<usize>,

    /// Maximum approximate length of each session's event stream
    #[arg(long, global = true, env = ENV_STREAM_MAXLEN)]
    pub stream_maxlen: Option<u64>,

    /// XREADGROUP block timeout in milliseconds
    #[arg(long, global = true, env = ENV_STREAM_BLOCK_TIMEOUT_MS)]
    pub stream_block_timeout_ms: Option<u64>,

    /// Minimum idle time before a pending entry is eligible for XCLAIM
    #[arg(long, global = true, env = ENV_STREAM_MAX_PENDING_CLAIM_AGE_MS)]
    pub stream_max_pending_claim_age_ms: Option<u64>,

    /// Distributed lock TTL in seconds
    #[arg(long, global = true, env = ENV_LOCK_TTL_SECONDS)]
    pub lock_ttl_seconds: Option<u64>,

    /// Rate limit requests per window
    #[arg(long, global = true, env = ENV_RATE_LIMIT_REQUESTS)]
    pub rate_limit_requests: Option<u32>,

    /// Rate limit window in seconds
    #[arg(long, global = true, env = ENV_RATE_LIMIT_WINDOW)]
    pub rate_limit_window: Option<u64>,

    /// Agent task timeout in seconds
    #[arg(long, global = true, env = ENV_AGENT_TASK_TIMEOUT)]
    pub agent_task_timeout: Option<u64>,

    /// Maximum agent dispatch retries
    #[arg(long, global = true, env = ENV_AGENT_MAX_RETRIES)]
    pub agent_max_retries: Option<u32>,

    /// Maximum number of agent dispatches running concurrently
    #[arg(long, global = true, env = ENV_AGENT_MAX_CONCURRENCY)]
    pub agent_max_concurrency: Option<usize>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Start the server (default command)
    Start,
    /// System maintenance commands
    System {
        #[command(subcommand)]
        command: SystemCommands,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum SystemCommands {
    /// Prune expired sessions, stale streams, and abandoned locks
    Prune {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub store_url: Option<String>,
    pub store_max_connections: Option<u32>,
    pub store_socket_timeout: Option<u64>,
    pub session_ttl_seconds: Option<u64>,
    pub sse_heartbeat_interval: Option<u64>,
    pub sse_idle_timeout_sec: Option<u64>,
    pub sse_max_queue_size: Option<usize>,
    pub stream_maxlen: Option<u64>,
    pub stream_block_timeout_ms: Option<u64>,
    pub stream_max_pending_claim_age_ms: Option<u64>,
    pub lock_ttl_seconds: Option<u64>,
    pub rate_limit_requests: Option<u32>,
    pub rate_limit_window: Option<u64>,
    pub agent_task_timeout: Option<u64>,
    pub agent_max_retries: Option<u32>,
    pub agent_max_concurrency: Option<usize>,
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    let config = CliConfig {
        host: cli.host,
        port: cli.port,
        workers: cli.workers,
        store_url: cli.store_url,
        store_max_connections: cli.store_max_connections,
        store_socket_timeout: cli.store_socket_timeout,
        session_ttl_seconds: cli.session_ttl_seconds,
        sse_heartbeat_interval: cli.sse_heartbeat_interval,
        sse_idle_timeout_sec: cli.sse_idle_timeout_sec,
        sse_max_queue_size: cli.sse_max_queue_size,
        stream_maxlen: cli.stream_maxlen,
        stream_block_timeout_ms: cli.stream_block_timeout_ms,
        stream_max_pending_claim_age_ms: cli.stream_max_pending_claim_age_ms,
        lock_ttl_seconds: cli.lock_ttl_seconds,
        rate_limit_requests: cli.rate_limit_requests,
        rate_limit_window: cli.rate_limit_window,
        agent_task_timeout: cli.agent_task_timeout,
        agent_max_retries: cli.agent_max_retries,
        agent_max_concurrency: cli.agent_max_concurrency,
    };
    (config, cli.command)
}
