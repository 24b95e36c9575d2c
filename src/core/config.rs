use anyhow::Result;

use super::cli::CliConfig;
use super::constants::{
    DEFAULT_AGENT_MAX_CONCURRENCY, DEFAULT_AGENT_MAX_RETRIES, DEFAULT_AGENT_TASK_TIMEOUT_SECS, DEFAULT_HOST,
    DEFAULT_LOCK_TTL_SECONDS, DEFAULT_PORT, DEFAULT_RATE_LIMIT_REQUESTS,
    DEFAULT_RATE_LIMIT_WINDOW_SECS, DEFAULT_SESSION_TTL_SECONDS,
    DEFAULT_SSE_HEARTBEAT_INTERVAL_SECS, DEFAULT_SSE_IDLE_TIMEOUT_SECS,
    DEFAULT_SSE_MAX_QUEUE_SIZE, DEFAULT_STORE_MAX_CONNECTIONS, DEFAULT_STORE_SOCKET_TIMEOUT_SECS,
    DEFAULT_STORE_URL, DEFAULT_STREAM_BLOCK_TIMEOUT_MS, DEFAULT_STREAM_MAXLEN,
    DEFAULT_STREAM_MAX_PENDING_CLAIM_AGE_MS, ENV_API_KEYS, ENV_JWT_SECRET,
};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
}

/// Store connection configuration (see SPEC_FULL.md §4.1)
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub max_connections: u32,
    pub socket_timeout_secs: u64,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ttl_seconds: u64,
}

/// SSE + event log configuration
#[derive(Debug, Clone)]
pub struct SseConfig {
    pub heartbeat_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_queue_size: usize,
    pub stream_maxlen: u64,
    pub stream_block_timeout_ms: u64,
    pub stream_max_pending_claim_age_ms: u64,
}

/// Distributed lock configuration
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub ttl_seconds: u64,
}

/// Rate limit configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub window_secs: u64,
}

/// Agent dispatch configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub task_timeout_secs: u64,
    pub max_retries: u32,
    /// Bounded per-worker concurrency (spec.md §5, default 4).
    pub max_concurrency: usize,
}

/// Authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Allowlisted API keys (comma-separated in API_KEYS)
    pub api_keys: Vec<String>,
    /// HS256 signing secret for session JWTs
    pub jwt_secret: Option<String>,
}

/// Final merged application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub session: SessionConfig,
    pub sse: SseConfig,
    pub lock: LockConfig,
    pub rate_limit: RateLimitConfig,
    pub agent: AgentConfig,
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Load configuration from CLI arguments with env var and default fallbacks.
    ///
    /// Priority (lowest to highest): defaults -> env vars (already folded into
    /// `cli` via clap's `env` attribute) -> explicit CLI flags.
    pub fn load(cli: &CliConfig) -> Result<Self> {
        tracing::debug!("loading application configuration");

        let server = ServerConfig {
            host: cli.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli.port.unwrap_or(DEFAULT_PORT),
            workers: cli.workers,
        };

        let store = StoreConfig {
            url: cli
                .store_url
                .clone()
                .unwrap_or_else(|| DEFAULT_STORE_URL.to_string()),
            max_connections: cli
                .store_max_connections
                .unwrap_or(DEFAULT_STORE_MAX_CONNECTIONS),
            socket_timeout_secs: cli
                .store_socket_timeout
                .unwrap_or(DEFAULT_STORE_SOCKET_TIMEOUT_SECS),
        };

        let session = SessionConfig {
            ttl_seconds: cli
                .session_ttl_seconds
                .unwrap_or(DEFAULT_SESSION_TTL_SECONDS),
        };

        let sse = SseConfig {
            heartbeat_interval_secs: cli
                .sse_heartbeat_interval
                .unwrap_or(DEFAULT_SSE_HEARTBEAT_INTERVAL_SECS),
            idle_timeout_secs: cli
                .sse_idle_timeout_sec
                .unwrap_or(DEFAULT_SSE_IDLE_TIMEOUT_SECS),
            max_queue_size: cli.sse_max_queue_size.unwrap_or(DEFAULT_SSE_MAX_QUEUE_SIZE),
            stream_maxlen: cli.stream_maxlen.unwrap_or(DEFAULT_STREAM_MAXLEN),
            stream_block_timeout_ms: cli
                .stream_block_timeout_ms
                .unwrap_or(DEFAULT_STREAM_BLOCK_TIMEOUT_MS),
            stream_max_pending_claim_age_ms: cli
                .stream_max_pending_claim_age_ms
                .unwrap_or(DEFAULT_STREAM_MAX_PENDING_CLAIM_AGE_MS),
        };

        let lock = LockConfig {
            ttl_seconds: cli.lock_ttl_seconds.unwrap_or(DEFAULT_LOCK_TTL_SECONDS),
        };

        let rate_limit = RateLimitConfig {
            requests: cli
                .rate_limit_requests
                .unwrap_or(DEFAULT_RATE_LIMIT_REQUESTS),
            window_secs: cli
                .rate_limit_window
                .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS),
        };

        let agent = AgentConfig {
            task_timeout_secs: cli
                .agent_task_timeout
                .unwrap_or(DEFAULT_AGENT_TASK_TIMEOUT_SECS),
            max_retries: cli.agent_max_retries.unwrap_or(DEFAULT_AGENT_MAX_RETRIES),
            max_concurrency: cli
                .agent_max_concurrency
                .unwrap_or(DEFAULT_AGENT_MAX_CONCURRENCY),
        };

        let api_keys = std::env::var(ENV_API_KEYS)
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let jwt_secret = std::env::var(ENV_JWT_SECRET).ok();

        let auth = AuthConfig {
            api_keys,
            jwt_secret,
        };

        let config = Self {
            server,
            store,
            session,
            sse,
            lock,
            rate_limit,
            agent,
            auth,
        };

        config.validate()?;

        tracing::debug!(
            host = %config.server.host,
            port = config.server.port,
            store_url_scheme = %config.store.url.split("://").next().unwrap_or(""),
            session_ttl_seconds = config.session.ttl_seconds,
            rate_limit_requests = config.rate_limit.requests,
            rate_limit_window_secs = config.rate_limit.window_secs,
            api_keys_configured = config.auth.api_keys.len(),
            jwt_configured = config.auth.jwt_secret.is_some(),
            "configuration loaded"
        );

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("configuration error: server host must not be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("configuration error: server port must be greater than 0");
        }
        if self.store.max_connections == 0 {
            anyhow::bail!("configuration error: store max_connections must be greater than 0");
        }
        if self.rate_limit.requests == 0 {
            anyhow::bail!("configuration error: rate_limit requests must be greater than 0");
        }
        if self.agent.max_concurrency == 0 {
            anyhow::bail!("configuration error: agent max_concurrency must be greater than 0");
        }
        if self.auth.api_keys.is_empty() && self.auth.jwt_secret.is_none() {
            tracing::warn!(
                "no API_KEYS or JWT_SECRET configured; every request will be rejected by auth"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let cli = CliConfig::default();
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.store.url, DEFAULT_STORE_URL);
        assert_eq!(config.session.ttl_seconds, DEFAULT_SESSION_TTL_SECONDS);
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = CliConfig {
            port: Some(9000),
            store_url: Some("redis://store:6380".to_string()),
            ..Default::default()
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.store.url, "redis://store:6380");
    }

    #[test]
    fn test_rejects_zero_port() {
        let cli = CliConfig {
            port: Some(0),
            ..Default::default()
        };
        assert!(AppConfig::load(&cli).is_err());
    }

    #[test]
    fn test_rejects_zero_max_connections() {
        let cli = CliConfig {
            store_max_connections: Some(0),
            ..Default::default()
        };
        assert!(AppConfig::load(&cli).is_err());
    }

    #[test]
    fn test_sse_and_stream_defaults() {
        let cli = CliConfig::default();
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.sse.stream_maxlen, DEFAULT_STREAM_MAXLEN);
        assert_eq!(
            config.sse.stream_block_timeout_ms,
            DEFAULT_STREAM_BLOCK_TIMEOUT_MS
        );
    }
}
