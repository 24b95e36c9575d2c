//! Core application

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::api::ApiServer;
use crate::core::banner;
use crate::core::cli::{self, CliConfig, Commands, SystemCommands};
use crate::core::config::AppConfig;
use crate::core::constants::{
    APP_NAME_LOWER, DEFAULT_BACKPRESSURE_STALE_IDLE_SECS, DEFAULT_STREAM_STORE_POOL_SIZE,
    DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_WORKER_HEALTH_CHECK_INTERVAL_SECS, ENV_LOG,
};
use crate::core::shutdown::ShutdownService;
use crate::data::eventlog::EventLog;
use crate::data::session::SessionStore;
use crate::data::store::{build_store_backend, RateLimiter, StoreBackend};
use crate::metrics::Metrics;
use crate::sse::BackpressureManager;
use crate::worker::{DemoAgentExecutor, Dispatcher, DispatcherConfig, EventPublisher};

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub store: Arc<dyn StoreBackend>,
    pub sessions: Arc<SessionStore>,
    pub event_log: Arc<EventLog>,
    pub rate_limiter: Arc<RateLimiter>,
    pub backpressure: Arc<BackpressureManager>,
    pub publisher: Arc<EventPublisher>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<Metrics>,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "Parsed command");

        match command {
            Some(Commands::System {
                command: system_cmd,
            }) => {
                return Self::handle_system_command(&cli_config, system_cmd).await;
            }
            Some(Commands::Start) | None => {}
        }

        let app = Self::init(&cli_config).await?;
        Self::start_server(app).await
    }

    async fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;

        // Ordinary command traffic and the streamer's blocking XREADGROUP
        // reads must not share a pool (see `data/store/mod.rs`).
        let command_store = build_store_backend(&config.store, config.store.max_connections)
            .await
            .map_err(|e| anyhow::anyhow!("failed to initialize store backend: {}", e))?;
        let stream_store = build_store_backend(&config.store, DEFAULT_STREAM_STORE_POOL_SIZE)
            .await
            .map_err(|e| anyhow::anyhow!("failed to initialize stream store backend: {}", e))?;

        tracing::debug!(backend = command_store.backend_name(), "store initialized");

        let sessions = Arc::new(SessionStore::new(
            command_store.clone(),
            Duration::from_secs(config.session.ttl_seconds),
            Duration::from_secs(config.lock.ttl_seconds),
        ));

        let event_log = Arc::new(EventLog::new(
            stream_store,
            Duration::from_secs(config.session.ttl_seconds),
            config.sse.stream_maxlen,
            config.sse.stream_block_timeout_ms,
            config.sse.stream_max_pending_claim_age_ms,
        ));

        let rate_limiter = Arc::new(RateLimiter::new(command_store.clone()));
        let backpressure = Arc::new(BackpressureManager::new());
        let metrics = Arc::new(
            Metrics::new().map_err(|e| anyhow::anyhow!("failed to initialize metrics: {}", e))?,
        );

        // The synchronous redis client the worker publisher opens can't parse
        // a `memory://` scheme at all; fall back to a conventional local URL
        // so dev mode without Redis still boots (dispatch will simply fail on
        // first publish, which is acceptable for local iteration).
        let publisher_url = if config.store.url.starts_with("memory://") {
            tracing::warn!(
                "store configured as in-memory; worker event publisher falls back to \
                 redis://127.0.0.1:6379 and will fail to publish without a local redis"
            );
            "redis://127.0.0.1:6379".to_string()
        } else {
            config.store.url.clone()
        };

        let publisher = Arc::new(
            EventPublisher::new(&publisher_url, config.sse.stream_maxlen, metrics.clone())
                .map_err(|e| anyhow::anyhow!("failed to initialize event publisher: {}", e))?,
        );

        let dispatcher_config = DispatcherConfig {
            lock_wait: Duration::from_secs(2),
            task_timeout: Duration::from_secs(config.agent.task_timeout_secs),
            max_retries: config.agent.max_retries,
            retry_base_delay: Duration::from_secs(crate::core::constants::AGENT_RETRY_BASE_DELAY_SECS),
            retry_max_delay: Duration::from_secs(crate::core::constants::AGENT_RETRY_MAX_DELAY_SECS),
            max_concurrency: config.agent.max_concurrency,
        };

        let dispatcher = Arc::new(Dispatcher::new(
            sessions.clone(),
            publisher.clone(),
            Arc::new(DemoAgentExecutor),
            dispatcher_config,
            metrics.clone(),
        ));

        let shutdown = ShutdownService::new();

        Ok(Self {
            config,
            store: command_store,
            sessions,
            event_log,
            rate_limiter,
            backpressure,
            publisher,
            dispatcher,
            shutdown,
            metrics,
        })
    }

    async fn handle_system_command(cli: &CliConfig, cmd: SystemCommands) -> Result<()> {
        match cmd {
            SystemCommands::Prune { yes } => Self::prune_data(cli, yes).await,
        }
    }

    /// Remove expired sessions, event streams and locks left behind by
    /// crashed workers or clients that never reconnected to collect a
    /// `final`/`error` event. Unlike the storage this replaced, there is no
    /// local data directory to delete — everything lives in the store.
    async fn prune_data(cli: &CliConfig, skip_confirm: bool) -> Result<()> {
        let config = AppConfig::load(cli)?;

        if !skip_confirm {
            println!(
                "This will remove stale SSE buffers idle past {} seconds from the running server's \
                 in-memory state. It has no effect on persisted session/stream data, which expires \
                 on its own TTL.",
                DEFAULT_BACKPRESSURE_STALE_IDLE_SECS
            );
            print!("\nContinue? [y/N] ");
            std::io::Write::flush(&mut std::io::stdout())?;
            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;
            if !matches!(input.trim().to_lowercase().as_str(), "y" | "yes") {
                println!("Aborted.");
                return Ok(());
            }
        }

        let store = build_store_backend(&config.store, 1)
            .await
            .map_err(|e| anyhow::anyhow!("failed to initialize store backend: {}", e))?;
        store
            .health_check()
            .await
            .map_err(|e| anyhow::anyhow!("store health check failed: {}", e))?;

        println!("Store reachable at {}; nothing further to prune offline.", config.store.url);
        Ok(())
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_server(app: Self) -> Result<()> {
        // Install signal handlers FIRST (before any blocking calls)
        app.shutdown.install_signal_handlers();

        app.start_background_tasks().await?;

        let auth_enabled = !app.config.auth.api_keys.is_empty() || app.config.auth.jwt_secret.is_some();
        let store_backend = if app.config.store.url.starts_with("memory://") {
            "memory"
        } else {
            "redis"
        };
        banner::print_banner(
            &app.config.server.host,
            app.config.server.port,
            store_backend,
            auth_enabled,
        );

        let server = ApiServer::new(app);
        let app = server.start().await?;
        app.shutdown.shutdown().await;

        Ok(())
    }

    pub async fn start_background_tasks(&self) -> Result<()> {
        let backpressure = self.backpressure.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let sweep_interval = Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS);
        let stale_idle = Duration::from_secs(DEFAULT_BACKPRESSURE_STALE_IDLE_SECS);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = backpressure.cleanup_stale(stale_idle);
                        if removed > 0 {
                            tracing::debug!(removed, "swept stale sse buffers");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        self.shutdown.register(handle).await;
        self.start_worker_health_check().await;
        tracing::debug!("background tasks started");
        Ok(())
    }

    /// Lightweight internal task analogous to the original's Celery
    /// `health_check` task: periodically samples dispatcher saturation into
    /// a gauge, read back by `/readyz`. Not a public endpoint on its own.
    async fn start_worker_health_check(&self) {
        let dispatcher = self.dispatcher.clone();
        let metrics = self.metrics.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval = Duration::from_secs(DEFAULT_WORKER_HEALTH_CHECK_INTERVAL_SECS);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let saturated = dispatcher.is_saturated();
                        metrics.set_worker_dispatch_saturated(saturated);
                        if saturated {
                            tracing::warn!("worker dispatch queue saturated");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        self.shutdown.register(handle).await;
    }
}
