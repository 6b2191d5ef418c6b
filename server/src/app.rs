//! Core application
//!
//! Constructor wiring of the pipeline components, in dependency order:
//! store → cache → streams → breaker/gateway → presence/rooms →
//! ingest/status → hub → workers. The supervisor owns every background
//! task; shutdown is one signal.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::api::{ApiServer, AuthVerifier, CoreContext, SocketHub};
use crate::core::cli::{self, CliConfig, Commands, SystemCommands};
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::core::storage::AppStorage;
use crate::data::cache::{CacheService, RateLimiter};
use crate::data::files::FileService;
use crate::data::sqlite::SqliteService;
use crate::data::streams::StreamService;
use crate::domain::breaker::CircuitBreaker;
use crate::domain::gateway::MessageStoreGateway;
use crate::domain::ingest::IngestService;
use crate::domain::presence::PresenceRegistry;
use crate::domain::rooms::RoomRegistry;
use crate::domain::status::StatusTracker;
use crate::domain::workers::{
    DeliverySink, DlqMonitor, FallbackWorker, MemoryMonitor, MessageStreamConsumer, RetryWorker,
    StatusStreamConsumer, StreamMonitor, Supervisor, WalRecoveryWorker,
};

pub struct CoreApp {
    ctx: Arc<CoreContext>,
    shutdown: ShutdownService,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();

        match command {
            Some(Commands::System {
                command: system_cmd,
            }) => {
                return Self::handle_system_command(system_cmd);
            }
            Some(Commands::Start) | None => {}
        }

        let app = Self::init(&cli_config).await?;
        app.start_server().await
    }

    async fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;
        let storage = AppStorage::init(&config).await?;

        let store = Arc::new(
            SqliteService::init(&storage)
                .await
                .context("Failed to initialize message store")?,
        );

        let cache = Arc::new(
            CacheService::new(&config.backend)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to initialize cache: {e}"))?,
        );
        tracing::debug!(backend = cache.backend_name(), "Cache initialized");

        let streams = Arc::new(
            StreamService::from_config(&config.backend, config.streams.clone())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to initialize stream broker: {e}"))?,
        );
        tracing::debug!(backend = streams.backend_name(), "Streams initialized");

        let rate_limiter = Arc::new(RateLimiter::new(Arc::clone(&cache)));

        let breaker = Arc::new(CircuitBreaker::new(config.circuit.clone()));
        let gateway = Arc::new(MessageStoreGateway::new(
            Arc::clone(&store),
            breaker,
            config.circuit.call_timeout_ms,
        ));

        let presence = PresenceRegistry::new(
            Arc::clone(&cache),
            Arc::clone(&streams),
            config.presence.ttl_ms,
        );
        let rooms = RoomRegistry::new(Arc::clone(&gateway), Arc::clone(&streams));

        let files = Arc::new(FileService::new(
            config.files.clone(),
            &storage,
            Arc::clone(&gateway),
        ));

        let ingest = Arc::new(IngestService::new(
            Arc::clone(&streams),
            Arc::clone(&gateway),
            Arc::clone(&rooms),
            Arc::clone(&files),
            config.pipeline.clone(),
        ));
        let status = Arc::new(StatusTracker::new(
            Arc::clone(&gateway),
            Arc::clone(&rooms),
            Arc::clone(&streams),
        ));

        let hub = Arc::new(SocketHub::new());
        let auth = Arc::new(AuthVerifier::from_config(&config.auth));

        let shutdown = ShutdownService::new(Arc::clone(&store));
        let supervisor = Arc::new(Supervisor::new(shutdown.clone()));
        let dlq = DlqMonitor::new(Arc::clone(&streams), config.pipeline.dlq_alert_threshold);
        let stream_monitor = StreamMonitor::new(Arc::clone(&streams));

        let ctx = Arc::new(CoreContext {
            config,
            streams,
            cache,
            store,
            gateway,
            presence,
            rooms,
            ingest,
            status,
            files,
            hub,
            rate_limiter,
            auth,
            supervisor,
            dlq,
            stream_monitor,
        });

        Ok(Self { ctx, shutdown })
    }

    fn handle_system_command(cmd: SystemCommands) -> Result<()> {
        match cmd {
            SystemCommands::Prune { yes } => Self::prune_data(yes),
        }
    }

    fn prune_data(skip_confirm: bool) -> Result<()> {
        let data_dir = AppStorage::resolve_data_dir();

        if !data_dir.exists() {
            println!(
                "Nothing to prune. Data directory does not exist: {}",
                data_dir.display()
            );
            return Ok(());
        }

        let data_dir = data_dir.canonicalize().unwrap_or(data_dir);

        println!("This will permanently delete the local data directory:");
        println!("  {}", data_dir.display());
        println!();
        println!(
            "Make sure the server is not running. \
             Deleting data while the server is running will cause data corruption."
        );

        if !skip_confirm {
            print!("\nContinue? [y/N] ");
            std::io::Write::flush(&mut std::io::stdout())?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            if !matches!(input.trim().to_lowercase().as_str(), "y" | "yes") {
                println!("Aborted.");
                return Ok(());
            }
        }

        std::fs::remove_dir_all(&data_dir)
            .with_context(|| format!("Failed to delete data directory: {}", data_dir.display()))?;
        println!("Pruned: {}", data_dir.display());
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

    async fn start_server(self) -> Result<()> {
        // Install signal handlers FIRST (before any blocking calls)
        self.shutdown.install_signal_handlers();

        self.start_background_tasks().await;

        let server = ApiServer::new(Arc::clone(&self.ctx), self.shutdown.clone());
        server.start().await?;

        // Server returned: drain workers, close the store
        self.shutdown.shutdown().await;
        Ok(())
    }

    async fn start_background_tasks(&self) {
        let ctx = &self.ctx;
        let supervisor = &ctx.supervisor;

        self.shutdown
            .register(ctx.store.start_checkpoint_task(self.shutdown.subscribe()))
            .await;

        self.shutdown
            .register(ctx.presence.start_sweeper(self.shutdown.subscribe()))
            .await;

        supervisor.watch_breaker(ctx.gateway.breaker()).await;

        let retry = RetryWorker::new(
            Arc::clone(&ctx.streams),
            Arc::clone(&ctx.gateway),
            Arc::clone(&ctx.ingest),
            ctx.config.pipeline.clone(),
        );
        supervisor
            .supervise("retry", move |rx, metrics| {
                Arc::clone(&retry).run(rx, metrics)
            })
            .await;

        let fallback = FallbackWorker::new(
            Arc::clone(&ctx.streams),
            Arc::clone(&ctx.gateway),
            Arc::clone(&ctx.ingest),
            ctx.config.pipeline.clone(),
        );
        supervisor
            .supervise("fallback", move |rx, metrics| {
                Arc::clone(&fallback).run(rx, metrics)
            })
            .await;

        let wal_recovery = WalRecoveryWorker::new(
            Arc::clone(&ctx.streams),
            Arc::clone(&ctx.gateway),
            Arc::clone(&ctx.ingest),
            ctx.config.pipeline.clone(),
        );
        supervisor
            .supervise("wal-recovery", move |rx, metrics| {
                Arc::clone(&wal_recovery).run(rx, metrics)
            })
            .await;

        let sink: Arc<dyn DeliverySink> = Arc::clone(&ctx.hub) as Arc<dyn DeliverySink>;

        let dispatch = MessageStreamConsumer::new(
            Arc::clone(&ctx.streams),
            Arc::clone(&ctx.rooms),
            Arc::clone(&ctx.presence),
            Arc::clone(&ctx.gateway),
            Arc::clone(&sink),
            ctx.config.pipeline.clone(),
        );
        supervisor
            .supervise("dispatch", move |rx, metrics| {
                Arc::clone(&dispatch).run(rx, metrics)
            })
            .await;

        let status_consumer = StatusStreamConsumer::new(
            Arc::clone(&ctx.streams),
            Arc::clone(&ctx.rooms),
            Arc::clone(&ctx.presence),
            Arc::clone(&sink),
            ctx.config.pipeline.clone(),
        );
        supervisor
            .supervise("status", move |rx, metrics| {
                Arc::clone(&status_consumer).run(rx, metrics)
            })
            .await;

        let dlq = Arc::clone(&ctx.dlq);
        supervisor
            .supervise("dlq-monitor", move |rx, metrics| {
                Arc::clone(&dlq).run(rx, metrics)
            })
            .await;

        let stream_monitor = Arc::clone(&ctx.stream_monitor);
        supervisor
            .supervise("stream-monitor", move |rx, metrics| {
                Arc::clone(&stream_monitor).run(rx, metrics)
            })
            .await;

        let memory_monitor = MemoryMonitor::new();
        supervisor
            .supervise("memory-monitor", move |rx, metrics| {
                Arc::clone(&memory_monitor).run(rx, metrics)
            })
            .await;

        tracing::debug!("Background tasks started");
    }
}
