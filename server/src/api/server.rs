//! API server initialization

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use tokio::net::TcpListener;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use super::CoreContext;
use super::auth::require_auth;
use super::middleware::{self, cors};
use super::rate_limit::{RateLimitState, rate_limit_middleware};
use super::routes::{conversations, files, health, messages};
use super::ws::ws_handler;
use crate::core::constants::{DEFAULT_BODY_LIMIT, UPLOAD_BODY_LIMIT};
use crate::core::shutdown::ShutdownService;
use crate::data::cache::RateLimitBucket;

pub struct ApiServer {
    ctx: Arc<CoreContext>,
    shutdown: ShutdownService,
}

impl ApiServer {
    pub fn new(ctx: Arc<CoreContext>, shutdown: ShutdownService) -> Self {
        Self { ctx, shutdown }
    }

    pub async fn start(self) -> Result<()> {
        let Self { ctx, shutdown } = self;

        let addr = SocketAddr::new(
            ctx.config.server.host.parse()?,
            ctx.config.server.port,
        );

        let rate_limit = |bucket: RateLimitBucket| RateLimitState {
            limiter: ctx.rate_limiter.clone(),
            bucket,
            enabled: ctx.config.rate_limit.enabled,
        };

        // Messages: send + backfill, rate limited per identity
        let messages_routes = Router::new()
            .route("/", post(messages::send_message).get(messages::list_messages))
            .layer(axum::middleware::from_fn_with_state(
                rate_limit(RateLimitBucket::messages(ctx.config.rate_limit.messages_rpm)),
                rate_limit_middleware,
            ));

        let conversations_routes = Router::new()
            .route(
                "/",
                get(conversations::list_conversations).post(conversations::create_conversation),
            )
            .route("/{id}", get(conversations::get_conversation))
            .route("/{id}/participants", post(conversations::add_participant))
            .route(
                "/{id}/participants/{user_id}",
                delete(conversations::remove_participant),
            )
            .layer(axum::middleware::from_fn_with_state(
                rate_limit(RateLimitBucket::api(ctx.config.rate_limit.api_rpm)),
                rate_limit_middleware,
            ));

        let files_routes = Router::new()
            .route("/", post(files::upload_file))
            .route("/{id}", get(files::get_file))
            .route("/{id}/download", get(files::download_file))
            .layer(axum::middleware::from_fn_with_state(
                rate_limit(RateLimitBucket::files(ctx.config.rate_limit.files_rpm)),
                rate_limit_middleware,
            ))
            .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT));

        // Everything except /health and the socket handshake requires a
        // verified identity claim
        let protected = Router::new()
            .nest("/messages", messages_routes)
            .nest("/conversations", conversations_routes)
            .nest("/files", files_routes)
            .route("/stats", get(health::stats))
            .layer(axum::middleware::from_fn(require_auth));

        let router = Router::new()
            .route("/api/v1/health", get(health::health))
            .nest("/api/v1", protected)
            .route("/ws", get(ws_handler))
            .fallback(middleware::handle_404)
            .layer(CompressionLayer::new())
            .layer(cors())
            .layer(TraceLayer::new_for_http())
            .layer(Extension(ctx.auth.clone()))
            .layer(DefaultBodyLimit::max(DEFAULT_BODY_LIMIT))
            .with_state(Arc::clone(&ctx));

        tracing::info!(
            addr = %addr,
            broker = ctx.streams.backend_name(),
            "Courier listening"
        );

        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(shutdown.wait())
            .await?;

        Ok(())
    }
}
