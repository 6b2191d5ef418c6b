//! API surface: HTTP routes and the WebSocket hub

pub mod auth;
pub mod middleware;
pub mod rate_limit;
pub mod routes;
pub mod server;
pub mod types;
pub mod ws;

use std::sync::Arc;

pub use auth::{AuthVerifier, Identity};
pub use server::ApiServer;
pub use ws::SocketHub;

use crate::core::config::AppConfig;
use crate::data::cache::{CacheService, RateLimiter};
use crate::data::files::FileService;
use crate::data::sqlite::SqliteService;
use crate::data::streams::StreamService;
use crate::domain::gateway::MessageStoreGateway;
use crate::domain::ingest::IngestService;
use crate::domain::presence::PresenceRegistry;
use crate::domain::rooms::RoomRegistry;
use crate::domain::status::StatusTracker;
use crate::domain::workers::{DlqMonitor, StreamMonitor, Supervisor};

/// Explicit wiring of the core components, passed to every handler.
/// There is no other process-wide state.
pub struct CoreContext {
    pub config: AppConfig,
    pub streams: Arc<StreamService>,
    pub cache: Arc<CacheService>,
    pub store: Arc<SqliteService>,
    pub gateway: Arc<MessageStoreGateway>,
    pub presence: Arc<PresenceRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub ingest: Arc<IngestService>,
    pub status: Arc<StatusTracker>,
    pub files: Arc<FileService>,
    pub hub: Arc<SocketHub>,
    pub rate_limiter: Arc<RateLimiter>,
    pub auth: Arc<AuthVerifier>,
    pub supervisor: Arc<Supervisor>,
    pub dlq: Arc<DlqMonitor>,
    pub stream_monitor: Arc<StreamMonitor>,
}
