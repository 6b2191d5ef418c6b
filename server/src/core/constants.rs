// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display and platform directories)
pub const APP_NAME: &str = "Courier";

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "courier";

/// Unix-style dotfile folder name
pub const APP_DOT_FOLDER: &str = ".courier";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "courier.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "COURIER_CONFIG";

// =============================================================================
// Environment Variables - Server
// =============================================================================

/// Environment variable for server host
pub const ENV_HOST: &str = "COURIER_HOST";

/// Environment variable for server port
pub const ENV_PORT: &str = "COURIER_PORT";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "COURIER_LOG";

/// Environment variable to override data directory
pub const ENV_DATA_DIR: &str = "COURIER_DATA_DIR";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port
pub const DEFAULT_PORT: u16 = 5480;

// =============================================================================
// Authentication
// =============================================================================

/// Environment variable for the HS256 secret used to verify identity claims
pub const ENV_AUTH_SECRET: &str = "COURIER_AUTH_SECRET";

/// How long a socket may stay connected without authenticating (ms)
pub const SOCKET_AUTH_TIMEOUT_MS: u64 = 10_000;

// =============================================================================
// SQLite Database
// =============================================================================

/// SQLite database filename
pub const SQLITE_DB_FILENAME: &str = "courier.db";

/// SQLite connection pool max connections
pub const SQLITE_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in seconds
pub const SQLITE_BUSY_TIMEOUT_SECS: u64 = 30;

/// SQLite cache size (negative = KB, so -64000 = 64MB)
pub const SQLITE_CACHE_SIZE: &str = "-64000";

/// SQLite WAL auto-checkpoint threshold (pages)
pub const SQLITE_WAL_AUTOCHECKPOINT: &str = "1000";

/// WAL checkpoint interval in seconds (5 minutes)
pub const SQLITE_CHECKPOINT_INTERVAL_SECS: u64 = 300;

// =============================================================================
// Stream Broker
// =============================================================================

/// Environment variable for stream/cache backend (memory or redis)
pub const ENV_BACKEND: &str = "COURIER_BACKEND";

/// Environment variable for Redis-compatible URL (streams + cache + presence)
pub const ENV_REDIS_URL: &str = "COURIER_REDIS_URL";

/// Default Redis URL (works with Redis, Valkey, Dragonfly)
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";

/// Approximate MAXLEN for the write-ahead streams (`wal:pre`, `wal:post`)
pub const STREAM_MAXLEN_WAL: u64 = 10_000;

/// Approximate MAXLEN for `retry:messages` and `fallback:messages`
pub const STREAM_MAXLEN_RETRY: u64 = 5_000;

/// Approximate MAXLEN for `dlq:messages`
pub const STREAM_MAXLEN_DLQ: u64 = 50_000;

/// Approximate MAXLEN for the `events:*` streams
pub const STREAM_MAXLEN_EVENTS: u64 = 5_000;

/// XREADGROUP block timeout in milliseconds
pub const STREAM_BLOCK_MS: u64 = 5_000;

/// Append retry budget for transient broker errors
pub const STREAM_APPEND_MAX_ATTEMPTS: u32 = 3;

/// Base delay for append retries in milliseconds (exponential)
pub const STREAM_APPEND_BASE_DELAY_MS: u64 = 100;

/// Pending records idle longer than this are re-claimable (ms)
pub const CLAIM_IDLE_MS: u64 = 60_000;

// =============================================================================
// Pipeline
// =============================================================================

/// A `wal:pre` entry older than this with no matching `wal:post` is
/// considered in-flight work lost to a crash (ms)
pub const WAL_TIMEOUT_MS: u64 = 30_000;

/// WAL recovery scan interval in seconds
pub const WAL_SCAN_INTERVAL_SECS: u64 = 60;

/// Maximum delivery attempts before a record is dead-lettered
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Base delay for worker retry backoff in milliseconds
pub const RETRY_BASE_DELAY_MS: u64 = 500;

/// Retry backoff cap in milliseconds
pub const RETRY_MAX_DELAY_MS: u64 = 30_000;

/// DLQ length above which the alert hook fires
pub const DLQ_ALERT_THRESHOLD: u64 = 1_000;

/// DLQ / monitor sampling interval in seconds
pub const MONITOR_INTERVAL_SECS: u64 = 30;

/// Streams are defensively trimmed above this fraction of their MAXLEN
pub const STREAM_PRESSURE_RATIO: f64 = 0.8;

/// Process RSS above this many bytes logs a warning (1 GB)
pub const MEMORY_WARN_BYTES: u64 = 1024 * 1024 * 1024;

/// Ingest path budget; past this the sender gets a QUEUED ack (ms)
pub const INGEST_TIMEOUT_MS: u64 = 10_000;

/// Maximum message content length in bytes
pub const MAX_CONTENT_LENGTH: usize = 16 * 1024;

/// Worker read batch size
pub const WORKER_BATCH_SIZE: usize = 64;

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Consecutive failures before the breaker opens
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

/// Time the breaker stays open before probing again (ms)
pub const CIRCUIT_RESET_MS: u64 = 30_000;

/// Probe calls admitted while half-open
pub const CIRCUIT_HALF_OPEN_MAX_CALLS: u32 = 3;

/// Per-call timeout applied inside the breaker (ms)
pub const STORE_CALL_TIMEOUT_MS: u64 = 5_000;

// =============================================================================
// Presence
// =============================================================================

/// Presence entry TTL past the last heartbeat (ms)
pub const PRESENCE_TTL_MS: u64 = 60_000;

/// Presence sweeper interval in seconds
pub const PRESENCE_SWEEP_INTERVAL_SECS: u64 = 30;

/// Staleness tolerance of the local presence read-through cache (ms)
pub const PRESENCE_LOCAL_CACHE_TTL_MS: u64 = 5_000;

// =============================================================================
// Sockets
// =============================================================================

/// Expected client ping interval (ms)
pub const SOCKET_PING_INTERVAL_MS: u64 = 25_000;

/// A socket with no inbound traffic for this long is closed (ms)
pub const SOCKET_PING_TIMEOUT_MS: u64 = 60_000;

/// Outbound per-connection queue capacity
pub const SOCKET_SEND_QUEUE: usize = 256;

// =============================================================================
// Files
// =============================================================================

/// Environment variable for file storage enabled
pub const ENV_FILES_ENABLED: &str = "COURIER_FILES_ENABLED";

/// Maximum accepted upload size (100 MB)
pub const MAX_FILE_SIZE_BYTES: u64 = 104_857_600;

// =============================================================================
// Cache
// =============================================================================

/// Environment variable for cache max entries
pub const ENV_CACHE_MAX_ENTRIES: &str = "COURIER_CACHE_MAX_ENTRIES";

/// Default cache max entries
pub const DEFAULT_CACHE_MAX_ENTRIES: u64 = 100_000;

/// Cache key version (bump on schema changes to invalidate all cached data)
pub const CACHE_KEY_VERSION: &str = "v1";

/// Cache TTL for conversation metadata (seconds)
pub const CACHE_TTL_CONVERSATION: u64 = 5;

// =============================================================================
// Rate Limiting
// =============================================================================

/// Environment variable for rate limit enabled
pub const ENV_RATE_LIMIT_ENABLED: &str = "COURIER_RATE_LIMIT_ENABLED";

/// Default message-send rate limit per identity (requests per minute)
pub const DEFAULT_RATE_LIMIT_MESSAGES_RPM: u32 = 600;

/// Default API rate limit per identity (requests per minute)
pub const DEFAULT_RATE_LIMIT_API_RPM: u32 = 1_000;

/// Default file upload rate limit per identity (requests per minute)
pub const DEFAULT_RATE_LIMIT_FILES_RPM: u32 = 60;

/// Rate limit window in seconds (fixed 1-minute window)
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

// =============================================================================
// Request Body Limits
// =============================================================================

/// Default body limit for general API requests (1 MB)
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Body limit for multipart file uploads (slightly above MAX_FILE_SIZE_BYTES)
pub const UPLOAD_BODY_LIMIT: usize = 105 * 1024 * 1024;

// =============================================================================
// Pagination
// =============================================================================

/// Default page size for message backfill
pub const DEFAULT_BACKFILL_LIMIT: u32 = 50;

/// Maximum page size for message backfill
pub const MAX_BACKFILL_LIMIT: u32 = 100;

// =============================================================================
// Shutdown
// =============================================================================

/// Graceful shutdown deadline for background workers in seconds
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;
