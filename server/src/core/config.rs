//! Application configuration
//!
//! Configuration is resolved in three layers, later layers winning:
//! 1. built-in defaults (constants.rs)
//! 2. JSON config file (`--config`, `COURIER_CONFIG`, or `courier.json` in
//!    the data directory)
//! 3. environment variables / CLI flags

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::cli::CliConfig;
use super::constants::{
    CIRCUIT_FAILURE_THRESHOLD, CIRCUIT_HALF_OPEN_MAX_CALLS, CIRCUIT_RESET_MS, CLAIM_IDLE_MS,
    DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_RATE_LIMIT_API_RPM,
    DEFAULT_RATE_LIMIT_FILES_RPM, DEFAULT_RATE_LIMIT_MESSAGES_RPM, DEFAULT_REDIS_URL,
    DLQ_ALERT_THRESHOLD, ENV_AUTH_SECRET, ENV_BACKEND, ENV_CACHE_MAX_ENTRIES, ENV_FILES_ENABLED,
    ENV_HOST, ENV_PORT, ENV_RATE_LIMIT_ENABLED, ENV_REDIS_URL, INGEST_TIMEOUT_MS,
    MAX_CONTENT_LENGTH, MAX_FILE_SIZE_BYTES, MAX_RETRY_ATTEMPTS, PRESENCE_TTL_MS,
    SOCKET_PING_INTERVAL_MS, SOCKET_PING_TIMEOUT_MS, STORE_CALL_TIMEOUT_MS, STREAM_MAXLEN_DLQ,
    STREAM_MAXLEN_EVENTS, STREAM_MAXLEN_RETRY, STREAM_MAXLEN_WAL, WAL_TIMEOUT_MS,
};

/// Shared backend selection for streams, cache and the presence registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Memory,
    Redis,
}

impl FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown backend '{other}' (expected memory or redis)")),
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret for verifying identity claims. When unset, a random
    /// per-process secret is generated and logged at startup (dev mode).
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub backend: BackendType,
    pub redis_url: Option<String>,
    pub cache_max_entries: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Memory,
            redis_url: None,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

impl BackendConfig {
    /// Redis URL, falling back to the default local instance
    pub fn redis_url(&self) -> &str {
        self.redis_url.as_deref().unwrap_or(DEFAULT_REDIS_URL)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamLimits {
    pub maxlen_wal: u64,
    pub maxlen_retry: u64,
    pub maxlen_dlq: u64,
    pub maxlen_events: u64,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            maxlen_wal: STREAM_MAXLEN_WAL,
            maxlen_retry: STREAM_MAXLEN_RETRY,
            maxlen_dlq: STREAM_MAXLEN_DLQ,
            maxlen_events: STREAM_MAXLEN_EVENTS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub wal_timeout_ms: u64,
    pub claim_idle_ms: u64,
    pub max_retry_attempts: u32,
    pub dlq_alert_threshold: u64,
    pub ingest_timeout_ms: u64,
    pub max_content_length: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            wal_timeout_ms: WAL_TIMEOUT_MS,
            claim_idle_ms: CLAIM_IDLE_MS,
            max_retry_attempts: MAX_RETRY_ATTEMPTS,
            dlq_alert_threshold: DLQ_ALERT_THRESHOLD,
            ingest_timeout_ms: INGEST_TIMEOUT_MS,
            max_content_length: MAX_CONTENT_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_max_calls: u32,
    pub call_timeout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: CIRCUIT_FAILURE_THRESHOLD,
            reset_timeout_ms: CIRCUIT_RESET_MS,
            half_open_max_calls: CIRCUIT_HALF_OPEN_MAX_CALLS,
            call_timeout_ms: STORE_CALL_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub ttl_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_ms: PRESENCE_TTL_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: SOCKET_PING_INTERVAL_MS,
            ping_timeout_ms: SOCKET_PING_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub enabled: bool,
    pub max_size_bytes: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_bytes: MAX_FILE_SIZE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub messages_rpm: u32,
    pub api_rpm: u32,
    pub files_rpm: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            messages_rpm: DEFAULT_RATE_LIMIT_MESSAGES_RPM,
            api_rpm: DEFAULT_RATE_LIMIT_API_RPM,
            files_rpm: DEFAULT_RATE_LIMIT_FILES_RPM,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub backend: BackendConfig,
    pub streams: StreamLimits,
    pub pipeline: PipelineConfig,
    pub circuit: CircuitConfig,
    pub presence: PresenceConfig,
    pub socket: SocketConfig,
    pub files: FilesConfig,
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    /// Load configuration: defaults → config file → env → CLI
    pub fn load(cli: &CliConfig) -> Result<Self> {
        let mut config = match Self::config_file_path(cli) {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                let config: AppConfig = serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid config file: {}", path.display()))?;
                tracing::debug!(path = %path.display(), "Config file loaded");
                config
            }
            _ => AppConfig::default(),
        };

        config.apply_env()?;
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    fn config_file_path(cli: &CliConfig) -> Option<PathBuf> {
        if let Some(path) = &cli.config {
            return Some(path.clone());
        }
        if let Ok(path) = std::env::var(super::constants::ENV_CONFIG) {
            return Some(PathBuf::from(path));
        }
        Some(
            super::storage::AppStorage::resolve_data_dir()
                .join(super::constants::CONFIG_FILE_NAME),
        )
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var(ENV_HOST) {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var(ENV_PORT) {
            self.server.port = port
                .parse()
                .with_context(|| format!("{ENV_PORT} must be a port number, got '{port}'"))?;
        }
        if let Ok(secret) = std::env::var(ENV_AUTH_SECRET) {
            self.auth.secret = Some(secret);
        }
        if let Ok(backend) = std::env::var(ENV_BACKEND) {
            self.backend.backend = backend.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        }
        if let Ok(url) = std::env::var(ENV_REDIS_URL) {
            self.backend.redis_url = Some(url);
        }
        if let Ok(entries) = std::env::var(ENV_CACHE_MAX_ENTRIES) {
            self.backend.cache_max_entries = entries.parse().with_context(|| {
                format!("{ENV_CACHE_MAX_ENTRIES} must be a number, got '{entries}'")
            })?;
        }
        if let Ok(enabled) = std::env::var(ENV_RATE_LIMIT_ENABLED) {
            self.rate_limit.enabled = parse_bool(&enabled);
        }
        if let Ok(enabled) = std::env::var(ENV_FILES_ENABLED) {
            self.files.enabled = parse_bool(&enabled);
        }
        Ok(())
    }

    fn apply_cli(&mut self, cli: &CliConfig) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(secret) = &cli.auth_secret {
            self.auth.secret = Some(secret.clone());
        }
        if let Some(backend) = cli.backend {
            self.backend.backend = backend;
        }
        if let Some(url) = &cli.redis_url {
            self.backend.redis_url = Some(url.clone());
        }
        if let Some(enabled) = cli.rate_limit_enabled {
            self.rate_limit.enabled = enabled;
        }
        if let Some(enabled) = cli.files_enabled {
            self.files.enabled = enabled;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.circuit.failure_threshold == 0 {
            anyhow::bail!("circuit.failure_threshold must be at least 1");
        }
        if self.pipeline.max_retry_attempts == 0 {
            anyhow::bail!("pipeline.max_retry_attempts must be at least 1");
        }
        if self.files.max_size_bytes == 0 {
            anyhow::bail!("files.max_size_bytes must be positive");
        }
        Ok(())
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_cli() -> CliConfig {
        CliConfig {
            host: None,
            port: None,
            config: None,
            backend: None,
            redis_url: None,
            auth_secret: None,
            rate_limit_enabled: None,
            files_enabled: None,
        }
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.backend.backend, BackendType::Memory);
        assert_eq!(config.streams.maxlen_wal, 10_000);
        assert_eq!(config.streams.maxlen_dlq, 50_000);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.pipeline.wal_timeout_ms, 30_000);
        assert_eq!(config.presence.ttl_ms, 60_000);
        assert_eq!(config.files.max_size_bytes, 104_857_600);
    }

    #[test]
    fn test_cli_overrides() {
        let mut cli = empty_cli();
        cli.host = Some("0.0.0.0".to_string());
        cli.port = Some(9000);
        cli.backend = Some(BackendType::Redis);

        let mut config = AppConfig::default();
        config.apply_cli(&cli);

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.backend.backend, BackendType::Redis);
    }

    #[test]
    fn test_config_file_parse() {
        let raw = r#"{
            "server": { "port": 6000 },
            "backend": { "backend": "redis", "redis_url": "redis://cache:6379/1" },
            "rate_limit": { "messages_rpm": 120 }
        }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.backend.backend, BackendType::Redis);
        assert_eq!(config.backend.redis_url(), "redis://cache:6379/1");
        assert_eq!(config.rate_limit.messages_rpm, 120);
        assert_eq!(config.rate_limit.api_rpm, DEFAULT_RATE_LIMIT_API_RPM);
    }

    #[test]
    fn test_backend_type_from_str() {
        assert_eq!("memory".parse::<BackendType>().unwrap(), BackendType::Memory);
        assert_eq!("REDIS".parse::<BackendType>().unwrap(), BackendType::Redis);
        assert!("kafka".parse::<BackendType>().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = AppConfig::default();
        config.circuit.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(parse_bool("YES"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
    }
}
