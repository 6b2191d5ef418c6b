use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::config::BackendType;
use super::constants::{
    ENV_AUTH_SECRET, ENV_BACKEND, ENV_CONFIG, ENV_FILES_ENABLED, ENV_HOST, ENV_PORT,
    ENV_RATE_LIMIT_ENABLED, ENV_REDIS_URL,
};

#[derive(Parser)]
#[command(name = "courier")]
#[command(version, about = "Resilient realtime messaging backend", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server host address
    #[arg(long, short = 'H', global = true, env = ENV_HOST)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', global = true, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Backend for streams, cache and presence (memory or redis)
    #[arg(long, global = true, env = ENV_BACKEND, value_parser = parse_backend_type)]
    pub backend: Option<BackendType>,

    /// Redis-compatible URL. Formats: redis://host:port/db, rediss://...
    #[arg(long, global = true, env = ENV_REDIS_URL)]
    pub redis_url: Option<String>,

    /// HS256 secret used to verify identity claims
    #[arg(long, global = true, env = ENV_AUTH_SECRET, hide_env_values = true)]
    pub auth_secret: Option<String>,

    /// Enable or disable rate limiting
    #[arg(long, global = true, env = ENV_RATE_LIMIT_ENABLED)]
    pub rate_limit_enabled: Option<bool>,

    /// Enable or disable file uploads
    #[arg(long, global = true, env = ENV_FILES_ENABLED)]
    pub files_enabled: Option<bool>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the server (default when no subcommand is given)
    Start,

    /// System maintenance commands
    System {
        #[command(subcommand)]
        command: SystemCommands,
    },
}

#[derive(Subcommand)]
pub enum SystemCommands {
    /// Delete the local data directory (database and stored files)
    Prune {
        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

/// CLI values that feed into config resolution
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    pub backend: Option<BackendType>,
    pub redis_url: Option<String>,
    pub auth_secret: Option<String>,
    pub rate_limit_enabled: Option<bool>,
    pub files_enabled: Option<bool>,
}

fn parse_backend_type(s: &str) -> Result<BackendType, String> {
    s.parse()
}

/// Parse command line arguments into config values and the chosen command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();

    (
        CliConfig {
            host: cli.host,
            port: cli.port,
            config: cli.config,
            backend: cli.backend,
            redis_url: cli.redis_url,
            auth_secret: cli.auth_secret,
            rate_limit_enabled: cli.rate_limit_enabled,
            files_enabled: cli.files_enabled,
        },
        cli.command,
    )
}
