use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::medium::{DocumentMode, MediumError, RedisOptions, redis::DEFAULT_ADDR};

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// In-process table; contents are lost on exit.
    Memory,
    /// Networked document cache speaking the Redis protocol.
    Redis,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "voters",
    about = "Voter registry API",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP server (default).
    Run,

    /// Connect to the configured backend, report how many voters it holds and exit.
    Ping,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "VOTERS_BIND",
        value_name = "ADDR",
        default_value = "0.0.0.0:1080"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "VOTERS_BACKEND",
        value_name = "BACKEND",
        default_value = "redis",
        value_enum
    )]
    pub backend: Backend,

    #[arg(
        long = "redis-url",
        global = true,
        env = "REDIS_URL",
        value_name = "URL",
        default_value = DEFAULT_ADDR
    )]
    pub redis_url: String,

    #[arg(
        long = "redis-document-mode",
        global = true,
        env = "VOTERS_REDIS_DOCUMENT_MODE",
        value_name = "MODE",
        default_value = "json",
        value_enum
    )]
    pub redis_document_mode: DocumentMode,

    #[arg(
        long = "redis-connect-timeout-secs",
        global = true,
        env = "VOTERS_REDIS_CONNECT_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=60)
    )]
    pub redis_connect_timeout_secs: u64,

    #[arg(
        long = "redis-request-timeout-secs",
        global = true,
        env = "VOTERS_REDIS_REQUEST_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=60)
    )]
    pub redis_request_timeout_secs: u64,
}

impl Config {
    pub fn redis_options(&self) -> Result<RedisOptions, MediumError> {
        let mut options = RedisOptions::from_url(&self.redis_url)?;
        options.mode = self.redis_document_mode;
        options.connect_timeout = Duration::from_secs(self.redis_connect_timeout_secs);
        options.request_timeout = Duration::from_secs(self.redis_request_timeout_secs);
        Ok(options)
    }
}
