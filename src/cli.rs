//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Resilience Core - backoff, circuit breaking and breaker-gated rate limiting
#[derive(Parser, Debug)]
#[command(name = "resilience-core")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "RESILIENCE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "RESILIENCE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "RESILIENCE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the rate-limited HTTP server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "RESILIENCE_PORT")]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long, env = "RESILIENCE_HOST")]
        host: Option<String>,
    },

    /// Print the delay schedule of the configured backoff strategy
    Backoff {
        /// Number of retries to show
        #[arg(short, long, default_value_t = 5)]
        attempts: u32,
    },

    /// Resolve a client identity the way the rate limiter would
    Resolve {
        /// Transport peer address (`ip`, `ip:port` or `[v6]:port`)
        #[arg(long, required = true)]
        peer: String,

        /// Raw `X-Forwarded-For` value
        #[arg(long)]
        forwarded: Option<String>,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,
}
