//! Resilience Core - operator CLI and demo server

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use resilience_core::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    security::{TrustedProxies, resolve},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Backoff { attempts }) => run_backoff(&config, attempts),
        Some(Command::Resolve { peer, forwarded }) => {
            run_resolve(&config, &peer, forwarded.as_deref())
        }
        Some(Command::CheckConfig) => run_check_config(&config),
        Some(Command::Serve { port, host }) => run_server(config, port, host).await,
        None => run_server(config, None, None).await,
    }
}

/// Print the configured backoff schedule
fn run_backoff(config: &Config, attempts: u32) -> ExitCode {
    let strategy = config.retry.backoff.build();
    println!("Backoff: {strategy:?}");
    println!(
        "Max retries: {} (total invocations <= {})\n",
        config.retry.max_attempts,
        config.retry.max_attempts.saturating_add(1)
    );
    for attempt in 0..attempts {
        let delay = strategy.next_delay(attempt);
        println!("  retry {:>3}: {delay:?}", attempt + 1);
    }
    ExitCode::SUCCESS
}

/// Print how a peer/header pair resolves
fn run_resolve(config: &Config, peer: &str, forwarded: Option<&str>) -> ExitCode {
    let trusted = TrustedProxies::parse(&config.rate_limit.trusted_proxies);
    let identity = resolve(peer, forwarded, &trusted);

    match serde_json::to_string_pretty(&identity) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("❌ Failed to serialize identity: {e}");
            return ExitCode::FAILURE;
        }
    }
    if identity.spoofing_suspected() {
        println!("\n⚠️  Forwarded header from untrusted peer {peer} would be ignored");
    }
    ExitCode::SUCCESS
}

/// Print the effective configuration
fn run_check_config(config: &Config) -> ExitCode {
    match serde_json::to_string_pretty(config) {
        Ok(json) => {
            println!("✅ Configuration valid\n");
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to serialize configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the rate-limited server
async fn run_server(mut config: Config, port: Option<u16>, host: Option<String>) -> ExitCode {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        rate_limiting = config.rate_limit.enabled,
        "Starting resilience server"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}
