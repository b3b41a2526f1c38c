//! Rate-limited HTTP server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info};

use super::middleware::RateLimitState;
use super::router::{AppState, create_router};
use crate::config::Config;
use crate::failsafe::{MemoryQuotaStore, QuotaStore, RateLimitRule, RateLimiter};
use crate::{Error, Result};

/// How often idle buckets are swept from the in-memory store
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// HTTP server fronted by the rate limiter
pub struct Gateway {
    config: Config,
    store: Arc<MemoryQuotaStore>,
    limiter: Arc<RateLimiter>,
    rule: RateLimitRule,
}

impl Gateway {
    /// Build the limiter and its rule from `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the configured quota is not a valid rule.
    pub fn new(config: Config) -> Result<Self> {
        let rule = RateLimitRule::from_config(&config.rate_limit)?;
        let store = Arc::new(MemoryQuotaStore::new());
        let limiter = Arc::new(RateLimiter::new(
            &config.rate_limit,
            &config.circuit_breaker,
            Some(Arc::clone(&store) as Arc<dyn QuotaStore>),
        ));

        Ok(Self {
            config,
            store,
            limiter,
            rule,
        })
    }

    /// The limiter shared by all requests
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run until Ctrl+C or SIGTERM
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the listener fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        // Buckets idle for a full window have refilled and carry no state
        let store = Arc::clone(&self.store);
        let idle = self.rule.window().max(PURGE_INTERVAL);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        store.purge_idle(idle);
                        debug!(keys = store.len(), "Purged idle quota buckets");
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let state = Arc::new(AppState {
            limiter: Arc::clone(&self.limiter),
        });
        let app = create_router(
            state,
            RateLimitState::new(Arc::clone(&self.limiter), self.rule.clone()),
        );

        let listener = TcpListener::bind(addr).await?;
        info!(
            address = %addr,
            limit = self.rule.limit(),
            window = ?self.rule.window(),
            active = self.limiter.is_active(),
            "Listening"
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
