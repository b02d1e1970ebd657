//! API Server
//!
//! HTTP surface plus the background sweeper that closes abandoned casino
//! sessions and expires bonuses.

use super::{
    handlers::AppState,
    middleware::{create_cors_layer, request_id_middleware},
    routes::create_router,
};
use crate::config::LedgerConfig;
use crate::engine::LedgerEngine;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{signal, sync::watch, task::JoinHandle};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

pub struct ApiServer {
    config: LedgerConfig,
    engine: Arc<LedgerEngine>,
}

impl ApiServer {
    pub fn new(config: LedgerConfig, engine: Arc<LedgerEngine>) -> Self {
        Self { config, engine }
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let app = self.create_app();
        let addr = self.get_socket_addr()?;
        self.log_server_info(&addr);

        let (stop_tx, stop_rx) = watch::channel(false);
        let sweeper = spawn_sweeper(self.engine.clone(), self.config.sweep_interval(), stop_rx);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Wager ledger API listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        let _ = stop_tx.send(true);
        if let Err(e) = sweeper.await {
            warn!("Sweeper task ended abnormally: {}", e);
        }

        info!("API server stopped gracefully");
        Ok(())
    }

    /// Router with the middleware stack applied
    pub fn create_app(&self) -> axum::Router {
        let state = Arc::new(AppState {
            engine: self.engine.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });

        create_router(state)
            // Request ID middleware (first for tracing)
            .layer(axum::middleware::from_fn(request_id_middleware))
            // CORS layer (before timeout to handle preflight)
            .layer(create_cors_layer(self.config.api.allowed_origins.clone()))
            .layer(TimeoutLayer::new(Duration::from_secs(self.config.api.request_timeout_secs)))
            .layer(TraceLayer::new_for_http())
    }

    fn get_socket_addr(&self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        Ok(SocketAddr::from((
            self.config.api.host.parse::<std::net::IpAddr>()?,
            self.config.api.port,
        )))
    }

    fn log_server_info(&self, addr: &SocketAddr) {
        info!("Server configuration:");
        info!("   Listen: {}", addr);
        info!("   Database: {}", self.config.storage.data_directory);
        info!("   CORS: {:?}", self.config.api.allowed_origins);
        info!("   Request timeout: {}s", self.config.api.request_timeout_secs);
        info!("   Provider: {}", self.config.casino.provider_url);
        info!("   Sweep interval: {}s", self.config.sweep_interval().as_secs());
        info!("   Metrics enabled: {}", self.config.monitoring.enable_metrics);
        if self.config.api.api_key.is_none() {
            warn!("No API key configured; provider callbacks are unauthenticated");
        }
    }
}

/// Periodic maintenance until `stop` flips to true
pub fn spawn_sweeper(
    engine: Arc<LedgerEngine>,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let engine = engine.clone();
                    match tokio::task::spawn_blocking(move || engine.run_maintenance()).await {
                        Ok(Ok(report)) => {
                            if report.casino.settled + report.casino.closed_idle + report.bonuses.expired > 0 {
                                info!(
                                    casino_settled = report.casino.settled,
                                    casino_closed = report.casino.closed_idle,
                                    bonuses_expired = report.bonuses.expired,
                                    locks_released = report.bonuses.locks_released,
                                    bonus_forfeited = report.bonuses.forfeited,
                                    "Maintenance pass complete"
                                );
                            }
                        }
                        Ok(Err(e)) => error!("Maintenance pass failed: {}", e),
                        Err(e) => error!("Maintenance task panicked: {}", e),
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
