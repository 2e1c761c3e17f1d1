//! Control server

use axum::{
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::handlers;
use crate::config::ReceiverConfig;
use crate::error::Error;
use crate::session::LinkSession;

/// Shared state of the HTTP handlers
pub struct AppState {
    pub session: Arc<Mutex<LinkSession>>,
    pub config: ReceiverConfig,
    /// Clock the session subscribes to on start
    pub ticks: broadcast::Sender<Instant>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        session: Arc<Mutex<LinkSession>>,
        config: ReceiverConfig,
        ticks: broadcast::Sender<Instant>,
    ) -> Self {
        Self {
            session,
            config,
            ticks,
            started_at: Instant::now(),
        }
    }
}

/// JSON API over the link session
pub struct ControlServer {
    state: Arc<AppState>,
    addr: SocketAddr,
}

impl ControlServer {
    pub fn new(state: AppState) -> Self {
        let telemetry = &state.config.telemetry;
        let addr = SocketAddr::new(telemetry.bind_address, telemetry.http_port);
        Self {
            state: Arc::new(state),
            addr,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/start", post(handlers::start_session))
            .route("/api/stop", post(handlers::stop_session))
            .route("/api/stats/reset", post(handlers::reset_stats))
            .route("/api/config", get(handlers::get_config))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Serve until the task is dropped
    pub async fn run(self) -> Result<(), Error> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "control server listening");
        axum::serve(listener, app).await?;
        Ok(())
    }
}
