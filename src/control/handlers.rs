//! HTTP API handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::server::AppState;
use crate::config::ReceiverConfig;
use crate::error::{Error, SessionError};
use crate::session::SessionSnapshot;

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Receiver status
#[derive(Serialize)]
pub struct ReceiverStatus {
    pub uptime_seconds: u64,
    pub loss_rate: f64,
    pub session: SessionSnapshot,
}

/// Get receiver status and counters
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<ReceiverStatus>> {
    let session = state.session.lock().snapshot();
    let status = ReceiverStatus {
        uptime_seconds: state.started_at.elapsed().as_secs(),
        loss_rate: session.stats.loss_rate(),
        session,
    };
    Json(ApiResponse::ok(status))
}

/// Optional overrides of the configured data socket
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
}

/// Start the session
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    request: Option<Json<StartRequest>>,
) -> (StatusCode, Json<ApiResponse<SocketAddr>>) {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let address = request.address.unwrap_or(state.config.network.bind_address);
    let port = request.port.unwrap_or(state.config.network.data_port);

    let result = state
        .session
        .lock()
        .start(address, port, state.ticks.subscribe());
    match result {
        Ok(local) => (StatusCode::OK, Json(ApiResponse::ok(local))),
        Err(e) => {
            let status = match e {
                Error::Session(SessionError::AlreadyRunning) => StatusCode::CONFLICT,
                Error::Session(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// Stop the session; a no-op when idle
pub async fn stop_session(State(state): State<Arc<AppState>>) -> Json<ApiResponse<()>> {
    state.session.lock().stop();
    Json(ApiResponse::ok(()))
}

/// Zero the session counters
pub async fn reset_stats(State(state): State<Arc<AppState>>) -> Json<ApiResponse<()>> {
    state.session.lock().reset_stats();
    Json(ApiResponse::ok(()))
}

/// Get the loaded configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ApiResponse<ReceiverConfig>> {
    Json(ApiResponse::ok(state.config.clone()))
}
