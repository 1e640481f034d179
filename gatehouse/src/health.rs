//! Health check handlers

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service name
    pub service: String,

    /// Version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Readiness response with buffer statistics
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub service: String,
    pub usage: UsageHealth,
}

/// Usage buffer health
#[derive(Debug, Serialize, Deserialize)]
pub struct UsageHealth {
    /// Records currently buffered
    pub queued: usize,
    /// Records shed because the queue was full
    pub dropped: u64,
}

/// Simple health check (liveness probe)
///
/// Always returns 200 OK if the service is running.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy".to_string(),
        service: state.config().service.name.clone(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };

    (StatusCode::OK, Json(response))
}

/// Readiness check (readiness probe)
///
/// The gateway has no hard boot-time dependencies; readiness reports the
/// usage buffer state so shed records are visible to operators.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let response = ReadinessResponse {
        ready: true,
        service: state.config().service.name.clone(),
        usage: UsageHealth {
            queued: state.usage().queued(),
            dropped: state.usage().dropped(),
        },
    };

    (StatusCode::OK, Json(response))
}
