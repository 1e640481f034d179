//! HTTP server: router assembly, middleware stack, graceful shutdown
//!
//! The consumer surface is `ANY /api/v1/gw/{connector}` and
//! `ANY /api/v1/gw/{connector}/{*path}` plus liveness and readiness
//! probes. Middleware (outermost first): panic recovery mapped onto the
//! error envelope, request-id generation and propagation, sensitive
//! header masking, request tracing, CORS.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::any, routing::get, Router};
use bytes::Bytes;
use http_body_util::Full;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    sensitive_headers::SetSensitiveRequestHeadersLayer,
    trace::TraceLayer,
};

use crate::error::{ErrorEnvelope, Result};
use crate::health;
use crate::pipeline;
use crate::state::AppState;
use crate::usage::UsageSink;

/// Headers masked in logs and trace output
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "x-api-key"];

/// Assemble the gateway router with the full middleware stack
pub fn build_router(state: AppState) -> Router {
    let sensitive = SENSITIVE_HEADERS
        .iter()
        .map(|h| h.parse().expect("valid header name"))
        .collect::<Vec<_>>();

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::readiness))
        .route("/api/v1/gw/{connector}", any(pipeline::gateway_root))
        .route("/api/v1/gw/{connector}/{*path}", any(pipeline::gateway_path))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(SetSensitiveRequestHeadersLayer::new(sensitive))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CatchPanicLayer::custom(handle_panic))
}

/// Map a handler panic onto the error envelope without leaking stack
/// details
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> http::Response<Full<Bytes>> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %detail, "request handler panicked");

    let envelope = ErrorEnvelope::new(
        "INTERNAL_ERROR",
        "internal server error",
        "unknown",
        "unknown",
    );
    let body = serde_json::to_string(&envelope)
        .unwrap_or_else(|_| r#"{"success":false}"#.to_string());

    http::Response::builder()
        .status(http::StatusCode::INTERNAL_SERVER_ERROR)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::from(body))
        .expect("static response")
}

/// Server instance
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Run until SIGINT/SIGTERM, then drain connections and the usage
    /// buffer
    pub async fn serve(self, sink: Arc<dyn UsageSink>) -> Result<()> {
        let config = self.state.config().clone();
        let addr = SocketAddr::from(([0, 0, 0, 0], config.service.port));

        let shutdown = CancellationToken::new();
        let worker = self.state.usage().spawn_worker(
            sink,
            config.usage.buffer_config(),
            shutdown.clone(),
        );

        let router = build_router(self.state);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(service = %config.service.name, %addr, "gateway listening");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        shutdown.cancel();
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "usage worker did not exit cleanly");
        }
        tracing::info!("server shutdown complete");
        Ok(())
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C");
        },
        _ = terminate => {
            tracing::info!("received termination signal");
        },
    }

    tracing::info!("shutdown signal received, draining connections");
}
