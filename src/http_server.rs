//! HTTP server implementation using Axum.

use crate::error::{ApiError, ErrorCode};
use crate::middleware::{cors_layer, security_headers};
use crate::proxy::{forward, Forward};
use crate::state::AppState;
use crate::webhook::{SVIX_ID, SVIX_SIGNATURE, SVIX_TIMESTAMP};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, RawQuery, State},
    http::{HeaderMap, Method},
    middleware,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Upload ceiling for extraction requests.
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        // Session and token lifecycle
        .route("/api/auth/session", get(session))
        .route("/api/auth/refresh", post(refresh_token))
        .route("/api/auth/status", get(auth_status))
        .route("/api/organizations", get(organizations))
        // File extraction
        .route("/api/extract", post(extract))
        .route("/api/results/:batch_id", get(results))
        // Identity provider webhooks
        .route("/api/webhooks/clerk", post(clerk_webhook))
        // Health check
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

/// Run the HTTP server on the configured port until a shutdown signal.
pub async fn run_server(state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let backend = state.config.backend_url.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(event = "gateway.started", addr = %addr, backend = %backend, "Starting gateway");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(event = "gateway.stopped", "Gateway shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(event = "gateway.signal.failed", error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!(event = "gateway.shutdown", signal = "ctrl_c", "Shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!(event = "gateway.shutdown", signal = "sigterm", "Shutting down");
            }
            Err(e) => {
                warn!(
                    event = "gateway.signal.failed",
                    error = %e,
                    "Failed to install SIGTERM handler"
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    forward(&state, Forward::new(Method::GET, "/api/v1/auth/session"), &headers, Bytes::new()).await
}

async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    forward(&state, Forward::new(Method::POST, "/api/v1/auth/refresh"), &headers, body).await
}

async fn auth_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    forward(&state, Forward::new(Method::GET, "/api/v1/auth/status"), &headers, Bytes::new()).await
}

async fn organizations(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let route = Forward::new(Method::GET, "/api/v1/organizations").query(query.as_deref());
    forward(&state, route, &headers, Bytes::new()).await
}

async fn extract(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    info!(event = "gateway.extract", bytes = body.len(), "Forwarding extraction upload");
    forward(&state, Forward::new(Method::POST, "/api/v1/extractor/extract"), &headers, body).await
}

async fn results(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    // Batch ids are opaque tokens; reject anything that could reshape the URL.
    let well_formed = !batch_id.is_empty()
        && batch_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !well_formed {
        return Err(ApiError::Validation("Invalid batch id".to_string()));
    }
    let route = Forward::new(Method::GET, format!("/api/v1/extractor/results/{}", batch_id))
        .not_found(ErrorCode::BatchNotFound);
    forward(&state, route, &headers, Bytes::new()).await
}

async fn clerk_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let verifier = state.webhook.as_ref().ok_or(ApiError::WebhookNotConfigured)?;
    if let Err(e) = verifier.verify(&headers, &body, chrono::Utc::now().timestamp()) {
        warn!(event = "webhook.rejected", error = %e, "Rejected webhook");
        return Err(e.into());
    }

    let route = Forward::new(Method::POST, "/api/v1/auth/clerk/webhook")
        .public()
        .pass_headers(&[SVIX_ID, SVIX_TIMESTAMP, SVIX_SIGNATURE]);
    forward(&state, route, &headers, body).await
}
