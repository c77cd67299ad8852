//! HTTP surface of the cache
//!
//! `GET /screenshot?url=` answers with the artifact location as JSON; clients
//! fetch the image from the store themselves.

use crate::{CacheError, CacheService, Environment, MetricsSnapshot};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

pub const MISSING_URL_MESSAGE: &str = "Missing 'url' query parameter";

pub const INVALID_QUERY_MESSAGE: &str = "Invalid query string";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service: CacheService,
    pub environment: Environment,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(service: CacheService, environment: Environment) -> Self {
        Self {
            service,
            environment,
            prometheus: None,
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

pub fn router(state: AppState, cors: bool) -> Router {
    let router = Router::new()
        .route("/screenshot", get(screenshot))
        .route("/healthz", get(health))
        .route("/metrics", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http());

    let router = if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    router.with_state(state)
}

/// Bind, serve until SIGINT/SIGTERM, then drain in-flight requests.
pub async fn serve(state: AppState, addr: SocketAddr, cors: bool) -> anyhow::Result<()> {
    let app = router(state, cors);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(addr = %addr, "Starting HTTP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[derive(Debug, Deserialize)]
struct ScreenshotParams {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotResponse {
    image_url: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<ErrorDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    message: String,
}

impl ErrorResponse {
    fn bad_request(message: &str) -> Response {
        let body = Self {
            error: message.to_string(),
            details: None,
            retryable: None,
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }

    fn from_cache_error(err: &CacheError, environment: Environment) -> Response {
        let (error, details) = match err {
            CacheError::InvalidInput(message) => return Self::bad_request(message),
            CacheError::Generation(gen) => (
                "Failed to generate screenshot",
                Some(ErrorDetails {
                    kind: gen.kind(),
                    phase: Some(gen.phase()),
                    status: gen.status(),
                    message: gen.to_string(),
                }),
            ),
            CacheError::StoreWrite(store) => (
                "Failed to store screenshot",
                Some(ErrorDetails {
                    kind: "StoreWriteError",
                    phase: None,
                    status: None,
                    message: store.to_string(),
                }),
            ),
            CacheError::Configuration(message) => (
                "Screenshot service is misconfigured",
                (!environment.is_production()).then(|| ErrorDetails {
                    kind: "ConfigurationError",
                    phase: None,
                    status: None,
                    message: message.clone(),
                }),
            ),
        };

        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Self {
            error: error.to_string(),
            details,
            retryable: Some(err.is_retryable()),
        };
        (status, Json(body)).into_response()
    }
}

async fn screenshot(
    State(state): State<AppState>,
    query: Result<Query<ScreenshotParams>, QueryRejection>,
) -> Response {
    let params = match query {
        Ok(Query(params)) => params,
        Err(rejection) => {
            debug!("Rejected query string: {}", rejection.body_text());
            return ErrorResponse::bad_request(INVALID_QUERY_MESSAGE);
        }
    };

    let url = match params.url.as_deref() {
        Some(url) if !url.is_empty() => url,
        _ => return ErrorResponse::bad_request(MISSING_URL_MESSAGE),
    };

    match state.service.get_or_create(url).await {
        Ok(outcome) => {
            info!(url, status = ?outcome.status, location = %outcome.location, "Screenshot served");
            Json(ScreenshotResponse {
                image_url: outcome.location.into_string(),
            })
            .into_response()
        }
        Err(e) => {
            error!(url, severity = ?e.severity(), "Screenshot request failed: {}", e);
            ErrorResponse::from_cache_error(&e, state.environment)
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    in_flight: usize,
    stats: MetricsSnapshot,
    checked_at: DateTime<Utc>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        in_flight: state.service.in_flight(),
        stats: state.service.metrics().snapshot(),
        checked_at: Utc::now(),
    })
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter disabled").into_response(),
    }
}
