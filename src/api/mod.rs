//! HTTP surface
//!
//! Bearer-authenticated JSON API over axum. Health and metrics are open;
//! everything else verifies the caller's token and applies a per-token rate
//! limit before touching the store.

mod auth;
mod error;
mod instances;
mod jobs;
mod providers;
mod ratelimit;

pub use auth::{AuthVerifier, Principal};
pub use error::{ApiError, ErrorCode};
pub use ratelimit::RateLimiter;

use crate::config::ConfigHandle;
use crate::cost::CostTracker;
use crate::events::EventBus;
use crate::providers::ProviderRegistry;
use crate::store::JobStore;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct AppState {
    pub store: JobStore,
    pub bus: EventBus,
    pub config: Arc<ConfigHandle>,
    pub cost: Arc<CostTracker>,
    pub registry: Arc<ProviderRegistry>,
    pub auth: AuthVerifier,
    pub limiter: RateLimiter,
    pub metrics: PrometheusHandle,
}

impl AppState {
    /// Verify the bearer token and charge the caller's rate-limit bucket.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, ApiError> {
        let principal = self.auth.authenticate(headers)?;
        if !self.limiter.check(&principal.subject) {
            return Err(ApiError::rate_limited(
                self.limiter.retry_after_secs(&principal.subject),
            ));
        }
        Ok(principal)
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit).get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job).delete(jobs::cancel_job))
        .route("/instances", get(instances::list_instances))
        .route("/instances/:id", get(instances::get_instance))
        .route("/instances/:id/drain", post(instances::drain_instance))
        .route("/providers", get(providers::list_providers))
        .route("/providers/:tag/status", get(providers::provider_status))
        .route("/health", get(health))
        .route("/metrics", get(metrics_scrape))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    ready: bool,
    store_reachable: bool,
    providers_usable: bool,
}

/// Liveness is this handler responding at all; readiness requires the store
/// and at least one usable provider (a non-open circuit, or the local pool).
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_reachable = state.store.ping().await;
    let providers_usable = state.registry.any_usable();
    let ready = store_reachable && providers_usable;
    let body = HealthBody {
        status: if ready { "ok" } else { "degraded" },
        ready,
        store_reachable,
        providers_usable,
    };
    let status = if ready {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn metrics_scrape(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}

/// Serve until the shutdown signal flips; stops accepting new connections,
/// lets in-flight requests finish.
pub async fn serve(
    state: Arc<AppState>,
    listener: tokio::net::TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let router = build_router(state);
    info!(addr = %listener.local_addr()?, "api listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
