//! Provider status endpoints: breaker state, quota usage, health

use super::error::{ApiError, ErrorCode};
use super::AppState;
use crate::types::ProviderTag;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct ProviderStatus {
    pub tag: ProviderTag,
    pub circuit: &'static str,
    pub held_instances: i64,
    pub soft_quota: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<ProviderHealth>,
    pub cached_offer_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ProviderHealth {
    pub up: bool,
    pub latency_ms: u64,
}

async fn status_for(state: &AppState, tag: ProviderTag) -> Result<ProviderStatus, ApiError> {
    let handle = state
        .registry
        .get(tag)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, format!("provider {tag} not enabled")))?;
    let held = state
        .store
        .count_nonterminal(tag)
        .await
        .map_err(ApiError::from)?;
    Ok(ProviderStatus {
        tag,
        circuit: handle.breaker_state().as_str(),
        held_instances: held,
        soft_quota: handle.soft_quota(),
        health: handle.cached_health().map(|probe| ProviderHealth {
            up: probe.up,
            latency_ms: probe.observed_latency.as_millis() as u64,
        }),
        cached_offer_count: handle.cached_offers().len(),
    })
}

pub async fn list_providers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ProviderStatus>>, ApiError> {
    state.authenticate(&headers)?;
    let mut statuses = Vec::new();
    for tag in state.registry.tags() {
        statuses.push(status_for(&state, tag).await?);
    }
    Ok(Json(statuses))
}

pub async fn provider_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tag): Path<String>,
) -> Result<Json<ProviderStatus>, ApiError> {
    state.authenticate(&headers)?;
    let tag: ProviderTag = tag.parse().map_err(ApiError::invalid)?;
    Ok(Json(status_for(&state, tag).await?))
}
