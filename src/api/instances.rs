//! Instance inventory endpoints

use super::error::ApiError;
use super::AppState;
use crate::store::InstanceUpdate;
use crate::types::{Instance, InstanceId, InstanceState};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct InstanceListParams {
    pub state: Option<String>,
}

pub async fn list_instances(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<InstanceListParams>,
) -> Result<Json<Vec<Instance>>, ApiError> {
    state.authenticate(&headers)?;
    let state_filter = params
        .state
        .map(|s| s.parse::<InstanceState>())
        .transpose()
        .map_err(ApiError::invalid)?;
    let instances = state
        .store
        .list_instances(state_filter)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(instances))
}

pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Instance>, ApiError> {
    state.authenticate(&headers)?;
    let id: InstanceId = id
        .parse()
        .map_err(|_| ApiError::invalid("malformed instance id"))?;
    let instance = state.store.get_instance(id).await.map_err(ApiError::from)?;
    Ok(Json(instance))
}

/// Operator-initiated drain: no new work; the provisioner stops the instance
/// once the current assignment (if any) finishes.
pub async fn drain_instance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let principal = state.authenticate(&headers)?;
    if !principal.admin {
        return Err(ApiError::forbidden("drain requires the admin role"));
    }
    let id: InstanceId = id
        .parse()
        .map_err(|_| ApiError::invalid("malformed instance id"))?;
    state
        .store
        .transition_instance(
            id,
            InstanceState::Running,
            InstanceState::Draining,
            InstanceUpdate::default(),
        )
        .await
        .map_err(ApiError::from)?;
    info!(instance = %id, operator = %principal.subject, "admin drain");
    Ok(StatusCode::ACCEPTED)
}
