//! Job endpoints: submit, query, list, cancel

use super::error::ApiError;
use super::AppState;
use crate::events::Event;
use crate::store::{JobFilter, TransitionDetails};
use crate::types::{Job, JobId, JobSpec, JobState, JobTransition};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub history: Vec<JobTransition>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub owner: Option<String>,
    pub state: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub jobs: Vec<Job>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

fn validate_spec(state: &AppState, spec: &JobSpec) -> Result<(), ApiError> {
    if spec.resources.gpu_count == 0 {
        return Err(ApiError::invalid("resources.gpu_count must be positive"));
    }
    if spec.resources.memory_mb == 0 {
        return Err(ApiError::invalid("resources.memory_mb must be positive"));
    }
    if spec.resources.gpu_model.trim().is_empty() {
        return Err(ApiError::invalid("resources.gpu_model must be set"));
    }
    let config = state.config.snapshot();
    match config.templates.image_for(spec.kind) {
        Some(registered) if registered == spec.image => Ok(()),
        Some(registered) => Err(ApiError::invalid(format!(
            "image {} is not the registered template for kind {} (expected {registered})",
            spec.image,
            spec.kind.as_str()
        ))),
        None => Err(ApiError::invalid(format!(
            "no registered template for kind {}",
            spec.kind.as_str()
        ))),
    }
}

pub async fn submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(spec): Json<JobSpec>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let principal = state.authenticate(&headers)?;
    validate_spec(&state, &spec)?;

    // admission control: shed load before touching the queue
    let config = state.config.snapshot();
    let depth = state.store.queued_depth().await.map_err(ApiError::from)?;
    if depth as u64 >= config.server.admission_watermark {
        return Err(ApiError::rate_limited(config.scheduler.tick_interval_secs.max(1)));
    }

    let estimate = state.cost.submission_estimate(spec.kind);
    let owner_ceiling = state.cost.ceiling_for(&principal.subject);
    let ceiling = spec
        .cost_ceiling_cents
        .map_or(owner_ceiling, |job_ceiling| job_ceiling.min(owner_ceiling));

    let outcome = state
        .store
        .submit_job(&principal.subject, &spec, estimate, ceiling)
        .await
        .map_err(ApiError::from)?;

    if outcome.created {
        info!(job = %outcome.job.id, owner = %principal.subject, kind = spec.kind.as_str(),
              "job submitted");
        metrics::counter!("aimad_jobs_submitted_total").increment(1);
        state.bus.publish(Event::JobSubmitted {
            job_id: outcome.job.id,
        });
        Ok((StatusCode::CREATED, Json(outcome.job)))
    } else {
        Ok((StatusCode::OK, Json(outcome.job)))
    }
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JobDetail>, ApiError> {
    let principal = state.authenticate(&headers)?;
    let id: JobId = id
        .parse()
        .map_err(|_| ApiError::invalid("malformed job id"))?;
    let job = state.store.get_job(id).await.map_err(ApiError::from)?;
    if job.owner != principal.subject && !principal.admin {
        return Err(ApiError::forbidden("not your job"));
    }
    let history = state.store.job_history(id).await.map_err(ApiError::from)?;
    Ok(Json(JobDetail { job, history }))
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<JobList>, ApiError> {
    let principal = state.authenticate(&headers)?;
    let owner = match params.owner {
        Some(owner) if owner != principal.subject && !principal.admin => {
            return Err(ApiError::forbidden("cannot list other owners' jobs"));
        }
        Some(owner) => Some(owner),
        None if principal.admin => None,
        None => Some(principal.subject.clone()),
    };
    let state_filter = params
        .state
        .map(|s| s.parse::<JobState>())
        .transpose()
        .map_err(|e| ApiError::invalid(e))?;
    let filter = JobFilter {
        owner,
        state: state_filter,
    };
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let page = state
        .store
        .list_jobs(&filter, params.cursor.as_deref(), limit)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(JobList {
        jobs: page.jobs,
        next_cursor: page.next_cursor,
    }))
}

/// Request cancellation. Queued and unclaimed pending jobs cancel directly;
/// anything owned by a dispatcher gets a cancel event and winds down through
/// the control channel.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let principal = state.authenticate(&headers)?;
    let id: JobId = id
        .parse()
        .map_err(|_| ApiError::invalid("malformed job id"))?;
    let job = state.store.get_job(id).await.map_err(ApiError::from)?;
    if job.owner != principal.subject && !principal.admin {
        return Err(ApiError::forbidden("not your job"));
    }
    if job.state.is_terminal() {
        return Err(ApiError::new(
            super::error::ErrorCode::Conflict,
            format!("job already {}", job.state.as_str()),
        ));
    }

    let has_live_assignment = state
        .store
        .live_assignment_for_job(id)
        .await
        .map_err(ApiError::from)?
        .is_some();

    if job.state == JobState::Running || has_live_assignment {
        info!(job = %id, "cancel requested, forwarding to dispatcher");
        state.bus.publish(Event::JobCancelRequested { job_id: id });
        return Ok(StatusCode::ACCEPTED);
    }

    match state
        .store
        .transition_job(
            id,
            job.state,
            JobState::Cancelled,
            TransitionDetails::note("cancelled by user"),
        )
        .await
    {
        Ok(_) => {
            info!(job = %id, "job cancelled");
            state.bus.publish(Event::JobTransitioned {
                job_id: id,
                from: job.state,
                to: JobState::Cancelled,
            });
            Ok(StatusCode::OK)
        }
        Err(crate::error::OrchestratorError::Conflict { .. }) => {
            // moved under us, most likely to running; the dispatcher path
            // takes over
            state.bus.publish(Event::JobCancelRequested { job_id: id });
            Ok(StatusCode::ACCEPTED)
        }
        Err(e) => Err(ApiError::from(e)),
    }
}
