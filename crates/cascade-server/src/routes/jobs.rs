//! Job administration.

use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use cascade::{JobProgressEvent, JobRecord, JobStatus, NewJob};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub jobs: Vec<JobRecord>,
    pub total: u64,
}

#[derive(Debug, Deserialize)]
pub struct AbortParams {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DimensionSummary {
    pub dimension: String,
    pub expected: usize,
    pub actual: usize,
    pub missing: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ReconcileSummary {
    pub job_id: String,
    pub complete: bool,
    pub remaining: usize,
    pub dimensions: Vec<DimensionSummary>,
}

async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<NewJob>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let job = state.orchestrator.submit_job(&request).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<JobList>> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let (jobs, total) = state
        .orchestrator
        .list_jobs(status, params.limit.or(Some(50)), params.offset)?;
    Ok(Json(JobList { jobs, total }))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<JobRecord>> {
    let job = state
        .orchestrator
        .get_job(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("Job '{}' not found", id)))?;
    Ok(Json(job))
}

async fn abort_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<AbortParams>,
) -> ApiResult<Json<JobRecord>> {
    let reason = params
        .reason
        .unwrap_or_else(|| "Aborted by operator".to_string());
    Ok(Json(state.orchestrator.abort(&id, &reason)?))
}

async fn reconcile_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ReconcileSummary>> {
    let plan = state.orchestrator.reconcile(&id)?;
    Ok(Json(ReconcileSummary {
        job_id: id,
        complete: plan.is_complete(),
        remaining: plan.remaining(),
        dimensions: plan
            .dimensions
            .iter()
            .map(|d| DimensionSummary {
                dimension: d.dimension.to_string(),
                expected: d.expected,
                actual: d.actual,
                missing: d.missing.iter().map(|k| k.to_string()).collect(),
            })
            .collect(),
    }))
}

fn progress_event(event: &JobProgressEvent) -> Event {
    Event::default()
        .event("progress")
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event("error").data("unserializable event"))
}

/// Streams the job's progress: its current state first, then every update
/// until a terminal one.
async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    // Subscribe before reading, so no update slips between the two.
    let rx = state.progress.subscribe();
    let job = state
        .orchestrator
        .get_job(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("Job '{}' not found", id)))?;

    let initial = JobProgressEvent::from_job(&job);
    let finished = initial.is_terminal();
    let first = stream::once(async move { Ok::<_, Infallible>(progress_event(&initial)) });

    let updates = stream::unfold((rx, id, finished), |(mut rx, id, finished)| async move {
        if finished {
            return None;
        }
        loop {
            match rx.recv().await {
                Ok(event) if event.job_id == id => {
                    let terminal = event.is_terminal();
                    return Some((Ok(progress_event(&event)), (rx, id, terminal)));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    let lagged = Event::default()
                        .event("lagged")
                        .data(missed.to_string());
                    return Some((Ok(lagged), (rx, id, false)));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(first.chain(updates)).keep_alive(KeepAlive::default()))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/abort", post(abort_job))
        .route("/jobs/{id}/reconcile", post(reconcile_job))
        .route("/jobs/{id}/events", get(job_events))
}
