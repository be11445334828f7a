//! `POST /orchestrate`: one bounded invocation.
//!
//! Always answers 200. Callers, including the poller and the HTTP
//! continuation trigger, read the outcome from the body.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::{routing::post, Json, Router};

use cascade::{InvokeRequest, InvokeResponse, ResponseStatus};

use crate::state::AppState;

async fn orchestrate(
    State(state): State<AppState>,
    payload: Result<Json<InvokeRequest>, JsonRejection>,
) -> Json<InvokeResponse> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return Json(InvokeResponse::new(
                ResponseStatus::Failed,
                format!("Invalid request: {}", rejection.body_text()),
            ))
        }
    };
    Json(state.orchestrator.invoke(request).await)
}

pub fn router() -> Router<AppState> {
    Router::new().route("/orchestrate", post(orchestrate))
}
