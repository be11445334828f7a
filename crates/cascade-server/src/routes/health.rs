use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    db_healthy: bool,
    queued_continuations: u64,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let queued = state.queue.len();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        db_healthy: queued.is_ok(),
        queued_continuations: queued.unwrap_or(0),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
