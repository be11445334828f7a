use axum::extract::{Query, State};
use axum::{routing::post, Json, Router};
use serde::Deserialize;

use cascade::SweepReport;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SweepParams {
    #[serde(default)]
    pub dry_run: bool,
}

async fn sweep(
    State(state): State<AppState>,
    Query(params): Query<SweepParams>,
) -> ApiResult<Json<SweepReport>> {
    let report = state.sweeper.sweep(params.dry_run).await?;
    if !params.dry_run && !report.requeued.is_empty() {
        state.wake_workers();
    }
    Ok(Json(report))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/sweep", post(sweep))
}
