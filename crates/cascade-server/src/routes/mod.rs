use axum::Router;

use crate::state::AppState;

pub mod health;
pub mod jobs;
pub mod orchestrate;
pub mod sweep;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(orchestrate::router())
        .merge(jobs::router())
        .merge(sweep::router())
}
