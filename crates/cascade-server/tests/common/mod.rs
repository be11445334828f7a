#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use cascade::collaborator::{RephraseRequest, StepRequest};
use cascade::{
    CollaboratorError, ContentRecord, ContentStore, ContinuationQueue, Database, Dimension,
    Generator, JobProgressBroadcaster, NoopTrigger, Orchestrator, OrchestratorSettings, Sweeper,
};
use cascade_server::{build_router, AppState};

/// Returns the same object for every step.
pub struct FixedGenerator;

#[async_trait]
impl Generator for FixedGenerator {
    async fn produce(&self, request: &StepRequest) -> Result<String, CollaboratorError> {
        Ok(json!({ "title": format!("{} ({})", request.source_title, request.key.dimension) })
            .to_string())
    }

    async fn rephrase(&self, request: &RephraseRequest) -> Result<String, CollaboratorError> {
        Ok(format!("{} {}", request.title, request.attempt))
    }
}

pub struct TestApp {
    pub state: AppState,
    pub db: Database,
}

impl TestApp {
    pub fn new() -> Self {
        let db = Database::open_in_memory().unwrap();
        let progress = JobProgressBroadcaster::default();
        let settings = OrchestratorSettings {
            unit_delay: Duration::ZERO,
            ..Default::default()
        };
        let orchestrator = Arc::new(
            Orchestrator::builder(db.clone(), Arc::new(FixedGenerator))
                .settings(settings)
                .progress(Arc::new(progress.clone()))
                .build(),
        );
        let queue = ContinuationQueue::new(db.clone(), Arc::new(cascade::SystemClock));
        let sweeper = Arc::new(
            Sweeper::new(
                orchestrator.jobs().clone(),
                Arc::new(NoopTrigger),
                Duration::from_secs(600),
            )
            .with_queue(queue.clone()),
        );
        Self {
            state: AppState {
                orchestrator,
                sweeper,
                queue,
                progress,
                waker: None,
            },
            db,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Inserts a source unit in `en` for scope `cluster-1`.
    pub fn seed_source(&self, id: &str, title: &str) {
        let now = Utc::now();
        self.state
            .orchestrator
            .store()
            .insert(&ContentRecord {
                id: id.to_string(),
                scope_id: "cluster-1".to_string(),
                dimension: Dimension::new("en"),
                sub_type: "article".to_string(),
                parent_content_id: None,
                ordinal: 0,
                grouping_key: None,
                slug: format!("{}-en", id),
                title: title.to_string(),
                body: json!({ "title": title }),
                link_id: None,
                translations: BTreeMap::new(),
                created_at: now,
                updated_at: now,
            })
            .unwrap();
    }
}

pub fn new_job_body() -> Value {
    json!({
        "pipeline": "cluster_translation",
        "scope_id": "cluster-1",
        "source_dimension": "en",
        "dimensions": ["de", "fr"],
    })
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_raw(app: Router, uri: &str, body: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_empty(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
