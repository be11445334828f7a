//! Test harness for orchestrator scenarios.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use cascade::collaborator::{RephraseRequest, StepRequest};
use cascade::retry::RetryPolicy;
use cascade::trigger::TriggerError;
use cascade::{
    Clock, CollaboratorError, ContentRecord, ContentStore, ContinuationTrigger, Database, Dimension,
    Generator, InvokeRequest, InvokeResponse, JobRecord, ManualClock, Orchestrator,
    OrchestratorSettings, ResumePointer,
};

use super::builders::{JobBuilder, SourceBuilder, SCOPE};

/// One scripted collaborator answer.
#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    Raw(String),
    Error(CollaboratorError),
}

/// A recorded `produce` call.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCall {
    pub parent: String,
    pub dimension: String,
    pub step: String,
    pub previous: Vec<String>,
}

/// A collaborator that answers from a script.
///
/// Unscripted calls get `{"title": "<source title> <dim>", "<step>": ...}`.
pub struct ScriptedGenerator {
    steps: Vec<String>,
    queued: Mutex<HashMap<(String, String), VecDeque<Reply>>>,
    always: Mutex<HashMap<String, Reply>>,
    rephrases: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<StepCall>>,
    rephrase_calls: Mutex<Vec<RephraseRequest>>,
    /// Clock reading at the start of every call, `produce` and `rephrase`.
    started: Mutex<Vec<DateTime<Utc>>>,
    /// Moves the clock forward on every call.
    tick: Option<(Arc<ManualClock>, Duration)>,
}

impl ScriptedGenerator {
    pub fn new(steps: &[&str]) -> Self {
        Self {
            steps: steps.iter().map(|s| s.to_string()).collect(),
            queued: Mutex::new(HashMap::new()),
            always: Mutex::new(HashMap::new()),
            rephrases: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            rephrase_calls: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            tick: None,
        }
    }

    pub fn ticking(mut self, clock: Arc<ManualClock>, per_call: Duration) -> Self {
        self.tick = Some((clock, per_call));
        self
    }

    /// Queues replies for the next calls on one unit.
    pub fn push(&self, parent: &str, dimension: &str, reply: Reply) {
        self.queued
            .lock()
            .unwrap()
            .entry((parent.to_string(), dimension.to_string()))
            .or_default()
            .push_back(reply);
    }

    /// Answers every call for `parent`, in any dimension, with `reply`.
    pub fn always(&self, parent: &str, reply: Reply) {
        self.always.lock().unwrap().insert(parent.to_string(), reply);
    }

    pub fn clear_always(&self, parent: &str) {
        self.always.lock().unwrap().remove(parent);
    }

    pub fn push_rephrase(&self, title: &str) {
        self.rephrases.lock().unwrap().push_back(title.to_string());
    }

    pub fn calls(&self) -> Vec<StepCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, parent: &str, dimension: &str) -> Vec<StepCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.parent == parent && c.dimension == dimension)
            .collect()
    }

    pub fn rephrase_calls(&self) -> Vec<RephraseRequest> {
        self.rephrase_calls.lock().unwrap().clone()
    }

    /// When each call started, on the manual clock. Empty unless ticking.
    pub fn call_starts(&self) -> Vec<DateTime<Utc>> {
        self.started.lock().unwrap().clone()
    }

    fn tick(&self) {
        if let Some((clock, by)) = &self.tick {
            self.started.lock().unwrap().push(clock.now());
            clock.advance(*by);
        }
    }

    fn default_reply(request: &StepRequest) -> Value {
        let mut body = serde_json::Map::new();
        body.insert(
            "title".to_string(),
            json!(format!("{} {}", request.source_title, request.key.dimension)),
        );
        body.insert(
            request.step.clone(),
            json!(format!("{} for {}", request.step, request.key.parent_content_id)),
        );
        Value::Object(body)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn steps(&self, _pipeline: &str) -> Vec<String> {
        self.steps.clone()
    }

    async fn produce(&self, request: &StepRequest) -> Result<String, CollaboratorError> {
        self.calls.lock().unwrap().push(StepCall {
            parent: request.key.parent_content_id.clone(),
            dimension: request.key.dimension.to_string(),
            step: request.step.clone(),
            previous: request.previous.keys().cloned().collect(),
        });
        self.tick();

        let parent = request.key.parent_content_id.clone();
        let reply = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&(parent.clone(), request.key.dimension.to_string()))
            .and_then(VecDeque::pop_front)
            .or_else(|| self.always.lock().unwrap().get(&parent).cloned());

        match reply {
            Some(Reply::Json(value)) => Ok(value.to_string()),
            Some(Reply::Raw(raw)) => Ok(raw),
            Some(Reply::Error(e)) => Err(e),
            None => Ok(Self::default_reply(request).to_string()),
        }
    }

    async fn rephrase(&self, request: &RephraseRequest) -> Result<String, CollaboratorError> {
        self.rephrase_calls.lock().unwrap().push(request.clone());
        self.tick();
        Ok(self
            .rephrases
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| format!("{} #{}", request.title, request.attempt)))
    }
}

/// Records every continuation instead of delivering it.
#[derive(Default)]
pub struct RecordingTrigger {
    fired: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingTrigger {
    pub fn fired(&self) -> Vec<(String, Option<String>)> {
        self.fired.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.fired.lock().unwrap().len()
    }
}

#[async_trait]
impl ContinuationTrigger for RecordingTrigger {
    async fn fire(
        &self,
        job_id: &str,
        pointer: Option<&ResumePointer>,
    ) -> Result<(), TriggerError> {
        self.fired
            .lock()
            .unwrap()
            .push((job_id.to_string(), pointer.map(|p| p.to_string())));
        Ok(())
    }
}

/// Settings for tests: no inter-unit delay, instant retries.
pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        unit_delay: Duration::ZERO,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        ..Default::default()
    }
}

/// Isolated orchestrator environment.
pub struct TestHarness {
    pub db: Database,
    pub clock: Arc<ManualClock>,
    pub generator: Arc<ScriptedGenerator>,
    pub trigger: Arc<RecordingTrigger>,
    pub orchestrator: Orchestrator,
}

impl TestHarness {
    /// Single-step pipeline, default caps.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            steps: vec!["content".to_string()],
            tick: None,
            settings: test_settings(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        self.orchestrator.store()
    }

    pub fn seed(&self, record: ContentRecord) -> ContentRecord {
        self.store().insert(&record).unwrap();
        record
    }

    /// Seeds `n` source articles `src-1..=n` in `en`.
    pub fn seed_sources(&self, n: usize) -> Vec<String> {
        (1..=n)
            .map(|i| {
                self.seed(
                    SourceBuilder::new(&format!("src-{}", i))
                        .title(&format!("Article {}", i))
                        .ordinal(i as i64)
                        .build(),
                )
                .id
            })
            .collect()
    }

    pub fn create_job(&self, dimensions: &[&str]) -> String {
        self.orchestrator
            .create_job(&JobBuilder::new().dimensions(dimensions).build())
            .unwrap()
            .id
    }

    pub async fn invoke(&self, job_id: &str) -> InvokeResponse {
        self.orchestrator.invoke(InvokeRequest::new(job_id)).await
    }

    pub async fn invoke_with(&self, request: InvokeRequest) -> InvokeResponse {
        self.orchestrator.invoke(request).await
    }

    /// Invokes again for as long as each invocation hands off, up to
    /// `max` invocations. Returns the last response.
    pub async fn run_to_end(&self, job_id: &str, max: usize) -> InvokeResponse {
        let mut invocations = 0;
        loop {
            let fired = self.trigger.count();
            let response = self.invoke(job_id).await;
            invocations += 1;
            if self.trigger.count() == fired || invocations >= max {
                return response;
            }
        }
    }

    pub fn job(&self, job_id: &str) -> JobRecord {
        self.orchestrator.get_job(job_id).unwrap().unwrap()
    }

    pub fn records_in(&self, dimension: &str) -> Vec<ContentRecord> {
        self.store()
            .records_in_dimension(SCOPE, &Dimension::new(dimension))
            .unwrap()
    }

    pub fn count_in(&self, dimension: &str) -> usize {
        self.records_in(dimension).len()
    }
}

pub struct HarnessBuilder {
    steps: Vec<String>,
    tick: Option<Duration>,
    settings: OrchestratorSettings,
}

impl HarnessBuilder {
    pub fn steps(mut self, steps: &[&str]) -> Self {
        self.steps = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Every collaborator call takes this long on the manual clock.
    pub fn call_duration(mut self, per_call: Duration) -> Self {
        self.tick = Some(per_call);
        self
    }

    pub fn max_units(mut self, n: usize) -> Self {
        self.settings.max_units = n;
        self
    }

    pub fn max_dimensions(mut self, n: usize) -> Self {
        self.settings.max_dimensions = n;
        self
    }

    pub fn time_budget(mut self, budget: Duration) -> Self {
        self.settings.time_budget = budget;
        self
    }

    pub fn max_unit_failures(mut self, n: u32) -> Self {
        self.settings.max_unit_failures = n;
        self
    }

    pub fn auto_continue(mut self, on: bool) -> Self {
        self.settings.auto_continue = on;
        self
    }

    pub fn build(self) -> TestHarness {
        let db = Database::open_in_memory().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));

        let steps: Vec<&str> = self.steps.iter().map(String::as_str).collect();
        let mut generator = ScriptedGenerator::new(&steps);
        if let Some(per_call) = self.tick {
            generator = generator.ticking(clock.clone(), per_call);
        }
        let generator = Arc::new(generator);
        let trigger = Arc::new(RecordingTrigger::default());

        let orchestrator = Orchestrator::builder(db.clone(), generator.clone())
            .clock(clock.clone())
            .trigger(trigger.clone())
            .settings(self.settings)
            .build();

        TestHarness {
            db,
            clock,
            generator,
            trigger,
            orchestrator,
        }
    }
}
