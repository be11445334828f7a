//! Idempotent unit writer.
//!
//! Writing the same unit twice never creates a second record. Locator
//! collisions are resolved in order: adopt an orphan, rephrase a semantic
//! duplicate, suffix from the unit's own identity.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::clock::Clock;
use crate::collaborator::{Generator, RephraseRequest};
use crate::guard::TimeoutGuard;
use crate::retry::{RetryError, RetryExecutor};
use crate::sanitize::{slugify, strip_quotes};
use crate::store::{ContentRecord, ContentStore, StoreError};
use crate::unit::{ProducedUnit, UnitKey};

/// Body fields that may carry a unit's display title, in lookup order.
pub const TITLE_FIELDS: [&str; 3] = ["title", "question", "headline"];

/// Numbered locator fallbacks tried after the identity suffix.
const MAX_NUMBERED_SLUGS: u32 = 20;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Content store error: {0}")]
    Store(#[from] StoreError),

    #[error("No free locator for unit '{key}'")]
    NoFreeSlug { key: String },

    /// The budget ran out before the next rephrase; nothing was written.
    #[error("Time budget spent while disambiguating unit '{key}'")]
    OutOfTime { key: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Inserted(ContentRecord),
    /// Written under a rephrased title after a semantic duplicate.
    Rephrased {
        record: ContentRecord,
        attempts: u32,
    },
    /// Written with an identity suffix on title or locator.
    Suffixed(ContentRecord),
    /// An orphan with the colliding locator was taken over.
    Adopted(ContentRecord),
    /// The unit already had a record; nothing was written.
    AlreadyPresent(ContentRecord),
}

impl WriteOutcome {
    pub fn record(&self) -> &ContentRecord {
        match self {
            WriteOutcome::Inserted(r)
            | WriteOutcome::Suffixed(r)
            | WriteOutcome::Adopted(r)
            | WriteOutcome::AlreadyPresent(r) => r,
            WriteOutcome::Rephrased { record, .. } => record,
        }
    }

    /// Whether this call created or changed a record.
    pub fn wrote(&self) -> bool {
        !matches!(self, WriteOutcome::AlreadyPresent(_))
    }
}

/// Locator for a title in a dimension: `<slug>-<dimension>`.
pub fn locator_for(title: &str, key: &UnitKey) -> String {
    let body = slugify(title);
    if body.is_empty() {
        format!("{}-{}", key.fingerprint(), key.dimension)
    } else {
        format!("{}-{}", body, key.dimension)
    }
}

/// Replaces the first title-bearing field of an object body.
pub fn set_title_field(body: &mut Value, title: &str) {
    if let Some(map) = body.as_object_mut() {
        for field in TITLE_FIELDS {
            if let Some(Value::String(s)) = map.get_mut(field) {
                *s = title.to_string();
                return;
            }
        }
    }
}

fn same_text(a: &str, b: &str) -> bool {
    slugify(a) == slugify(b)
}

pub struct UnitWriter {
    store: Arc<dyn ContentStore>,
    generator: Arc<dyn Generator>,
    retry: RetryExecutor,
    clock: Arc<dyn Clock>,
    rephrase_attempts: u32,
}

impl UnitWriter {
    pub fn new(
        store: Arc<dyn ContentStore>,
        generator: Arc<dyn Generator>,
        retry: RetryExecutor,
        clock: Arc<dyn Clock>,
        rephrase_attempts: u32,
    ) -> Self {
        Self {
            store,
            generator,
            retry,
            clock,
            rephrase_attempts,
        }
    }

    /// Rephrase calls are only started while `guard` has budget left.
    pub async fn write(
        &self,
        unit: &ProducedUnit,
        guard: &TimeoutGuard,
    ) -> Result<WriteOutcome, WriteError> {
        if let Some(existing) = self.store.find_by_key(&unit.key)? {
            log::debug!("Unit {} already present as {}", unit.key, existing.id);
            return Ok(WriteOutcome::AlreadyPresent(existing));
        }

        let slug = locator_for(&unit.title, &unit.key);
        let Some(existing) = self.store.find_by_slug(&slug)? else {
            return match self.insert(unit, &unit.title, slug) {
                Ok(Some(record)) => Ok(WriteOutcome::Inserted(record)),
                Ok(None) => self.present(unit),
                // Lost a race for the locator.
                Err(WriteError::Store(StoreError::DuplicateSlug { .. })) => self
                    .insert_with_fallback_slugs(unit, &unit.title)
                    .map(WriteOutcome::Suffixed),
                Err(e) => Err(e),
            };
        };

        if self.is_orphan_for(&existing, unit) {
            return self.adopt(existing, unit).map(WriteOutcome::Adopted);
        }

        if same_text(&existing.title, &unit.title) {
            return self.disambiguate(unit, guard).await;
        }

        // Different text that happens to share a locator (truncation).
        self.insert_with_fallback_slugs(unit, &unit.title)
            .map(WriteOutcome::Suffixed)
    }

    fn present(&self, unit: &ProducedUnit) -> Result<WriteOutcome, WriteError> {
        match self.store.find_by_key(&unit.key)? {
            Some(r) => Ok(WriteOutcome::AlreadyPresent(r)),
            None => Err(WriteError::NoFreeSlug {
                key: unit.key.to_string(),
            }),
        }
    }

    fn is_orphan_for(&self, existing: &ContentRecord, unit: &ProducedUnit) -> bool {
        existing.parent_content_id.is_none()
            && existing.dimension == unit.key.dimension
            && existing.scope_id == unit.scope_id
            && existing
                .grouping_key
                .as_deref()
                .map_or(true, |g| g == unit.grouping_key)
    }

    fn adopt(
        &self,
        mut orphan: ContentRecord,
        unit: &ProducedUnit,
    ) -> Result<ContentRecord, WriteError> {
        log::info!("Adopting orphan {} for unit {}", orphan.id, unit.key);
        orphan.parent_content_id = Some(unit.key.parent_content_id.clone());
        orphan.sub_type = unit.key.sub_type.clone();
        orphan.grouping_key = Some(unit.grouping_key.clone());
        orphan.ordinal = unit.ordinal;
        orphan.title = unit.title.clone();
        orphan.body = unit.body.clone();
        orphan.link_id = unit.link_id.clone();
        orphan.updated_at = self.clock.now();
        self.store.replace(&orphan)?;
        Ok(orphan)
    }

    /// Titles in use in the unit's dimension.
    fn taken_titles(&self, unit: &ProducedUnit) -> Result<Vec<String>, WriteError> {
        Ok(self
            .store
            .records_in_dimension(&unit.scope_id, &unit.key.dimension)?
            .into_iter()
            .map(|r| r.title)
            .collect())
    }

    async fn disambiguate(
        &self,
        unit: &ProducedUnit,
        guard: &TimeoutGuard,
    ) -> Result<WriteOutcome, WriteError> {
        let mut taken = self.taken_titles(unit)?;

        for attempt in 1..=self.rephrase_attempts {
            if guard.exceeded() {
                return Err(WriteError::OutOfTime {
                    key: unit.key.to_string(),
                });
            }
            let request = RephraseRequest {
                key: unit.key.clone(),
                title: unit.title.clone(),
                taken: taken.clone(),
                attempt,
            };
            let generator = &self.generator;
            let label = format!("rephrase {} (attempt {})", unit.key, attempt);
            let raw = match self
                .retry
                .run(&label, |_| generator.rephrase(&request))
                .await
            {
                Ok(raw) => raw,
                Err(e @ RetryError::Fatal { .. }) => {
                    log::warn!("Rephrase of {} failed: {}", unit.key, e);
                    break;
                }
                Err(e) => {
                    log::warn!("Rephrase of {} failed: {}", unit.key, e);
                    continue;
                }
            };

            let candidate = strip_quotes(&raw);
            if candidate.is_empty() || taken.iter().any(|t| same_text(t, &candidate)) {
                log::debug!("Rephrase attempt {} for {} still collides", attempt, unit.key);
                taken.push(candidate);
                continue;
            }

            let slug = locator_for(&candidate, &unit.key);
            if self.store.find_by_slug(&slug)?.is_some() {
                taken.push(candidate);
                continue;
            }
            match self.insert(unit, &candidate, slug)? {
                Some(record) => {
                    log::info!(
                        "Unit {} rephrased on attempt {}: '{}'",
                        unit.key,
                        attempt,
                        candidate
                    );
                    return Ok(WriteOutcome::Rephrased { record, attempts: attempt });
                }
                None => return self.present(unit),
            }
        }

        // Identity-derived suffix, reproducible on retry.
        let by_type = format!("{} ({})", unit.title, unit.key.sub_type);
        let title = if taken.iter().any(|t| same_text(t, &by_type)) {
            format!("{} [{}]", unit.title, unit.key.fingerprint())
        } else {
            by_type
        };
        self.insert_with_fallback_slugs(unit, &title)
            .map(WriteOutcome::Suffixed)
    }

    fn insert_with_fallback_slugs(
        &self,
        unit: &ProducedUnit,
        title: &str,
    ) -> Result<ContentRecord, WriteError> {
        let base = locator_for(title, &unit.key);
        let mut candidates = vec![base.clone(), format!("{}-{}", base, unit.key.fingerprint())];
        candidates.extend((2..=MAX_NUMBERED_SLUGS).map(|n| format!("{}-{}", base, n)));

        for slug in candidates {
            if self.store.find_by_slug(&slug)?.is_some() {
                continue;
            }
            match self.insert(unit, title, slug) {
                Ok(Some(record)) => return Ok(record),
                Ok(None) => {
                    if let Some(r) = self.store.find_by_key(&unit.key)? {
                        return Ok(r);
                    }
                }
                Err(WriteError::Store(StoreError::DuplicateSlug { .. })) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(WriteError::NoFreeSlug {
            key: unit.key.to_string(),
        })
    }

    /// Inserts a new record. `Ok(None)` means the unit key was taken
    /// concurrently.
    fn insert(
        &self,
        unit: &ProducedUnit,
        title: &str,
        slug: String,
    ) -> Result<Option<ContentRecord>, WriteError> {
        let now = self.clock.now();
        let mut body = unit.body.clone();
        if title != unit.title {
            set_title_field(&mut body, title);
        }
        let record = ContentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            scope_id: unit.scope_id.clone(),
            dimension: unit.key.dimension.clone(),
            sub_type: unit.key.sub_type.clone(),
            parent_content_id: Some(unit.key.parent_content_id.clone()),
            ordinal: unit.ordinal,
            grouping_key: Some(unit.grouping_key.clone()),
            slug,
            title: title.to_string(),
            body,
            link_id: unit.link_id.clone(),
            translations: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        match self.store.insert(&record) {
            Ok(()) => Ok(Some(record)),
            Err(StoreError::DuplicateKey { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::collaborator::{CollaboratorError, StepRequest};
    use crate::db::Database;
    use crate::retry::RetryPolicy;
    use crate::store::SqliteContentStore;
    use crate::unit::Dimension;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Hands out rephrasings from a fixed list.
    struct Rephraser {
        answers: Mutex<Vec<String>>,
        calls: Mutex<u32>,
    }

    impl Rephraser {
        fn new(answers: &[&str]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().rev().map(|s| s.to_string()).collect()),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Generator for Rephraser {
        async fn produce(&self, _request: &StepRequest) -> Result<String, CollaboratorError> {
            Err(CollaboratorError::EmptyResponse)
        }

        async fn rephrase(&self, _request: &RephraseRequest) -> Result<String, CollaboratorError> {
            *self.calls.lock().unwrap() += 1;
            self.answers
                .lock()
                .unwrap()
                .pop()
                .ok_or(CollaboratorError::BadRequest {
                    status: 400,
                    body: "no more".to_string(),
                })
        }
    }

    fn setup(answers: &[&str]) -> (Arc<SqliteContentStore>, Arc<Rephraser>, UnitWriter) {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(SqliteContentStore::new(
            Database::open_in_memory().unwrap(),
            clock.clone(),
        ));
        let generator = Arc::new(Rephraser::new(answers));
        let retry = RetryExecutor::new(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        });
        let writer = UnitWriter::new(store.clone(), generator.clone(), retry, clock, 3);
        (store, generator, writer)
    }

    fn open_budget() -> TimeoutGuard {
        TimeoutGuard::start(Arc::new(SystemClock), Duration::from_secs(3600))
    }

    fn unit(parent: &str, title: &str) -> ProducedUnit {
        ProducedUnit {
            key: UnitKey::new(parent, "de", "qa"),
            scope_id: "scope".to_string(),
            ordinal: 0,
            grouping_key: parent.to_string(),
            title: title.to_string(),
            body: json!({ "question": title, "answer": "..." }),
            link_id: None,
        }
    }

    fn existing(id: &str, parent: Option<&str>, group: Option<&str>, title: &str) -> ContentRecord {
        let now = Utc::now();
        ContentRecord {
            id: id.to_string(),
            scope_id: "scope".to_string(),
            dimension: Dimension::new("de"),
            sub_type: "qa".to_string(),
            parent_content_id: parent.map(String::from),
            ordinal: 0,
            grouping_key: group.map(String::from),
            slug: format!("{}-de", slugify(title)),
            title: title.to_string(),
            body: json!({ "question": title }),
            link_id: None,
            translations: Default::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_second_write_is_noop() {
        let (store, _, writer) = setup(&[]);
        let first = writer.write(&unit("s1", "Was kostet das?"), &open_budget()).await.unwrap();
        assert!(matches!(first, WriteOutcome::Inserted(_)));
        assert_eq!(first.record().slug, "was-kostet-das-de");

        let second = writer.write(&unit("s1", "Was kostet das?"), &open_budget()).await.unwrap();
        assert!(!second.wrote());
        assert_eq!(second.record().id, first.record().id);
        assert_eq!(
            store
                .records_in_dimension("scope", &Dimension::new("de"))
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_orphan_with_same_locator_is_adopted() {
        let (store, _, writer) = setup(&[]);
        store
            .insert(&existing("orphan", None, Some("s1"), "Was kostet das?"))
            .unwrap();

        let outcome = writer.write(&unit("s1", "Was kostet das?"), &open_budget()).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Adopted(_)));
        let adopted = store.get("orphan").unwrap().unwrap();
        assert_eq!(adopted.parent_content_id.as_deref(), Some("s1"));
        assert!(store.find_by_key(&unit("s1", "").key).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_semantic_duplicate_is_rephrased() {
        let (store, generator, writer) = setup(&["Was kostet das?", "\"Wie teuer ist das?\""]);
        store
            .insert(&existing("other", Some("s0"), Some("s0"), "Was kostet das?"))
            .unwrap();

        let outcome = writer.write(&unit("s1", "Was kostet das?"), &open_budget()).await.unwrap();
        match outcome {
            WriteOutcome::Rephrased { record, attempts } => {
                assert_eq!(attempts, 2);
                assert_eq!(record.title, "Wie teuer ist das?");
                assert_eq!(record.body["question"], "Wie teuer ist das?");
                assert_eq!(record.slug, "wie-teuer-ist-das-de");
            }
            other => panic!("expected rephrase, got {:?}", other),
        }
        assert_eq!(*generator.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rephrase_exhaustion_falls_back_to_identity_suffix() {
        let (store, _, writer) = setup(&["Was kostet das?", "Was kostet das?", "Was kostet das?"]);
        store
            .insert(&existing("other", Some("s0"), Some("s0"), "Was kostet das?"))
            .unwrap();

        let first = writer.write(&unit("s1", "Was kostet das?"), &open_budget()).await.unwrap();
        let WriteOutcome::Suffixed(record) = first else {
            panic!("expected suffix");
        };
        assert_eq!(record.title, "Was kostet das? (qa)");
        assert_eq!(record.slug, "was-kostet-das-qa-de");
    }

    #[tokio::test]
    async fn test_spent_budget_stops_before_rephrasing() {
        let (store, generator, writer) = setup(&["Wie teuer ist das?"]);
        store
            .insert(&existing("other", Some("s0"), Some("s0"), "Was kostet das?"))
            .unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let guard = TimeoutGuard::start(clock.clone(), Duration::from_secs(60));
        clock.advance(Duration::from_secs(60));

        let result = writer.write(&unit("s1", "Was kostet das?"), &guard).await;
        assert!(matches!(result, Err(WriteError::OutOfTime { .. })));
        assert_eq!(*generator.calls.lock().unwrap(), 0);
        assert!(store.find_by_key(&unit("s1", "").key).unwrap().is_none());
    }

    #[test]
    fn test_locator_falls_back_to_fingerprint() {
        let key = UnitKey::new("s1", "ru", "qa");
        assert_eq!(locator_for("Москва", &key), format!("{}-ru", key.fingerprint()));
    }
}
