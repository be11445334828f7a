//! Resume planning.
//!
//! The planner never trusts the job record's counters. Every call
//! re-derives expected and actual counts from the content store, so a job
//! whose record was lost or damaged can still be resumed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::job::{DimensionStatus, JobRecord};
use crate::store::{ContentRecord, ContentStore, StoreError};
use crate::unit::{Dimension, UnitKey};

#[derive(Error, Debug)]
pub enum PlanError {
    /// Expected counts come from the source list; without sources there is
    /// nothing to compare against.
    #[error("No source content in scope '{scope_id}' for dimension '{dimension}'")]
    NoSourceContent {
        scope_id: String,
        dimension: Dimension,
    },

    #[error("Content store error: {0}")]
    Store(#[from] StoreError),
}

/// Expected versus actual for one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionReport {
    pub dimension: Dimension,
    pub expected: usize,
    pub actual: usize,
    /// Keys with no record yet, in canonical source order.
    pub missing: Vec<UnitKey>,
}

impl DimensionReport {
    pub fn is_complete(&self) -> bool {
        self.actual >= self.expected
    }
}

/// The state of a job as the content store sees it.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// Source units in canonical order.
    pub sources: Vec<ContentRecord>,
    /// One report per work-queue dimension, in queue order.
    pub dimensions: Vec<DimensionReport>,
}

impl Reconciliation {
    pub fn is_complete(&self) -> bool {
        self.dimensions.iter().all(DimensionReport::is_complete)
    }

    /// Units still missing across all dimensions.
    pub fn remaining(&self) -> usize {
        self.dimensions.iter().map(|d| d.missing.len()).sum()
    }

    pub fn report(&self, dimension: &Dimension) -> Option<&DimensionReport> {
        self.dimensions.iter().find(|d| &d.dimension == dimension)
    }

    /// First incomplete dimension in queue order that is not in `skip`.
    pub fn next_incomplete(&self, skip: &HashSet<Dimension>) -> Option<&DimensionReport> {
        self.dimensions
            .iter()
            .find(|d| !d.is_complete() && !skip.contains(&d.dimension))
    }

    pub fn source(&self, id: &str) -> Option<&ContentRecord> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Rewrites the job's cached dimension view from the counts.
    pub fn apply(&self, job: &mut JobRecord) {
        let mut status = BTreeMap::new();
        let mut completed = Vec::new();
        for report in &self.dimensions {
            let state = if report.is_complete() {
                completed.push(report.dimension.clone());
                DimensionStatus::Completed
            } else if report.actual > 0 {
                DimensionStatus::Partial
            } else {
                DimensionStatus::NotStarted
            };
            status.insert(report.dimension.clone(), state);
        }
        job.completed_dimensions = completed;
        job.dimension_status = status;
    }
}

pub struct ResumePlanner {
    store: Arc<dyn ContentStore>,
}

impl ResumePlanner {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// Counts what exists for every dimension of the job. Read-only.
    pub fn reconcile(&self, job: &JobRecord) -> Result<Reconciliation, PlanError> {
        let scope = job.spec.source_scope();
        let sources = self.store.source_units(&scope)?;
        if sources.is_empty() {
            return Err(PlanError::NoSourceContent {
                scope_id: scope.scope_id,
                dimension: scope.dimension,
            });
        }

        let mut dimensions = Vec::with_capacity(job.work_queue.len());
        for dimension in &job.work_queue {
            let derived = self.store.derived_keys(&scope.scope_id, dimension)?;
            let missing: Vec<UnitKey> = sources
                .iter()
                .filter(|s| !derived.contains(&(s.id.clone(), s.sub_type.clone())))
                .map(|s| s.key_for(dimension))
                .collect();
            dimensions.push(DimensionReport {
                dimension: dimension.clone(),
                expected: sources.len(),
                actual: sources.len() - missing.len(),
                missing,
            });
        }

        Ok(Reconciliation {
            sources,
            dimensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::db::Database;
    use crate::job::{JobRecordStore, JobSpec, NewJob};
    use crate::store::SqliteContentStore;
    use chrono::Utc;
    use serde_json::json;

    fn record(id: &str, dim: &str, parent: Option<&str>, ordinal: i64) -> ContentRecord {
        let now = Utc::now();
        ContentRecord {
            id: id.to_string(),
            scope_id: "scope".to_string(),
            dimension: Dimension::new(dim),
            sub_type: "article".to_string(),
            parent_content_id: parent.map(String::from),
            ordinal,
            grouping_key: parent.map(String::from),
            slug: format!("{}-{}", id, dim),
            title: id.to_string(),
            body: json!({}),
            link_id: None,
            translations: Default::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn setup() -> (Arc<SqliteContentStore>, JobRecordStore, JobRecord) {
        let db = Database::open_in_memory().unwrap();
        let clock = Arc::new(SystemClock);
        let store = Arc::new(SqliteContentStore::new(db.clone(), clock.clone()));
        let jobs = JobRecordStore::new(db, clock);
        let job = jobs
            .create(&NewJob {
                spec: JobSpec {
                    pipeline: "cluster_translation".to_string(),
                    scope_id: "scope".to_string(),
                    source_dimension: Dimension::new("en"),
                    sub_types: vec![],
                    link_sub_type: None,
                },
                dimensions: vec![Dimension::new("de"), Dimension::new("fr")],
            })
            .unwrap();
        (store, jobs, job)
    }

    #[test]
    fn test_reconcile_counts_from_store() {
        let (store, _jobs, mut job) = setup();
        for (i, id) in ["s1", "s2", "s3"].iter().enumerate() {
            store.insert(&record(id, "en", None, i as i64)).unwrap();
        }
        store.insert(&record("d1", "de", Some("s1"), 0)).unwrap();
        store.insert(&record("d2", "de", Some("s2"), 1)).unwrap();
        store.insert(&record("d3", "de", Some("s3"), 2)).unwrap();
        store.insert(&record("f2", "fr", Some("s2"), 1)).unwrap();

        let planner = ResumePlanner::new(store);
        let plan = planner.reconcile(&job).unwrap();

        let de = plan.report(&Dimension::new("de")).unwrap();
        assert!(de.is_complete());
        let fr = plan.report(&Dimension::new("fr")).unwrap();
        assert_eq!((fr.expected, fr.actual), (3, 1));
        let missing: Vec<_> = fr.missing.iter().map(|k| k.parent_content_id.as_str()).collect();
        assert_eq!(missing, vec!["s1", "s3"]);
        assert_eq!(plan.remaining(), 2);
        assert!(!plan.is_complete());
        assert_eq!(
            plan.next_incomplete(&HashSet::new()).unwrap().dimension,
            Dimension::new("fr")
        );

        plan.apply(&mut job);
        assert_eq!(job.completed_dimensions, vec![Dimension::new("de")]);
        assert_eq!(
            job.dimension_status[&Dimension::new("fr")],
            DimensionStatus::Partial
        );
    }

    #[test]
    fn test_orphans_do_not_count() {
        let (store, _jobs, job) = setup();
        store.insert(&record("s1", "en", None, 0)).unwrap();
        let mut orphan = record("o1", "de", None, 0);
        orphan.grouping_key = Some("s1".to_string());
        store.insert(&orphan).unwrap();

        let plan = ResumePlanner::new(store).reconcile(&job).unwrap();
        assert_eq!(plan.report(&Dimension::new("de")).unwrap().actual, 0);
    }

    #[test]
    fn test_no_sources_is_structural_error() {
        let (store, _jobs, job) = setup();
        let err = ResumePlanner::new(store).reconcile(&job).unwrap_err();
        assert!(matches!(err, PlanError::NoSourceContent { .. }));
    }

    #[test]
    fn test_skip_moves_to_next_dimension() {
        let (store, _jobs, job) = setup();
        store.insert(&record("s1", "en", None, 0)).unwrap();
        let plan = ResumePlanner::new(store).reconcile(&job).unwrap();

        let mut skip = HashSet::new();
        skip.insert(Dimension::new("de"));
        assert_eq!(
            plan.next_incomplete(&skip).unwrap().dimension,
            Dimension::new("fr")
        );
        skip.insert(Dimension::new("fr"));
        assert!(plan.next_incomplete(&skip).is_none());
    }
}
