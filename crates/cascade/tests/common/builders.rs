//! Builder patterns for creating test data programmatically.

#![allow(dead_code)]

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use serde_json::json;

use cascade::config::{ContinuationMode, StepConfig};
use cascade::job::JobSpec;
use cascade::{Config, ContentRecord, Dimension, NewJob};

pub const SCOPE: &str = "cluster-1";
pub const PIPELINE: &str = "cluster_translation";

/// Builder for source (or pre-existing) content records.
pub struct SourceBuilder {
    record: ContentRecord,
}

impl SourceBuilder {
    /// A source article in `en` titled after its id.
    pub fn new(id: &str) -> Self {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Self {
            record: ContentRecord {
                id: id.to_string(),
                scope_id: SCOPE.to_string(),
                dimension: Dimension::new("en"),
                sub_type: "article".to_string(),
                parent_content_id: None,
                ordinal: 0,
                grouping_key: None,
                slug: format!("{}-en", id),
                title: id.to_string(),
                body: json!({ "title": id }),
                link_id: None,
                translations: BTreeMap::new(),
                created_at: at,
                updated_at: at,
            },
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.record.title = title.to_string();
        self.record.body = json!({ "title": title });
        self
    }

    pub fn dimension(mut self, dimension: &str) -> Self {
        self.record.dimension = Dimension::new(dimension);
        self.record.slug = format!("{}-{}", self.record.id, dimension);
        self
    }

    pub fn sub_type(mut self, sub_type: &str) -> Self {
        self.record.sub_type = sub_type.to_string();
        self
    }

    pub fn ordinal(mut self, ordinal: i64) -> Self {
        self.record.ordinal = ordinal;
        self
    }

    pub fn slug(mut self, slug: &str) -> Self {
        self.record.slug = slug.to_string();
        self
    }

    pub fn parent(mut self, parent: &str) -> Self {
        self.record.parent_content_id = Some(parent.to_string());
        self
    }

    pub fn grouping_key(mut self, key: &str) -> Self {
        self.record.grouping_key = Some(key.to_string());
        self
    }

    /// Links this record to another one (e.g. a FAQ to its article).
    pub fn links_to(mut self, id: &str) -> Self {
        self.record.link_id = Some(id.to_string());
        self
    }

    pub fn build(self) -> ContentRecord {
        self.record
    }
}

/// Builder for job creation requests.
pub struct JobBuilder {
    spec: JobSpec,
    dimensions: Vec<Dimension>,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self {
            spec: JobSpec {
                pipeline: PIPELINE.to_string(),
                scope_id: SCOPE.to_string(),
                source_dimension: Dimension::new("en"),
                sub_types: vec![],
                link_sub_type: None,
            },
            dimensions: vec![Dimension::new("de")],
        }
    }

    pub fn dimensions(mut self, dims: &[&str]) -> Self {
        self.dimensions = dims.iter().map(Dimension::new).collect();
        self
    }

    pub fn sub_types(mut self, sub_types: &[&str]) -> Self {
        self.spec.sub_types = sub_types.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn link_sub_type(mut self, sub_type: &str) -> Self {
        self.spec.link_sub_type = Some(sub_type.to_string());
        self
    }

    pub fn build(self) -> NewJob {
        NewJob {
            spec: self.spec,
            dimensions: self.dimensions,
        }
    }
}

/// Builder for `Config` instances.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = Config::default();
        config.worker_count = 1;
        Self { config }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.config.version = version.to_string();
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    pub fn time_budget_secs(mut self, secs: u64) -> Self {
        self.config.orchestrator.time_budget_secs = secs;
        self
    }

    pub fn staleness_threshold_secs(mut self, secs: u64) -> Self {
        self.config.orchestrator.staleness_threshold_secs = secs;
        self
    }

    pub fn max_units(mut self, n: usize) -> Self {
        self.config.orchestrator.max_units_per_invocation = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n;
        self
    }

    pub fn continuation(mut self, mode: ContinuationMode) -> Self {
        self.config.orchestrator.continuation = mode;
        self
    }

    pub fn public_url(mut self, url: &str) -> Self {
        self.config.server.public_url = Some(url.to_string());
        self
    }

    pub fn database_path(mut self, path: &str) -> Self {
        self.config.database.path = Some(path.to_string());
        self
    }

    pub fn pipeline(mut self, name: &str, steps: &[(&str, &str)]) -> Self {
        self.config.collaborator.pipelines.insert(
            name.to_string(),
            steps
                .iter()
                .map(|(name, prompt)| StepConfig {
                    name: name.to_string(),
                    prompt: prompt.to_string(),
                })
                .collect(),
        );
        self
    }

    pub fn build(self) -> Config {
        self.config
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.config).unwrap()
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(&self.config).unwrap()
    }
}
