//! Content store adapter.
//!
//! The content store is the only authority on whether a unit exists. The
//! orchestrator reads it on every planning pass and writes to it only
//! through the unit writer and the linking pass.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{format_timestamp, parse_timestamp, Clock};
use crate::db::content_repo::{self, ContentRow};
use crate::db::{Database, DatabaseError};
use crate::unit::{Dimension, UnitKey};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Locator '{slug}' is already taken")]
    DuplicateSlug { slug: String },

    #[error("Unit '{key}' already has a record")]
    DuplicateKey { key: String },

    #[error("Content record '{id}' is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
}

/// A persisted content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: String,
    pub scope_id: String,
    pub dimension: Dimension,
    pub sub_type: String,
    /// `None` for source units.
    pub parent_content_id: Option<String>,
    pub ordinal: i64,
    pub grouping_key: Option<String>,
    pub slug: String,
    pub title: String,
    pub body: serde_json::Value,
    pub link_id: Option<String>,
    /// Sibling map: dimension code to slug, for every member of the group.
    pub translations: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentRecord {
    /// The unit key this source record produces in `dimension`.
    pub fn key_for(&self, dimension: &Dimension) -> UnitKey {
        UnitKey::new(self.id.clone(), dimension.clone(), self.sub_type.clone())
    }

    /// The key under which this record was produced, if it is derived.
    pub fn unit_key(&self) -> Option<UnitKey> {
        self.parent_content_id
            .as_ref()
            .map(|p| UnitKey::new(p.clone(), self.dimension.clone(), self.sub_type.clone()))
    }

    /// The group this record belongs to. Sources without an explicit
    /// grouping key group under their own id.
    pub fn group_key(&self) -> &str {
        self.grouping_key.as_deref().unwrap_or(&self.id)
    }

    fn from_row(row: ContentRow) -> Result<Self, StoreError> {
        let body = serde_json::from_str(&row.body).map_err(|e| StoreError::Corrupt {
            id: row.id.clone(),
            reason: format!("body: {}", e),
        })?;
        let translations =
            serde_json::from_str(&row.translations).map_err(|e| StoreError::Corrupt {
                id: row.id.clone(),
                reason: format!("translations: {}", e),
            })?;
        Ok(Self {
            id: row.id,
            scope_id: row.scope_id,
            dimension: Dimension::new(row.dimension),
            sub_type: row.sub_type,
            parent_content_id: row.parent_content_id,
            ordinal: row.ordinal,
            grouping_key: row.grouping_key,
            slug: row.slug,
            title: row.title,
            body,
            link_id: row.link_id,
            translations,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        })
    }

    fn to_row(&self) -> ContentRow {
        ContentRow {
            id: self.id.clone(),
            scope_id: self.scope_id.clone(),
            dimension: self.dimension.to_string(),
            sub_type: self.sub_type.clone(),
            parent_content_id: self.parent_content_id.clone(),
            ordinal: self.ordinal,
            grouping_key: self.grouping_key.clone(),
            slug: self.slug.clone(),
            title: self.title.clone(),
            body: self.body.to_string(),
            link_id: self.link_id.clone(),
            translations: serde_json::to_string(&self.translations)
                .unwrap_or_else(|_| "{}".to_string()),
            created_at: format_timestamp(self.created_at),
            updated_at: format_timestamp(self.updated_at),
        }
    }
}

/// Which records count as the canonical source list of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceScope {
    pub scope_id: String,
    pub dimension: Dimension,
    /// Empty means every sub-type.
    #[serde(default)]
    pub sub_types: Vec<String>,
}

pub trait ContentStore: Send + Sync {
    /// Source units in canonical order.
    fn source_units(&self, scope: &SourceScope) -> Result<Vec<ContentRecord>, StoreError>;

    /// `(parent_content_id, sub_type)` of every derived record in a dimension.
    fn derived_keys(
        &self,
        scope_id: &str,
        dimension: &Dimension,
    ) -> Result<HashSet<(String, String)>, StoreError>;

    fn get(&self, id: &str) -> Result<Option<ContentRecord>, StoreError>;

    fn find_by_key(&self, key: &UnitKey) -> Result<Option<ContentRecord>, StoreError>;

    fn find_by_slug(&self, slug: &str) -> Result<Option<ContentRecord>, StoreError>;

    fn find_sibling(
        &self,
        grouping_key: &str,
        dimension: &Dimension,
        sub_type: Option<&str>,
    ) -> Result<Option<ContentRecord>, StoreError>;

    fn records_in_dimension(
        &self,
        scope_id: &str,
        dimension: &Dimension,
    ) -> Result<Vec<ContentRecord>, StoreError>;

    fn insert(&self, record: &ContentRecord) -> Result<(), StoreError>;

    /// Overwrites an existing record in place.
    fn replace(&self, record: &ContentRecord) -> Result<(), StoreError>;

    fn group_members(&self, grouping_key: &str) -> Result<Vec<ContentRecord>, StoreError>;

    fn set_sibling_map(
        &self,
        id: &str,
        translations: &BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Distinct group keys of the scope's source units, sorted.
    fn grouping_keys(&self, scope: &SourceScope) -> Result<Vec<String>, StoreError>;
}

/// [`ContentStore`] over the local SQLite database.
#[derive(Clone)]
pub struct SqliteContentStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl SqliteContentStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    fn map_rows(rows: Vec<ContentRow>) -> Result<Vec<ContentRecord>, StoreError> {
        rows.into_iter().map(ContentRecord::from_row).collect()
    }

    fn map_row(row: Option<ContentRow>) -> Result<Option<ContentRecord>, StoreError> {
        row.map(ContentRecord::from_row).transpose()
    }

    fn map_write(record: &ContentRecord, err: DatabaseError) -> StoreError {
        match err {
            DatabaseError::UniqueViolation { constraint } if constraint.contains(".slug") => {
                StoreError::DuplicateSlug {
                    slug: record.slug.clone(),
                }
            }
            DatabaseError::UniqueViolation { .. } => StoreError::DuplicateKey {
                key: record
                    .unit_key()
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| record.id.clone()),
            },
            other => StoreError::Database(other),
        }
    }
}

impl ContentStore for SqliteContentStore {
    fn source_units(&self, scope: &SourceScope) -> Result<Vec<ContentRecord>, StoreError> {
        let rows = content_repo::list_sources(
            &self.db,
            &scope.scope_id,
            scope.dimension.as_str(),
            &scope.sub_types,
        )?;
        Self::map_rows(rows)
    }

    fn derived_keys(
        &self,
        scope_id: &str,
        dimension: &Dimension,
    ) -> Result<HashSet<(String, String)>, StoreError> {
        Ok(content_repo::derived_keys(&self.db, scope_id, dimension.as_str())?
            .into_iter()
            .collect())
    }

    fn get(&self, id: &str) -> Result<Option<ContentRecord>, StoreError> {
        Self::map_row(content_repo::find_by_id(&self.db, id)?)
    }

    fn find_by_key(&self, key: &UnitKey) -> Result<Option<ContentRecord>, StoreError> {
        Self::map_row(content_repo::find_by_unit_key(
            &self.db,
            &key.parent_content_id,
            key.dimension.as_str(),
            &key.sub_type,
        )?)
    }

    fn find_by_slug(&self, slug: &str) -> Result<Option<ContentRecord>, StoreError> {
        Self::map_row(content_repo::find_by_slug(&self.db, slug)?)
    }

    fn find_sibling(
        &self,
        grouping_key: &str,
        dimension: &Dimension,
        sub_type: Option<&str>,
    ) -> Result<Option<ContentRecord>, StoreError> {
        Self::map_row(content_repo::find_sibling(
            &self.db,
            grouping_key,
            dimension.as_str(),
            sub_type,
        )?)
    }

    fn records_in_dimension(
        &self,
        scope_id: &str,
        dimension: &Dimension,
    ) -> Result<Vec<ContentRecord>, StoreError> {
        Self::map_rows(content_repo::list_in_dimension(
            &self.db,
            scope_id,
            dimension.as_str(),
        )?)
    }

    fn insert(&self, record: &ContentRecord) -> Result<(), StoreError> {
        content_repo::insert(&self.db, &record.to_row()).map_err(|e| Self::map_write(record, e))
    }

    fn replace(&self, record: &ContentRecord) -> Result<(), StoreError> {
        let mut row = record.to_row();
        row.updated_at = format_timestamp(self.clock.now());
        let found = content_repo::update(&self.db, &row).map_err(|e| Self::map_write(record, e))?;
        if !found {
            return Err(StoreError::Corrupt {
                id: record.id.clone(),
                reason: "record vanished before update".to_string(),
            });
        }
        Ok(())
    }

    fn group_members(&self, grouping_key: &str) -> Result<Vec<ContentRecord>, StoreError> {
        Self::map_rows(content_repo::group_members(&self.db, grouping_key)?)
    }

    fn set_sibling_map(
        &self,
        id: &str,
        translations: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(translations).map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        content_repo::set_translations(&self.db, id, &json, &format_timestamp(self.clock.now()))?;
        Ok(())
    }

    fn grouping_keys(&self, scope: &SourceScope) -> Result<Vec<String>, StoreError> {
        Ok(content_repo::grouping_keys(
            &self.db,
            &scope.scope_id,
            scope.dimension.as_str(),
            &scope.sub_types,
        )?)
    }
}
