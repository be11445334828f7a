//! Content record repository.
//!
//! Source units are rows with no parent; derived units carry the id of the
//! source they were produced from. The unit key `(parent_content_id,
//! dimension, sub_type)` is unique for derived rows.

use rusqlite::{params, params_from_iter, Row};

use super::{Database, DatabaseError};

/// A raw content record row.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentRow {
    pub id: String,
    pub scope_id: String,
    pub dimension: String,
    pub sub_type: String,
    pub parent_content_id: Option<String>,
    pub ordinal: i64,
    pub grouping_key: Option<String>,
    pub slug: String,
    pub title: String,
    pub body: String,
    pub link_id: Option<String>,
    pub translations: String,
    pub created_at: String,
    pub updated_at: String,
}

impl ContentRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            scope_id: row.get("scope_id")?,
            dimension: row.get("dimension")?,
            sub_type: row.get("sub_type")?,
            parent_content_id: row.get("parent_content_id")?,
            ordinal: row.get("ordinal")?,
            grouping_key: row.get("grouping_key")?,
            slug: row.get("slug")?,
            title: row.get("title")?,
            body: row.get("body")?,
            link_id: row.get("link_id")?,
            translations: row.get("translations")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

fn collect(
    conn: &rusqlite::Connection,
    sql: &str,
    values: Vec<String>,
) -> Result<Vec<ContentRow>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), ContentRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn first(
    conn: &rusqlite::Connection,
    sql: &str,
    values: Vec<String>,
) -> Result<Option<ContentRow>, DatabaseError> {
    Ok(collect(conn, sql, values)?.into_iter().next())
}

/// `AND sub_type IN (?n, ...)` for a non-empty filter, numbered from `start`.
fn sub_type_clause(sub_types: &[String], start: usize) -> String {
    if sub_types.is_empty() {
        return String::new();
    }
    let placeholders: Vec<String> = (0..sub_types.len())
        .map(|i| format!("?{}", start + i))
        .collect();
    format!(" AND sub_type IN ({})", placeholders.join(", "))
}

/// Inserts a record. Unique violations on the slug or the unit key come back
/// as [`DatabaseError::UniqueViolation`].
pub fn insert(db: &Database, row: &ContentRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO content_records (id, scope_id, dimension, sub_type, parent_content_id,
             ordinal, grouping_key, slug, title, body, link_id, translations, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                row.id,
                row.scope_id,
                row.dimension,
                row.sub_type,
                row.parent_content_id,
                row.ordinal,
                row.grouping_key,
                row.slug,
                row.title,
                row.body,
                row.link_id,
                row.translations,
                row.created_at,
                row.updated_at,
            ],
        )
        .map_err(DatabaseError::from_write)?;
        Ok(())
    })
}

/// Rewrites every column except `id` and `created_at`.
pub fn update(db: &Database, row: &ContentRow) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn
            .execute(
                "UPDATE content_records SET scope_id = ?2, dimension = ?3, sub_type = ?4,
                 parent_content_id = ?5, ordinal = ?6, grouping_key = ?7, slug = ?8, title = ?9,
                 body = ?10, link_id = ?11, translations = ?12, updated_at = ?13
                 WHERE id = ?1",
                params![
                    row.id,
                    row.scope_id,
                    row.dimension,
                    row.sub_type,
                    row.parent_content_id,
                    row.ordinal,
                    row.grouping_key,
                    row.slug,
                    row.title,
                    row.body,
                    row.link_id,
                    row.translations,
                    row.updated_at,
                ],
            )
            .map_err(DatabaseError::from_write)?;
        Ok(changed == 1)
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<ContentRow>, DatabaseError> {
    db.with_conn(|conn| {
        first(
            conn,
            "SELECT * FROM content_records WHERE id = ?1",
            vec![id.to_string()],
        )
    })
}

pub fn find_by_slug(db: &Database, slug: &str) -> Result<Option<ContentRow>, DatabaseError> {
    db.with_conn(|conn| {
        first(
            conn,
            "SELECT * FROM content_records WHERE slug = ?1",
            vec![slug.to_string()],
        )
    })
}

pub fn find_by_unit_key(
    db: &Database,
    parent_content_id: &str,
    dimension: &str,
    sub_type: &str,
) -> Result<Option<ContentRow>, DatabaseError> {
    db.with_conn(|conn| {
        first(
            conn,
            "SELECT * FROM content_records
             WHERE parent_content_id = ?1 AND dimension = ?2 AND sub_type = ?3",
            vec![
                parent_content_id.to_string(),
                dimension.to_string(),
                sub_type.to_string(),
            ],
        )
    })
}

/// Source units of a scope in canonical order (ordinal, then creation).
pub fn list_sources(
    db: &Database,
    scope_id: &str,
    dimension: &str,
    sub_types: &[String],
) -> Result<Vec<ContentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT * FROM content_records
             WHERE scope_id = ?1 AND dimension = ?2 AND parent_content_id IS NULL{}
             ORDER BY ordinal, created_at, id",
            sub_type_clause(sub_types, 3)
        );
        let mut values = vec![scope_id.to_string(), dimension.to_string()];
        values.extend(sub_types.iter().cloned());
        collect(conn, &sql, values)
    })
}

/// Derived records of a scope in one dimension, as `(parent_content_id,
/// sub_type)` pairs.
pub fn derived_keys(
    db: &Database,
    scope_id: &str,
    dimension: &str,
) -> Result<Vec<(String, String)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT parent_content_id, sub_type FROM content_records
             WHERE scope_id = ?1 AND dimension = ?2 AND parent_content_id IS NOT NULL",
        )?;
        let rows = stmt
            .query_map(params![scope_id, dimension], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// The member of a group that lives in `dimension`, optionally restricted to
/// one sub-type.
pub fn find_sibling(
    db: &Database,
    grouping_key: &str,
    dimension: &str,
    sub_type: Option<&str>,
) -> Result<Option<ContentRow>, DatabaseError> {
    db.with_conn(|conn| match sub_type {
        Some(sub_type) => first(
            conn,
            "SELECT * FROM content_records
             WHERE grouping_key = ?1 AND dimension = ?2 AND sub_type = ?3
             ORDER BY created_at, id",
            vec![
                grouping_key.to_string(),
                dimension.to_string(),
                sub_type.to_string(),
            ],
        ),
        None => first(
            conn,
            "SELECT * FROM content_records WHERE grouping_key = ?1 AND dimension = ?2
             ORDER BY created_at, id",
            vec![grouping_key.to_string(), dimension.to_string()],
        ),
    })
}

/// Every record of a scope in one dimension.
pub fn list_in_dimension(
    db: &Database,
    scope_id: &str,
    dimension: &str,
) -> Result<Vec<ContentRow>, DatabaseError> {
    db.with_conn(|conn| {
        collect(
            conn,
            "SELECT * FROM content_records WHERE scope_id = ?1 AND dimension = ?2
             ORDER BY ordinal, created_at, id",
            vec![scope_id.to_string(), dimension.to_string()],
        )
    })
}

/// All records sharing a grouping key. A source with no grouping key of its
/// own groups under its id.
pub fn group_members(db: &Database, grouping_key: &str) -> Result<Vec<ContentRow>, DatabaseError> {
    db.with_conn(|conn| {
        collect(
            conn,
            "SELECT * FROM content_records
             WHERE grouping_key = ?1 OR (grouping_key IS NULL AND id = ?1)
             ORDER BY dimension, id",
            vec![grouping_key.to_string()],
        )
    })
}

/// Rewrites the sibling map of one record.
pub fn set_translations(
    db: &Database,
    id: &str,
    translations: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE content_records SET translations = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, translations, now],
        )?;
        Ok(changed == 1)
    })
}

/// Distinct group keys of a scope's source units, sorted.
pub fn grouping_keys(
    db: &Database,
    scope_id: &str,
    dimension: &str,
    sub_types: &[String],
) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT DISTINCT COALESCE(grouping_key, id) AS gk FROM content_records
             WHERE scope_id = ?1 AND dimension = ?2 AND parent_content_id IS NULL{}
             ORDER BY gk",
            sub_type_clause(sub_types, 3)
        );
        let mut values = vec![scope_id.to_string(), dimension.to_string()];
        values.extend(sub_types.iter().cloned());
        let mut stmt = conn.prepare(&sql)?;
        let keys = stmt
            .query_map(params_from_iter(values.iter()), |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    })
}
