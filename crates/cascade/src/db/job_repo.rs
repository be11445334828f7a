//! Job repository: row-level operations on the `jobs` table.
//!
//! Writes that participate in the single-writer protocol are conditional
//! (`WHERE lease_token = ?`, `WHERE status = ?`) and report whether a row
//! was actually changed; the caller decides what a lost race means.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub pipeline: String,
    pub scope_id: String,
    pub spec: String,
    pub status: String,
    pub work_queue: String,
    pub completed_dimensions: String,
    pub dimension_status: String,
    pub resume_pointer: Option<String>,
    pub progress: String,
    pub error: Option<String>,
    pub link_cursor: Option<String>,
    pub linked_at: Option<String>,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            pipeline: row.get("pipeline")?,
            scope_id: row.get("scope_id")?,
            spec: row.get("spec")?,
            status: row.get("status")?,
            work_queue: row.get("work_queue")?,
            completed_dimensions: row.get("completed_dimensions")?,
            dimension_status: row.get("dimension_status")?,
            resume_pointer: row.get("resume_pointer")?,
            progress: row.get("progress")?,
            error: row.get("error")?,
            link_cursor: row.get("link_cursor")?,
            linked_at: row.get("linked_at")?,
            lease_token: row.get("lease_token")?,
            lease_expires_at: row.get("lease_expires_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub scope_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, pipeline, scope_id, spec, status, work_queue,
             completed_dimensions, dimension_status, resume_pointer, progress, error,
             link_cursor, linked_at, lease_token, lease_expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                job.id,
                job.pipeline,
                job.scope_id,
                job.spec,
                job.status,
                job.work_queue,
                job.completed_dimensions,
                job.dimension_status,
                job.resume_pointer,
                job.progress,
                job.error,
                job.link_cursor,
                job.linked_at,
                job.lease_token,
                job.lease_expires_at,
                job.created_at,
                job.updated_at,
            ],
        )
        .map_err(DatabaseError::from_write)?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }
        if let Some(ref scope_id) = filter.scope_id {
            conditions.push(format!("scope_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(scope_id.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC, id LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Takes the lease if the row is still in `expected_status` and nobody
/// holds an unexpired lease. Sets `status = 'running'` on success.
pub fn acquire_lease(
    db: &Database,
    id: &str,
    expected_status: &str,
    token: &str,
    expires_at: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'running', lease_token = ?3, lease_expires_at = ?4,
             updated_at = ?5
             WHERE id = ?1 AND status = ?2
               AND (lease_token IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= ?5)",
            params![id, expected_status, token, expires_at, now],
        )?;
        Ok(changed == 1)
    })
}

/// Overwrites the mutable columns of a job, provided `token` still holds
/// the lease. The lease columns are taken from `job`, so passing a row with
/// `lease_token = None` releases it.
pub fn update_leased(db: &Database, job: &JobRow, token: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2, work_queue = ?3, completed_dimensions = ?4,
             dimension_status = ?5, resume_pointer = ?6, progress = ?7, error = ?8,
             link_cursor = ?9, linked_at = ?10, lease_token = ?11, lease_expires_at = ?12,
             updated_at = ?13
             WHERE id = ?1 AND lease_token = ?14",
            params![
                job.id,
                job.status,
                job.work_queue,
                job.completed_dimensions,
                job.dimension_status,
                job.resume_pointer,
                job.progress,
                job.error,
                job.link_cursor,
                job.linked_at,
                job.lease_token,
                job.lease_expires_at,
                job.updated_at,
                token,
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Resets a `running` row whose lease (or, lacking one, whose last update)
/// is older than the cutoff. Returns false if the row was not stale.
pub fn reset_stale(
    db: &Database,
    id: &str,
    to_status: &str,
    error: &str,
    now: &str,
    cutoff: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2, error = ?3, lease_token = NULL,
             lease_expires_at = NULL, updated_at = ?4
             WHERE id = ?1 AND status = 'running'
               AND ((lease_expires_at IS NOT NULL AND lease_expires_at <= ?4)
                    OR (lease_expires_at IS NULL AND updated_at <= ?5))",
            params![id, to_status, error, now, cutoff],
        )?;
        Ok(changed == 1)
    })
}

/// Marks a non-terminal job failed and clears its resume pointer and lease.
pub fn abort(db: &Database, id: &str, reason: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'failed', error = ?2, resume_pointer = NULL,
             lease_token = NULL, lease_expires_at = NULL, updated_at = ?3
             WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
            params![id, reason, now],
        )?;
        Ok(changed == 1)
    })
}

/// Rewrites the cached dimension columns only. `updated_at` is left alone so
/// this can never make an abandoned `running` row look alive.
pub fn update_dimensions(
    db: &Database,
    id: &str,
    completed_dimensions: &str,
    dimension_status: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET completed_dimensions = ?2, dimension_status = ?3 WHERE id = ?1",
            params![id, completed_dimensions, dimension_status],
        )?;
        Ok(changed == 1)
    })
}

/// Running jobs whose lease expired (or, lacking a lease, whose last update
/// is at or before `cutoff`).
pub fn find_stale_running(
    db: &Database,
    now: &str,
    cutoff: &str,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status = 'running'
               AND ((lease_expires_at IS NOT NULL AND lease_expires_at <= ?1)
                    OR (lease_expires_at IS NULL AND updated_at <= ?2))
             ORDER BY updated_at",
        )?;
        let rows = stmt
            .query_map(params![now, cutoff], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Jobs in `status` that have not been touched since `cutoff`.
pub fn find_idle(db: &Database, status: &str, cutoff: &str) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status = ?1 AND updated_at <= ?2 ORDER BY updated_at",
        )?;
        let rows = stmt
            .query_map(params![status, cutoff], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
