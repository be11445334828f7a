//! Per-unit bookkeeping for a job: the failure ledger and sub-step
//! checkpoints.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct FailureRow {
    pub job_id: String,
    pub parent_content_id: String,
    pub dimension: String,
    pub sub_type: String,
    pub kind: String,
    pub attempts: i64,
    pub last_error: String,
    pub updated_at: String,
}

impl FailureRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            parent_content_id: row.get("parent_content_id")?,
            dimension: row.get("dimension")?,
            sub_type: row.get("sub_type")?,
            kind: row.get("kind")?,
            attempts: row.get("attempts")?,
            last_error: row.get("last_error")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRow {
    pub job_id: String,
    pub parent_content_id: String,
    pub dimension: String,
    pub sub_type: String,
    pub next_step: i64,
    pub outputs: String,
    pub updated_at: String,
}

/// Records a failure. Repeated failures of the same unit bump `attempts`;
/// the kind and message are overwritten with the latest.
#[allow(clippy::too_many_arguments)]
pub fn record_failure(
    db: &Database,
    job_id: &str,
    parent_content_id: &str,
    dimension: &str,
    sub_type: &str,
    kind: &str,
    error: &str,
    now: &str,
) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO unit_failures (job_id, parent_content_id, dimension, sub_type, kind,
             attempts, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)
             ON CONFLICT (job_id, parent_content_id, dimension, sub_type) DO UPDATE SET
               kind = excluded.kind,
               attempts = CASE WHEN excluded.kind = 'blocked' THEN unit_failures.attempts
                               WHEN unit_failures.kind = 'blocked' THEN 1
                               ELSE unit_failures.attempts + 1 END,
               last_error = excluded.last_error,
               updated_at = excluded.updated_at",
            params![job_id, parent_content_id, dimension, sub_type, kind, error, now],
        )?;
        let attempts: i64 = conn.query_row(
            "SELECT attempts FROM unit_failures
             WHERE job_id = ?1 AND parent_content_id = ?2 AND dimension = ?3 AND sub_type = ?4",
            params![job_id, parent_content_id, dimension, sub_type],
            |r| r.get(0),
        )?;
        Ok(attempts)
    })
}

pub fn list_failures(db: &Database, job_id: &str) -> Result<Vec<FailureRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM unit_failures WHERE job_id = ?1
             ORDER BY dimension, parent_content_id, sub_type",
        )?;
        let rows = stmt
            .query_map(params![job_id], FailureRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Removes one unit's ledger entry.
pub fn clear_failure(
    db: &Database,
    job_id: &str,
    parent_content_id: &str,
    dimension: &str,
    sub_type: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM unit_failures
             WHERE job_id = ?1 AND parent_content_id = ?2 AND dimension = ?3 AND sub_type = ?4",
            params![job_id, parent_content_id, dimension, sub_type],
        )?;
        Ok(())
    })
}

/// Removes every ledger entry of a job, optionally only those of one kind.
pub fn clear_failures(db: &Database, job_id: &str, kind: Option<&str>) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let removed = match kind {
            Some(kind) => conn.execute(
                "DELETE FROM unit_failures WHERE job_id = ?1 AND kind = ?2",
                params![job_id, kind],
            )?,
            None => conn.execute(
                "DELETE FROM unit_failures WHERE job_id = ?1",
                params![job_id],
            )?,
        };
        Ok(removed)
    })
}

pub fn save_checkpoint(db: &Database, row: &CheckpointRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO unit_checkpoints (job_id, parent_content_id, dimension, sub_type,
             next_step, outputs, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (job_id, parent_content_id, dimension, sub_type) DO UPDATE SET
               next_step = excluded.next_step,
               outputs = excluded.outputs,
               updated_at = excluded.updated_at",
            params![
                row.job_id,
                row.parent_content_id,
                row.dimension,
                row.sub_type,
                row.next_step,
                row.outputs,
                row.updated_at,
            ],
        )?;
        Ok(())
    })
}

pub fn load_checkpoint(
    db: &Database,
    job_id: &str,
    parent_content_id: &str,
    dimension: &str,
    sub_type: &str,
) -> Result<Option<CheckpointRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM unit_checkpoints
             WHERE job_id = ?1 AND parent_content_id = ?2 AND dimension = ?3 AND sub_type = ?4",
        )?;
        let mut rows = stmt.query_map(
            params![job_id, parent_content_id, dimension, sub_type],
            |row| {
                Ok(CheckpointRow {
                    job_id: row.get("job_id")?,
                    parent_content_id: row.get("parent_content_id")?,
                    dimension: row.get("dimension")?,
                    sub_type: row.get("sub_type")?,
                    next_step: row.get("next_step")?,
                    outputs: row.get("outputs")?,
                    updated_at: row.get("updated_at")?,
                })
            },
        )?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

pub fn delete_checkpoint(
    db: &Database,
    job_id: &str,
    parent_content_id: &str,
    dimension: &str,
    sub_type: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM unit_checkpoints
             WHERE job_id = ?1 AND parent_content_id = ?2 AND dimension = ?3 AND sub_type = ?4",
            params![job_id, parent_content_id, dimension, sub_type],
        )?;
        Ok(())
    })
}
