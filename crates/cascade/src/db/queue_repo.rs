//! Continuation queue rows.
//!
//! A job has at most one unclaimed row. Claims are conditional updates, so
//! two workers racing for the same row cannot both win.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationRow {
    pub id: i64,
    pub job_id: String,
    pub resume_pointer: Option<String>,
    pub enqueued_at: String,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<String>,
    pub attempts: i64,
}

impl ContinuationRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            resume_pointer: row.get("resume_pointer")?,
            enqueued_at: row.get("enqueued_at")?,
            claimed_by: row.get("claimed_by")?,
            claim_expires_at: row.get("claim_expires_at")?,
            attempts: row.get("attempts")?,
        })
    }
}

/// Queues a continuation. If the job already has an unclaimed row, its
/// pointer is replaced and no new row is added. Returns the row id.
pub fn enqueue(
    db: &Database,
    job_id: &str,
    resume_pointer: Option<&str>,
    now: &str,
) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM continuations WHERE job_id = ?1 AND claimed_by IS NULL
                 ORDER BY id LIMIT 1",
                params![job_id],
                |r| r.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            conn.execute(
                "UPDATE continuations SET resume_pointer = ?2 WHERE id = ?1",
                params![id, resume_pointer],
            )?;
            return Ok(id);
        }

        conn.execute(
            "INSERT INTO continuations (job_id, resume_pointer, enqueued_at) VALUES (?1, ?2, ?3)",
            params![job_id, resume_pointer, now],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Claims the oldest row that is unclaimed or whose claim expired.
pub fn claim(
    db: &Database,
    worker: &str,
    now: &str,
    expires_at: &str,
) -> Result<Option<ContinuationRow>, DatabaseError> {
    db.with_conn(|conn| {
        let candidate: Option<i64> = conn
            .query_row(
                "SELECT id FROM continuations
                 WHERE claimed_by IS NULL OR claim_expires_at <= ?1
                 ORDER BY enqueued_at, id LIMIT 1",
                params![now],
                |r| r.get(0),
            )
            .optional()?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let changed = conn.execute(
            "UPDATE continuations SET claimed_by = ?2, claim_expires_at = ?3
             WHERE id = ?1 AND (claimed_by IS NULL OR claim_expires_at <= ?4)",
            params![id, worker, expires_at, now],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        let row = conn.query_row(
            "SELECT * FROM continuations WHERE id = ?1",
            params![id],
            ContinuationRow::from_row,
        )?;
        Ok(Some(row))
    })
}

/// Deletes a finished row.
pub fn complete(db: &Database, id: i64) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute("DELETE FROM continuations WHERE id = ?1", params![id])?;
        Ok(())
    })
}

/// Returns a claimed row to the queue.
pub fn release(db: &Database, id: i64) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE continuations SET claimed_by = NULL, claim_expires_at = NULL,
             attempts = attempts + 1
             WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    })
}

/// Whether a job has any queued or in-flight row.
pub fn has_pending(db: &Database, job_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM continuations WHERE job_id = ?1",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    })
}

pub fn len(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM continuations", [], |r| r.get(0))?;
        Ok(count)
    })
}
