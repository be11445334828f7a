//! Schema versions for the cascade store.
//!
//! v1 to v4 create `jobs`, `content_records`, the per-unit tables and
//! `continuations`. v5 and v6 add the lease columns to `jobs`; they are
//! skipped when the column is already there. Applied versions are recorded
//! in `_migrations`.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    /// Execute the SQL directly.
    Standard,
    /// ALTER TABLE ADD COLUMN, skipped if the column already exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

/// Ordered schema history. A store never applies a version twice.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_jobs_table",
        sql: include_str!("sql/001_create_jobs.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_content_records_table",
        sql: include_str!("sql/002_create_content_records.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "create_unit_tracking_tables",
        sql: include_str!("sql/003_create_unit_tracking.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 4,
        description: "create_continuations_table",
        sql: include_str!("sql/004_create_continuations.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 5,
        description: "add_lease_token_to_jobs",
        sql: include_str!("sql/005_add_lease_token.sql"),
        kind: MigrationKind::AddColumn {
            table: "jobs",
            column: "lease_token",
        },
    },
    Migration {
        version: 6,
        description: "add_lease_expires_at_to_jobs",
        sql: include_str!("sql/006_add_lease_expires_at.sql"),
        kind: MigrationKind::AddColumn {
            table: "jobs",
            column: "lease_expires_at",
        },
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Applying schema v{}: {}",
            migration.version,
            migration.description
        );

        let should_run = match &migration.kind {
            MigrationKind::Standard => true,
            MigrationKind::AddColumn { table, column } => !column_exists(conn, table, column)?,
        };

        if should_run {
            conn.execute_batch(migration.sql)
                .map_err(|e| DatabaseError::Migration {
                    version: migration.version,
                    reason: e.to_string(),
                })?;
        } else {
            log::info!(
                "Schema v{} already has its column, recording only",
                migration.version
            );
        }

        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}

/// Checks whether a column exists on a table using `PRAGMA table_info`.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::Migration {
            version: 0,
            reason: format!("Invalid table name: {}", table),
        });
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .any(|r| r.map(|name| name == column).unwrap_or(false));
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        conn
    }

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = fresh();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = fresh();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_schema_holds_every_cascade_table() {
        let conn = fresh();
        run_all(&conn).unwrap();

        for table in [
            "jobs",
            "content_records",
            "unit_failures",
            "unit_checkpoints",
            "continuations",
        ] {
            let found: u32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(found, 1, "missing table {}", table);
        }
    }

    #[test]
    fn test_jobs_table_has_lease_columns() {
        let conn = fresh();
        run_all(&conn).unwrap();
        assert!(column_exists(&conn, "jobs", "lease_token").unwrap());
        assert!(column_exists(&conn, "jobs", "lease_expires_at").unwrap());
    }

    #[test]
    fn test_add_column_skipped_when_present() {
        let conn = fresh();
        // Simulate a database where v5's column was added by hand before
        // the migration was recorded.
        conn.execute_batch(include_str!("sql/001_create_jobs.sql"))
            .unwrap();
        conn.execute_batch("ALTER TABLE jobs ADD COLUMN lease_token TEXT;")
            .unwrap();
        conn.execute_batch(
            "CREATE TABLE _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            INSERT INTO _migrations (version, description) VALUES (1, 'create_jobs_table');",
        )
        .unwrap();

        run_all(&conn).unwrap();
        assert!(column_exists(&conn, "jobs", "lease_expires_at").unwrap());
    }

    #[test]
    fn test_column_exists_rejects_bad_identifier() {
        let conn = fresh();
        assert!(column_exists(&conn, "jobs; DROP TABLE x", "id").is_err());
    }

    #[test]
    fn test_unit_key_index_allows_multiple_sources() {
        let conn = fresh();
        run_all(&conn).unwrap();
        // Source records have no parent; the partial index must not treat
        // NULL parents as colliding.
        for (id, slug) in [("s1", "a"), ("s2", "b")] {
            conn.execute(
                "INSERT INTO content_records (id, scope_id, dimension, sub_type, slug, title, created_at, updated_at)
                 VALUES (?1, 'c', 'en', 'article', ?2, 't', 'x', 'x')",
                rusqlite::params![id, slug],
            )
            .unwrap();
        }
    }
}
