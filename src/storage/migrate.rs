//! Schema versioning and additive migrations.
//!
//! The stored version lives in a single row of the `schema_version` table.
//! On startup [`ensure_schema`] compares it with [`SCHEMA_VERSION`]:
//! - no record: fresh installation, record the current version
//! - older: apply every step above the stored version, then record the new one
//! - newer: refuse to touch anything
//!
//! Steps only ever add columns.

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use super::schema::{create_version_table, initialize_schema, table_exists, SCHEMA_VERSION_TABLE};

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 20;

const VERSION_KEY: &str = "schema_version";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("stored schema version {stored} is newer than supported version {supported}")]
    NewerThanSupported { stored: i64, supported: i64 },
}

/// Outcome of [`ensure_schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    /// No version was recorded; the current one was written.
    Fresh,
    /// Stored version already matches.
    Current,
    /// Migrations ran from `from` up to `to`.
    Migrated { from: i64, to: i64 },
}

/// A column added by a migration step.
#[derive(Debug)]
struct AddColumn {
    table: &'static str,
    column: &'static str,
    definition: &'static str,
}

/// Steps that bring a database up to `version`.
#[derive(Debug)]
struct Migration {
    version: i64,
    columns: &'static [AddColumn],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 17,
        columns: &[AddColumn {
            table: "spawn",
            column: "form",
            definition: "INTEGER",
        }],
    },
    Migration {
        version: 18,
        columns: &[AddColumn {
            table: "spawn",
            column: "cp",
            definition: "INTEGER",
        }],
    },
    Migration {
        version: 19,
        columns: &[AddColumn {
            table: "spawn",
            column: "cp_multiplier",
            definition: "REAL",
        }],
    },
    Migration {
        version: 20,
        columns: &[
            AddColumn {
                table: "structure",
                column: "slots_available",
                definition: "INTEGER NOT NULL DEFAULT 0",
            },
            AddColumn {
                table: "structure",
                column: "score",
                definition: "INTEGER NOT NULL DEFAULT 0",
            },
            AddColumn {
                table: "structure_member",
                column: "cp_decayed",
                definition: "INTEGER NOT NULL DEFAULT 0",
            },
            AddColumn {
                table: "structure_member",
                column: "deployment_time",
                definition: "INTEGER NOT NULL DEFAULT 0",
            },
        ],
    },
];

/// Read the stored schema version, if any.
pub fn stored_version(conn: &Connection) -> Result<Option<i64>, SchemaError> {
    if !table_exists(conn, SCHEMA_VERSION_TABLE)? {
        return Ok(None);
    }
    let version = conn
        .query_row(
            "SELECT val FROM schema_version WHERE key = ?1",
            params![VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version)
}

fn write_version(conn: &Connection, version: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_version (key, val) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET val = excluded.val",
        params![VERSION_KEY, version],
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2")?;
    stmt.exists(params![table, column])
}

/// Bring the stored schema version in line with [`SCHEMA_VERSION`].
///
/// # Errors
///
/// Returns [`SchemaError::NewerThanSupported`] without modifying anything if
/// the database was written by a newer build.
pub fn ensure_schema(conn: &mut Connection) -> Result<SchemaStatus, SchemaError> {
    let Some(stored) = stored_version(conn)? else {
        let tx = conn.transaction()?;
        create_version_table(&tx)?;
        write_version(&tx, SCHEMA_VERSION)?;
        tx.commit()?;
        tracing::info!(version = SCHEMA_VERSION, "Recorded schema version for new database");
        return Ok(SchemaStatus::Fresh);
    };

    if stored > SCHEMA_VERSION {
        tracing::error!(
            stored,
            supported = SCHEMA_VERSION,
            "Stored schema version is newer than supported, refusing to continue"
        );
        return Err(SchemaError::NewerThanSupported {
            stored,
            supported: SCHEMA_VERSION,
        });
    }

    if stored == SCHEMA_VERSION {
        return Ok(SchemaStatus::Current);
    }

    tracing::info!(from = stored, to = SCHEMA_VERSION, "Migrating schema");
    let tx = conn.transaction()?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > stored) {
        for step in migration.columns {
            // Tables created later get the column from their full definition.
            if !table_exists(&tx, step.table)? || column_exists(&tx, step.table, step.column)? {
                continue;
            }
            tracing::debug!(
                version = migration.version,
                table = step.table,
                column = step.column,
                "Adding column"
            );
            tx.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                step.table, step.column, step.definition
            ))?;
        }
    }
    write_version(&tx, SCHEMA_VERSION)?;
    tx.commit()?;

    Ok(SchemaStatus::Migrated {
        from: stored,
        to: SCHEMA_VERSION,
    })
}

/// Check the schema version, then create any missing table.
pub fn create_tables(conn: &mut Connection) -> Result<Vec<&'static str>, SchemaError> {
    ensure_schema(conn)?;
    Ok(initialize_schema(conn)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT sql FROM sqlite_master WHERE sql IS NOT NULL ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_migrations_are_ordered_and_end_at_current() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
        assert_eq!(versions.last(), Some(&SCHEMA_VERSION));
    }

    #[test]
    fn test_fresh_database_records_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(ensure_schema(&mut conn).unwrap(), SchemaStatus::Fresh);
        assert_eq!(stored_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        assert_eq!(ensure_schema(&mut conn).unwrap(), SchemaStatus::Current);
    }

    #[test]
    fn test_create_tables_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        let created = create_tables(&mut conn).unwrap();
        assert_eq!(created.len(), 8);
        assert!(create_tables(&mut conn).unwrap().is_empty());
    }

    #[test]
    fn test_column_exists() {
        let mut conn = Connection::open_in_memory().unwrap();
        create_tables(&mut conn).unwrap();
        assert!(column_exists(&conn, "spawn", "form").unwrap());
        assert!(!column_exists(&conn, "spawn", "shiny").unwrap());
    }
}
