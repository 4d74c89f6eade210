//! Typed classification of storage failures.
//!
//! Failures are sorted at the storage-client boundary into variants the
//! write path can act on. The only decision that matters downstream is
//! [`StorageError::is_unrecoverable`]: data-shape problems are never
//! retried, everything else is worth another attempt.

use rusqlite::ffi;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Extended result code for a value of the wrong type in a STRICT table.
const SQLITE_CONSTRAINT_DATATYPE: i32 = 3091;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Row violates a CHECK, NOT NULL, UNIQUE or FOREIGN KEY constraint.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Value cannot be stored in (or read from) the target column type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Row does not match the table's column set.
    #[error("malformed row: {0}")]
    MalformedRow(String),

    /// Connection could not be acquired or the database became unreachable.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Lock contention outlasted the busy timeout.
    #[error("timed out waiting for lock: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Data-shape errors: retrying the same rows cannot succeed.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            StorageError::ConstraintViolation(_)
                | StorageError::TypeMismatch(_)
                | StorageError::MalformedRow(_)
        )
    }

    /// The connection itself is suspect and should be re-acquired.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, StorageError::ConnectionLost(_))
    }

    /// Short label used as a metric attribute.
    pub fn class(&self) -> &'static str {
        if self.is_unrecoverable() {
            "unrecoverable"
        } else {
            "transient"
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        let message = err.to_string();
        match &err {
            rusqlite::Error::SqliteFailure(ffi::Error { code, extended_code }, _) => {
                if *extended_code == SQLITE_CONSTRAINT_DATATYPE {
                    return StorageError::TypeMismatch(message);
                }
                match code {
                    ErrorCode::ConstraintViolation => StorageError::ConstraintViolation(message),
                    ErrorCode::TypeMismatch | ErrorCode::TooBig => {
                        StorageError::TypeMismatch(message)
                    }
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                        StorageError::Timeout(message)
                    }
                    ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::PermissionDenied
                    | ErrorCode::ReadOnly => StorageError::ConnectionLost(message),
                    _ => StorageError::Other(message),
                }
            }
            rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::ToSqlConversionFailure(_)
            | rusqlite::Error::IntegralValueOutOfRange(..) => StorageError::TypeMismatch(message),
            rusqlite::Error::InvalidParameterCount(..)
            | rusqlite::Error::InvalidColumnIndex(_)
            | rusqlite::Error::InvalidColumnName(_) => StorageError::MalformedRow(message),
            _ => StorageError::Other(message),
        }
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(err: r2d2::Error) -> Self {
        StorageError::ConnectionLost(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn failing(sql: &str) -> StorageError {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id TEXT PRIMARY KEY NOT NULL, n INTEGER NOT NULL CHECK (n >= 0)) STRICT;",
        )
        .unwrap();
        conn.execute_batch(sql).unwrap_err().into()
    }

    #[test]
    fn test_check_failure_is_constraint_violation() {
        let err = failing("INSERT INTO t VALUES ('a', -1)");
        assert!(matches!(err, StorageError::ConstraintViolation(_)));
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn test_wrong_type_in_strict_table_is_type_mismatch() {
        let err = failing("INSERT INTO t VALUES ('a', 'not a number')");
        assert!(err.is_unrecoverable(), "{err:?}");
        assert!(err.to_string().contains("cannot store TEXT value"));
    }

    #[test]
    fn test_parameter_count_is_malformed_row() {
        let conn = Connection::open_in_memory().unwrap();
        let err: StorageError = conn
            .execute("SELECT ?1, ?2", rusqlite::params![1])
            .unwrap_err()
            .into();
        assert!(matches!(err, StorageError::MalformedRow(_)));
    }

    #[test]
    fn test_busy_is_transient() {
        let err: StorageError = rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        )
        .into();
        assert!(matches!(err, StorageError::Timeout(_)));
        assert!(!err.is_unrecoverable());
        assert_eq!(err.class(), "transient");
    }

    #[test]
    fn test_io_failure_is_connection_lost() {
        let err: StorageError =
            rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_IOERR), None).into();
        assert!(err.is_connection_lost());
        assert!(!err.is_unrecoverable());
    }
}
