//! Storage error shared by the Postgres-backed stores.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization failure, deadlock) | `40001`, `40P01` | `Unavailable` |
//! | Database (other) | Any other | `Query` |
//! | PoolClosed, PoolTimedOut, Io, Tls | N/A | `Unavailable` |
//! | ColumnDecode, Decode | N/A | `Corrupt` |
//! | Other | N/A | `Query` |

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The database could not be reached or the statement should simply be re-run.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("constraint conflict: {0}")]
    Conflict(String),

    /// A row could not be decoded into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// Whether a later attempt might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("40001") | Some("40P01") => StoreError::Unavailable(msg),
                _ => StoreError::Query(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => {
            StoreError::Unavailable(format!("tls error in {}: {}", operation, e))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        _ => StoreError::Query(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_transient() {
        assert!(map_sqlx_error("claim", sqlx::Error::PoolClosed).is_transient());
        assert!(map_sqlx_error("claim", sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn row_not_found_is_a_query_error() {
        let err = map_sqlx_error("get", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Query(_)));
        assert!(!err.is_transient());
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
