use std::borrow::Cow;

use sqlx::error::DatabaseError;
use thiserror::Error;

/// SQLSTATE for `invalid_text_representation`, raised when a value cannot be parsed as the
/// column type (e.g. a malformed UUID).
const INVALID_TEXT_REPRESENTATION: &str = "22P02";

/// Unified error type for database operations that application code can handle.
///
/// Every variant that originates in the storage layer keeps the original [`sqlx::Error`] as
/// its [`source`](std::error::Error::source), prefixed with a short static label naming the
/// operation that failed (`"execute insert"`, `"scan result"`, ...).
#[derive(Error, Debug)]
pub enum DbError {
    /// The query succeeded but matched no rows
    #[error("{operation}: entity not found")]
    NotFound {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Unique constraint violation
    #[error("{operation}: {message}")]
    UniqueViolation {
        operation: &'static str,
        constraint: Option<String>,
        table: Option<String>,
        message: String,
        /// The conflicting value that caused the violation (if extractable)
        conflicting_value: Option<String>,
        #[source]
        source: sqlx::Error,
    },

    /// Foreign key constraint violation
    #[error("{operation}: {message}")]
    ForeignKeyViolation {
        operation: &'static str,
        constraint: Option<String>,
        table: Option<String>,
        message: String,
        #[source]
        source: sqlx::Error,
    },

    /// Check constraint violation
    #[error("{operation}: {message}")]
    CheckViolation {
        operation: &'static str,
        constraint: Option<String>,
        table: Option<String>,
        message: String,
        #[source]
        source: sqlx::Error,
    },

    /// A value was rejected by the column type's input parser
    #[error("{operation}: {message}")]
    InvalidInput {
        operation: &'static str,
        message: String,
        #[source]
        source: sqlx::Error,
    },

    /// Any other storage failure (connectivity, protocol, unclassified database errors)
    #[error("{operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DbError {
    /// Wrap a [`sqlx::Error`] raised while performing `operation`, classifying it using the
    /// driver's error categorization.
    pub fn wrap(operation: &'static str, err: sqlx::Error) -> Self {
        let Some(db_err) = err.as_database_error() else {
            return if matches!(err, sqlx::Error::RowNotFound) {
                DbError::NotFound { operation, source: err }
            } else {
                DbError::Database { operation, source: err }
            };
        };

        let constraint = db_err.constraint().map(|s| s.to_string());
        let table = db_err.table().map(|s| s.to_string());
        let message = db_err.message().to_string();

        if db_err.is_unique_violation() {
            let conflicting_value = db_err
                .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
                .and_then(|pg_err| pg_err.detail())
                .and_then(extract_conflicting_value);

            DbError::UniqueViolation {
                operation,
                constraint,
                table,
                message,
                conflicting_value,
                source: err,
            }
        } else if db_err.is_foreign_key_violation() {
            DbError::ForeignKeyViolation {
                operation,
                constraint,
                table,
                message,
                source: err,
            }
        } else if db_err.is_check_violation() {
            DbError::CheckViolation {
                operation,
                constraint,
                table,
                message,
                source: err,
            }
        } else if db_err.code().as_deref() == Some(INVALID_TEXT_REPRESENTATION) {
            DbError::InvalidInput {
                operation,
                message,
                source: err,
            }
        } else {
            DbError::Database { operation, source: err }
        }
    }

    /// True when the query matched no rows.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound { .. })
    }

    /// The underlying [`sqlx::Error`], if this error came from the storage layer.
    pub fn sqlx_error(&self) -> Option<&sqlx::Error> {
        match self {
            DbError::NotFound { source, .. }
            | DbError::UniqueViolation { source, .. }
            | DbError::ForeignKeyViolation { source, .. }
            | DbError::CheckViolation { source, .. }
            | DbError::InvalidInput { source, .. }
            | DbError::Database { source, .. } => Some(source),
            DbError::Other(err) => err.downcast_ref::<sqlx::Error>(),
        }
    }

    /// The database-reported error behind this one, if any.
    pub fn database_error(&self) -> Option<&(dyn DatabaseError + 'static)> {
        self.sqlx_error().and_then(sqlx::Error::as_database_error)
    }

    /// The SQLSTATE code reported by PostgreSQL (e.g. `23505` for a unique violation).
    pub fn code(&self) -> Option<Cow<'_, str>> {
        self.database_error().and_then(|db_err| db_err.code())
    }
}

/// Extract the conflicting value from a PostgreSQL unique violation detail message, which
/// looks like: `Key (user_id)=(29974652-b51f-4826-baf0-c8bd2f1cf4c9) already exists.`
fn extract_conflicting_value(detail: &str) -> Option<String> {
    let start = detail.find("=(")? + 2;
    let end = detail[start..].rfind(") already exists")?;
    Some(detail[start..start + end].to_string())
}

/// Type alias for database operation results
pub type Result<T> = std::result::Result<T, DbError>;
