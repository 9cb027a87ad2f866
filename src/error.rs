//! Error types for the transactional access layer.
//!
//! All fallible operations return [`DbResult`]. SQL and connection failures
//! propagate unchanged from the statement that caused them up through the
//! query builder and the unit-of-work context; cleanup paths absorb their own
//! failures so a broken rollback can never prevent a connection release.

use crate::context::TxState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection pool exhausted: {message}")]
    PoolExhausted { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("SQL execution failed: {message}")]
    Sql {
        message: String,
        /// e.g. "23000" for a constraint violation
        sql_state: Option<String>,
    },

    #[error("Unit of work already closed (state: {state})")]
    UnitClosed { state: TxState },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a pool exhaustion error.
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a SQL execution error with optional SQLSTATE code.
    pub fn sql(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Sql {
            message: message.into(),
            sql_state,
        }
    }

    /// Create an error for operations on a finished unit of work.
    pub fn unit_closed(state: TxState) -> Self {
        Self::UnitClosed { state }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the SQLSTATE code for this error, if the server reported one.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Sql { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                DbError::pool_exhausted("No connection became free before the acquire timeout")
            }
            sqlx::Error::PoolClosed => DbError::connection("Connection pool is closed"),
            sqlx::Error::Configuration(msg) => DbError::config(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let sql_state = db_err.code().map(|c| c.to_string());
                DbError::sql(db_err.message(), sql_state)
            }
            sqlx::Error::RowNotFound => DbError::sql("No rows returned", None),
            sqlx::Error::Io(io_err) => DbError::connection(format!("I/O error: {io_err}")),
            sqlx::Error::Tls(tls_err) => DbError::connection(format!("TLS error: {tls_err}")),
            sqlx::Error::Protocol(msg) => DbError::connection(format!("Protocol error: {msg}")),
            sqlx::Error::AnyDriverError(err) => {
                DbError::connection(format!("Driver error: {err}"))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::sql(format!("Column not found: {col}"), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => {
                DbError::internal(format!("Column index {index} out of bounds (len: {len})"))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {index}: {source}"))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {source}")),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unexpected database error: {err}")),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::pool_exhausted("all 10 connections in use");
        assert!(err.to_string().contains("Connection pool exhausted"));

        let err = DbError::unit_closed(TxState::TimedOut);
        assert!(err.to_string().contains("timed_out"));
    }

    #[test]
    fn test_sql_state_accessor() {
        let err = DbError::sql("duplicate key", Some("23000".to_string()));
        assert_eq!(err.sql_state(), Some("23000"));
        assert_eq!(DbError::connection("refused").sql_state(), None);
    }

    #[test]
    fn test_pool_timeout_maps_to_pool_exhausted() {
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, DbError::PoolExhausted { .. }));
    }

    #[test]
    fn test_pool_closed_maps_to_connection() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, DbError::Connection { .. }));
    }

    #[test]
    fn test_row_not_found_maps_to_sql() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::Sql { .. }));
    }

    #[test]
    fn test_protocol_error_maps_to_connection() {
        let err: DbError = sqlx::Error::Protocol("bad handshake".to_string()).into();
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(err.to_string().contains("bad handshake"));
    }
}
