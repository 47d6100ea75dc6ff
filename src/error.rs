//! Error taxonomy for the migration orchestrator.
//!
//! Failures fall into five kinds with distinct handling: transient errors
//! are retried with backoff, data errors fail the offending transaction,
//! planning errors abort immediately, tool errors surface the external
//! command's output, and protocol errors abort with the offending LSN.

use thiserror::Error;

use crate::lsn::Lsn;

#[derive(Error, Debug)]
pub enum Error {
    /// Connection resets, deadlocks, lock and serialization failures.
    /// Retried up to the configured attempt limit.
    #[error("transient error: {0}")]
    Transient(String),

    /// Constraint violations and type mismatches during apply.
    #[error("data error applying transaction at {lsn}: {message}")]
    Data { lsn: Lsn, message: String },

    /// Missing source objects, permission failures, bad configuration.
    #[error("planning error: {0}")]
    Planning(String),

    /// Non-zero exit from pg_dump/pg_restore.
    #[error("{tool} failed with {status}: {stderr}")]
    Tool {
        tool: String,
        status: String,
        stderr: String,
    },

    /// Unparseable logical decoding output.
    #[error("protocol error at {lsn}: {message}")]
    Protocol { lsn: Lsn, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE codes that indicate a retryable condition: serialization
/// failure, deadlock detected, lock not available, admin shutdown,
/// crash shutdown, cannot connect now.
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57P01", "57P02", "57P03"];

/// Classify a database error as transient (retry) or not (fail the task).
/// Closed connections have no SQLSTATE and are always transient.
pub fn is_transient(err: &tokio_postgres::Error) -> bool {
    if err.is_closed() {
        return true;
    }
    match err.code() {
        Some(state) => TRANSIENT_SQLSTATES.contains(&state.code()),
        // No SQLSTATE means the failure happened outside the server:
        // broken pipe, timeout, unexpected EOF.
        None => true,
    }
}

/// SQLSTATE class 23 covers integrity constraint violations, the
/// apply-side "data" error kind.
pub fn is_data_error(err: &tokio_postgres::Error) -> bool {
    matches!(err.code(), Some(state) if state.code().starts_with("23"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_identity() {
        let err = Error::Data {
            lsn: Lsn(0x1949850),
            message: "duplicate key".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("0/1949850"));
        assert!(rendered.contains("duplicate key"));
    }

    #[test]
    fn test_tool_error_display() {
        let err = Error::Tool {
            tool: "pg_restore".into(),
            status: "exit status: 1".into(),
            stderr: "could not connect".into(),
        };
        assert!(err.to_string().starts_with("pg_restore failed"));
    }
}
