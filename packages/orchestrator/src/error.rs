//! Pattern-matchable error types for store and view operations.
//!
//! Only genuine failures become errors. Lease contention is a `bool`,
//! a guardrail BLOCK is a state transition, and an empty queue is
//! `Ok(None)`; callers must be able to branch on those without string
//! matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The id does not exist in the store.
    #[error("row id not found: {0}")]
    NotFound(String),

    /// `add` was called with an id that already exists.
    #[error("row id already exists: {0}")]
    DuplicateId(String),

    /// The requested state change is not legal from the current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The tabular view cannot be parsed back into rows.
    #[error("view schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_id() {
        assert_eq!(
            StoreError::NotFound("ORCH-9".into()).to_string(),
            "row id not found: ORCH-9"
        );
        assert_eq!(
            StoreError::DuplicateId("ORCH-1".into()).to_string(),
            "row id already exists: ORCH-1"
        );
    }

    #[test]
    fn sqlx_errors_convert() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::Sqlx(_)));
    }
}
