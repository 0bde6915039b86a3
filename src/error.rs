//! Errors surfaced at the engine boundary.
//!
//! Script and transport failures never appear here: they are folded into
//! the affected [`CaseResult`](crate::model::CaseResult).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or incomplete input, rejected before anything executes.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// A store write or read failed; aborts an in-progress run.
    #[error("persistence failure: {0:#}")]
    Persistence(#[source] anyhow::Error),
}

impl EngineError {
    pub fn persistence(err: anyhow::Error) -> Self {
        EngineError::Persistence(err)
    }
}
