//! Error taxonomy for the pipeline stores and resilience layer.
//!
//! Store-level variants ([`Duplicate`](PipelineError::Duplicate),
//! [`Empty`](PipelineError::Empty), [`NotFound`](PipelineError::NotFound),
//! [`Session`](PipelineError::Session), [`Incomplete`](PipelineError::Incomplete))
//! are contract signals that callers handle locally. Collaborator-level
//! variants ([`Collaborator`](PipelineError::Collaborator),
//! [`CircuitOpen`](PipelineError::CircuitOpen)) end up in the run report's
//! error list. [`Cancelled`](PipelineError::Cancelled) stops the current
//! stage but never the report.

use thiserror::Error;

/// Result alias used by the stores and resilience primitives.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Enqueue of an id that is already known, in any status.
    #[error("duplicate work item: {id} (status: {status})")]
    Duplicate { id: String, status: String },

    /// Dequeue with nothing pending.
    #[error("no pending work items")]
    Empty,

    /// Unknown item, session or research steps.
    #[error("not found: {0}")]
    NotFound(String),

    /// Append attempted on a completed research session.
    #[error("research session {0} is already completed")]
    Session(String),

    /// Validation requested before the session was completed.
    #[error("research session {0} is not completed")]
    Incomplete(String),

    /// External collaborator failed after all retries.
    #[error("collaborator '{name}' failed after {attempts} attempt(s): {message}")]
    Collaborator {
        name: String,
        attempts: u32,
        message: String,
    },

    /// Call rejected because the collaborator's breaker is open.
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// Run cancelled mid-flight.
    #[error("cancelled during {0}")]
    Cancelled(String),

    /// A stage transition outside the controller's transition table.
    #[error("invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// True for failures a later run may retry (collaborator trouble,
    /// cancellation). Store contract violations are not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Collaborator { .. }
                | PipelineError::CircuitOpen(_)
                | PipelineError::Cancelled(_)
        )
    }
}
