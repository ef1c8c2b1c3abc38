//! Execution service error types.

use thiserror::Error;

use crate::store::StoreError;
use crate::trigger::TriggerError;
use crate::validation::ValidationError;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by [`super::ReportEngine`].
///
/// Failures inside a run (field resolution, rendering, cancellation) are not
/// errors here: they end the execution in a terminal state and are reported
/// through its `ExecutionResult`.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The template failed validation and was not saved.
    #[error("template '{template}' is invalid: {}", errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    InvalidTemplate {
        template: String,
        errors: Vec<ValidationError>,
    },

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

impl EngineError {
    /// Whether the error reports a template-authoring problem.
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::InvalidTemplate { .. })
    }
}
