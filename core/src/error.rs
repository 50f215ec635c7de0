use thiserror::Error;

/// Hard failures of the dialogue core.
///
/// Recoverable input problems never show up here: missing and invalid answers
/// become another elicitation instead.
#[derive(Debug, Error)]
pub enum DialogueError {
    /// The orchestrator produced a result that is neither "needs input" nor
    /// "ready". Always a logic defect, reproducible from the same input.
    #[error(
        "orchestrator invariant violated: needs_input={needs_input}, processed_args={processed_args}, elicitation_request={elicitation_request}"
    )]
    InvariantViolation {
        needs_input: bool,
        processed_args: bool,
        elicitation_request: bool,
    },

    /// The echoed elicitation context could not be decoded.
    #[error("Invalid elicitation context: {0}")]
    InvalidContext(String),

    /// The echoed context belongs to a different resource type or workflow.
    #[error("Elicitation context was issued for {expected}, not {actual}")]
    ContextMismatch { expected: String, actual: String },

    /// A field answer names a field the schema does not declare.
    #[error("Field '{field}' is not part of the {resource_type} schema")]
    UnknownField {
        resource_type: String,
        field: String,
    },

    #[error("Prompt template '{0}' is not available")]
    MissingPrompt(String),
}

impl DialogueError {
    /// Machine-readable code for tool error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            DialogueError::InvariantViolation { .. } => codes::INVARIANT_VIOLATION,
            DialogueError::InvalidContext(_) | DialogueError::ContextMismatch { .. } => {
                codes::INVALID_CONTEXT
            }
            DialogueError::UnknownField { .. } => codes::VALIDATION_FAILED,
            DialogueError::MissingPrompt(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Whether the caller can fix this by changing its input.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            DialogueError::InvalidContext(_)
                | DialogueError::ContextMismatch { .. }
                | DialogueError::UnknownField { .. }
        )
    }
}

/// Error codes shared by the core and the tool surface.
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const INVALID_CONTEXT: &str = "invalid_context";
    pub const MISSING_REQUIRED_FIELDS: &str = "missing_required_fields";
    pub const INVARIANT_VIOLATION: &str = "orchestrator_invariant_violation";
    pub const DOWNSTREAM_EXECUTION_ERROR: &str = "downstream_execution_error";
    pub const INTERNAL_ERROR: &str = "internal_error";
}
