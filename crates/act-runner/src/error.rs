// Typed errors raised by the pipeline and the job engine. Everything else
// travels as `anyhow::Error` with context attached.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Pipeline was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("Unsupported action '{uses}' in step '{step}'")]
    UnsupportedAction { step: String, uses: String },

    #[error("The {0} container has not been started")]
    ContainerNotStarted(&'static str),

    #[error("Step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Unable to evaluate expression '{expression}': {reason}")]
    Expression { expression: String, reason: String },
}

impl RunnerError {
    pub fn expression(expression: &str, reason: impl Into<String>) -> Self {
        RunnerError::Expression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}
