// Expression evaluation for `if:` conditions and `${{ }}` interpolation.
// The engine talks to evaluators through `ExpressionEvaluator`; a new one is
// built for every step from an explicit `ExpressionSnapshot` of the run.

pub mod evaluator;

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::github_context::GithubContext;
use crate::steps_context::{JobContext, StepsContext};

pub use evaluator::{DefaultEvaluator, DefaultEvaluatorFactory};

pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate a bare expression and render the result as a string.
    fn evaluate(&self, expression: &str) -> Result<String>;

    /// Replace every `${{ expr }}` in `text` with its value.
    fn interpolate(&self, text: &str) -> Result<String>;
}

pub trait EvaluatorFactory: Send + Sync {
    fn new_evaluator(&self, snapshot: ExpressionSnapshot) -> Arc<dyn ExpressionEvaluator>;
}

/// The contexts visible to one evaluator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExpressionSnapshot {
    pub github: GithubContext,
    pub env: HashMap<String, String>,
    pub job: JobContext,
    pub steps: StepsContext,
    pub matrix: HashMap<String, serde_json::Value>,
    pub secrets: HashMap<String, String>,
}

/// Result of a boolean condition. Evaluation errors are coerced to `false`
/// and kept for logging.
#[derive(Debug)]
pub struct CoercedBool {
    pub value: bool,
    pub error: Option<anyhow::Error>,
}

/// Evaluate `expression` as a condition.
///
/// An empty expression is true and never reaches the evaluator. Otherwise the
/// expression is interpolated, wrapped in `Boolean(...)` and is true only
/// when that yields `"true"`.
pub fn eval_bool(evaluator: &dyn ExpressionEvaluator, expression: &str) -> CoercedBool {
    if expression.trim().is_empty() {
        return CoercedBool {
            value: true,
            error: None,
        };
    }

    let result = evaluator
        .interpolate(expression)
        .and_then(|interpolated| evaluator.evaluate(&format!("Boolean({interpolated})")));

    match result {
        Ok(value) => {
            tracing::debug!(target: "step", "Expression '{}' evaluated to '{}'", expression, value);
            CoercedBool {
                value: value == "true",
                error: None,
            }
        }
        Err(e) => CoercedBool {
            value: false,
            error: Some(e),
        },
    }
}
