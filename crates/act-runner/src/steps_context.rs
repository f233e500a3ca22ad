// StepsContext: per-step outcomes and outputs of the running job, projected
// as the `steps.*` and `job.*` expression contexts.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Recorded result for a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    pub success: bool,
    pub outputs: HashMap<String, String>,
}

impl Default for StepResult {
    fn default() -> Self {
        Self {
            success: true,
            outputs: HashMap::new(),
        }
    }
}

/// Step id → result. Serializes as a plain map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StepsContext {
    results: BTreeMap<String, StepResult>,
}

impl StepsContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh successful result for a step that begins evaluation.
    /// An existing result is left untouched.
    pub fn begin_step(&mut self, step_id: &str) {
        self.results.entry(step_id.to_string()).or_default();
    }

    /// Failure is sticky: a failed step never becomes successful again.
    pub fn mark_failed(&mut self, step_id: &str) {
        if let Some(result) = self.results.get_mut(step_id) {
            result.success = false;
        }
    }

    pub fn set_output(&mut self, step_id: &str, name: &str, value: &str) {
        if let Some(result) = self.results.get_mut(step_id) {
            result.outputs.insert(name.to_string(), value.to_string());
        }
    }

    pub fn get(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    pub fn has_step(&self, step_id: &str) -> bool {
        self.results.contains_key(step_id)
    }

    pub fn any_failed(&self) -> bool {
        self.results.values().any(|r| !r.success)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// The `job` context for the current results.
    pub fn job_context(&self) -> JobContext {
        JobContext {
            status: if self.any_failed() { "failure" } else { "success" }.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobContainerContext {
    pub id: String,
    pub network: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceContext {
    pub id: String,
}

/// The `job` expression context. Services are never populated locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobContext {
    pub status: String,
    pub container: JobContainerContext,
    pub services: BTreeMap<String, ServiceContext>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_reflects_failures() {
        let mut steps = StepsContext::new();
        assert_eq!(steps.job_context().status, "success");

        steps.begin_step("0");
        steps.begin_step("build");
        assert_eq!(steps.job_context().status, "success");

        steps.mark_failed("0");
        assert_eq!(steps.job_context().status, "failure");
    }

    #[test]
    fn begin_step_does_not_reset_failure() {
        let mut steps = StepsContext::new();
        steps.begin_step("a");
        steps.mark_failed("a");
        steps.begin_step("a");
        assert!(!steps.get("a").unwrap().success);
    }

    #[test]
    fn outputs_only_for_known_steps() {
        let mut steps = StepsContext::new();
        steps.begin_step("a");
        steps.set_output("a", "version", "1.0");
        steps.set_output("missing", "x", "y");
        assert_eq!(steps.get("a").unwrap().outputs["version"], "1.0");
        assert!(!steps.has_step("missing"));
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn serializes_as_plain_map() {
        let mut steps = StepsContext::new();
        steps.begin_step("a");
        steps.set_output("a", "k", "v");
        let json = serde_json::to_value(&steps).unwrap();
        assert_eq!(json, serde_json::json!({"a": {"success": true, "outputs": {"k": "v"}}}));
    }

    #[test]
    fn job_context_shape() {
        let json = serde_json::to_value(StepsContext::new().job_context()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "success", "container": {"id": "", "network": ""}, "services": {}})
        );
    }
}
