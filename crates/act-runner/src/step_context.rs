// StepContext: one step of a job.
//
// pending → evaluating condition → skipped | running → succeeded | failed
//
// The step result is registered before the condition is evaluated, so a
// skipped step still shows up as successful in the steps context.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use act_common::constants::{env as env_names, paths};
use act_sdk::ProcessCancelledError;

use crate::error::{PipelineError, RunnerError};
use crate::expressions::{eval_bool, ExpressionEvaluator};
use crate::model::Step;
use crate::pipeline::{Executor, PipelineContext};
use crate::run_context::RunContext;

pub struct StepContext {
    rc: Arc<RunContext>,
    step: Step,
}

impl StepContext {
    /// A step without an id is identified by its position.
    pub fn new(rc: Arc<RunContext>, mut step: Step, index: usize) -> Self {
        if step.id.is_empty() {
            step.id = index.to_string();
        }
        Self { rc, step }
    }

    pub fn id(&self) -> &str {
        &self.step.id
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    /// Environment of the step, lowest precedence first: job overlay, job
    /// `container.env`, `set-env` values, GITHUB_* variables, `PATH` with
    /// `add-path` entries, step `env`, then `INPUT_*` for each `with` entry.
    pub fn setup_env(&self) -> HashMap<String, String> {
        let mut env = self.rc.get_env().clone();
        if let Some(container_env) = self.rc.workflow_run().job().container_env() {
            env.extend(container_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        env.extend(self.rc.extra_env());
        self.rc.with_github_env(&mut env);

        let extra_path = self.rc.extra_path();
        if !extra_path.is_empty() {
            let base = env
                .get(env_names::PATH)
                .cloned()
                .unwrap_or_else(|| paths::DEFAULT_PATH.to_string());
            let mut entries: Vec<String> = extra_path.into_iter().rev().collect();
            entries.push(base);
            env.insert(env_names::PATH.to_string(), entries.join(":"));
        }

        let evaluator = self.rc.new_evaluator_with_env(env.clone());
        for (name, value) in &self.step.env {
            env.insert(name.clone(), self.interpolate(evaluator.as_ref(), value));
        }
        for (name, value) in &self.step.with {
            env.insert(input_env_name(name), self.interpolate(evaluator.as_ref(), value));
        }
        env
    }

    /// Interpolate `value`, keeping it unchanged when that fails.
    fn interpolate(&self, evaluator: &dyn ExpressionEvaluator, value: &str) -> String {
        evaluator.interpolate(value).unwrap_or_else(|e| {
            tracing::warn!(target: "step", "Unable to interpolate '{}' in step '{}': {:#}", value, self.step, e);
            value.to_string()
        })
    }

    pub fn executor(self) -> Executor {
        let sc = Arc::new(self);
        Executor::from_fn(move |ctx| {
            let sc = Arc::clone(&sc);
            async move { sc.execute(ctx).await }
        })
    }

    async fn execute(&self, ctx: PipelineContext) -> Result<()> {
        let id = self.id().to_string();
        self.rc.begin_step(&id);

        let env = self.setup_env();
        let evaluator = self.rc.new_evaluator_with_env(env.clone());
        self.rc.set_evaluator(Arc::clone(&evaluator));

        let condition = eval_bool(evaluator.as_ref(), &self.step.if_condition);
        if let Some(e) = &condition.error {
            tracing::warn!(target: "step", job = %ctx.job(), "Error in if expression '{}': {:#}", self.step.if_condition, e);
        }
        if !condition.value {
            tracing::debug!(target: "step", job = %ctx.job(), "Skipping step '{}' due to '{}'", self.step, self.step.if_condition);
            return Ok(());
        }

        tracing::info!(target: "step", job = %ctx.job(), "Run {}", self.step);
        let result = self
            .rc
            .actions()
            .run_step(Arc::clone(&self.rc), &self.step, env, ctx.clone())
            .await;

        match result {
            Ok(()) => {
                tracing::info!(target: "step", job = %ctx.job(), "Success - {}", self.step);
                Ok(())
            }
            Err(e) => {
                let reason = self.rc.masker().mask_secrets(&format!("{e:#}"));
                tracing::error!(target: "step", job = %ctx.job(), "Failure - {}: {}", self.step, reason);
                self.rc.mark_step_failed(&id);
                if is_cancellation(&e) {
                    return Err(e);
                }
                Err(RunnerError::StepFailed {
                    step: self.step.to_string(),
                    reason,
                }
                .into())
            }
        }
    }
}

/// `INPUT_<NAME>` with the name uppercased and spaces replaced by `_`.
pub fn input_env_name(name: &str) -> String {
    format!("INPUT_{}", name.to_uppercase().replace(' ', "_"))
}

fn is_cancellation(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|cause| cause.is::<PipelineError>() || cause.is::<ProcessCancelledError>())
}
