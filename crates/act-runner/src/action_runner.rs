// ActionRunner: runs the action behind one step inside the job container.
// The default runner executes `run:` scripts and treats a checkout of the
// local repository as already done; other actions are not supported.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use act_common::constants::paths;

use crate::error::RunnerError;
use crate::model::{Step, StepType};
use crate::pipeline::PipelineContext;
use crate::run_context::RunContext;

#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Run `step` with its composed `env`. An error fails the step.
    async fn run_step(
        &self,
        rc: Arc<RunContext>,
        step: &Step,
        env: HashMap<String, String>,
        ctx: PipelineContext,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultActionRunner;

#[async_trait]
impl ActionRunner for DefaultActionRunner {
    async fn run_step(
        &self,
        rc: Arc<RunContext>,
        step: &Step,
        env: HashMap<String, String>,
        ctx: PipelineContext,
    ) -> Result<()> {
        match step.step_type() {
            StepType::Run => {
                let script = rc.evaluator().interpolate(&step.run)?;
                let command = wrap_working_directory(&step.working_directory, shell_command(&step.shell, script)?);
                rc.exec_job_container(command, env).execute(ctx).await
            }
            StepType::UsesActionRemote if rc.github_context().is_local_checkout(step) => {
                tracing::info!(target: "step", job = %ctx.job(), "Skipping local checkout of '{}'", step.uses);
                Ok(())
            }
            StepType::Invalid => bail!("Step '{}' must declare either 'run' or 'uses'", step),
            StepType::UsesDockerUrl | StepType::UsesActionLocal | StepType::UsesActionRemote => {
                Err(RunnerError::UnsupportedAction {
                    step: step.to_string(),
                    uses: step.uses.clone(),
                }
                .into())
            }
        }
    }
}

/// Command line running `script` with the named shell.
pub fn shell_command(shell: &str, script: String) -> Result<Vec<String>> {
    let prefix: &[&str] = match shell {
        "" | "bash" => &["bash", "--noprofile", "--norc", "-eo", "pipefail", "-c"],
        "sh" => &["sh", "-e", "-c"],
        "python" => &["python", "-c"],
        other => bail!("Unsupported shell '{}'", other),
    };
    let mut command: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
    command.push(script);
    Ok(command)
}

/// Run `command` from `working_directory`, relative to the workspace unless
/// absolute.
pub fn wrap_working_directory(working_directory: &str, command: Vec<String>) -> Vec<String> {
    if working_directory.is_empty() {
        return command;
    }
    let dir = if working_directory.starts_with('/') {
        working_directory.to_string()
    } else {
        format!("{}/{}", paths::WORKSPACE, working_directory)
    };
    let mut wrapped = vec![
        "sh".to_string(),
        "-c".to_string(),
        r#"cd "$0" && exec "$@""#.to_string(),
        dir,
    ];
    wrapped.extend(command);
    wrapped
}
