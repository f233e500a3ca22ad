// RunContext: all state of one job execution, and the assembly of the job
// pipeline.
//
// Pipeline (gated by the enablement check):
//   matrix log → start sidecar → start job container → step 0..n → teardown
//
// A failing stage aborts everything after it, teardown included. State lives
// behind a mutex that is never held across an `.await`; container output
// sinks hold a `Weak` back-reference so the containers do not keep the
// context alive.

use anyhow::anyhow;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use act_common::constants::{self, containers, paths, volumes};
use act_common::{Config, JobResult, SecretMasker};
use act_sdk::{LineHandler, LineWriter};

use crate::action_runner::{ActionRunner, DefaultActionRunner};
use crate::command_handler::{CommandEffect, CommandHandler};
use crate::container::{
    create_container_name, merge_maps, Container, ContainerFactory, DockerCli, FileEntry, NewContainerInput,
};
use crate::error::RunnerError;
use crate::expressions::{
    eval_bool, DefaultEvaluatorFactory, EvaluatorFactory, ExpressionEvaluator, ExpressionSnapshot,
};
use crate::git::{CachedGitInfo, GitCli, GitInfo};
use crate::github_context::{GithubContext, ProjectionSource};
use crate::model::Run;
use crate::pipeline::{Executor, PipelineContext};
use crate::step_context::StepContext;
use crate::steps_context::{JobContext, StepsContext};

/// The engine's external collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub containers: Arc<dyn ContainerFactory>,
    pub evaluators: Arc<dyn EvaluatorFactory>,
    pub git: Arc<dyn GitInfo>,
    pub actions: Arc<dyn ActionRunner>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            containers: Arc::new(DockerCli::default()),
            evaluators: Arc::new(DefaultEvaluatorFactory),
            git: Arc::new(GitCli::new()),
            actions: Arc::new(DefaultActionRunner),
        }
    }
}

/// Mutable, job-scoped state.
struct RunState {
    steps: StepsContext,
    current_step: String,
    job_container: Option<Arc<dyn Container>>,
    dind_container: Option<Arc<dyn Container>>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    /// From `set-env`, layered over the overlay for later steps.
    extra_env: HashMap<String, String>,
    /// From `add-path`, in the order received.
    extra_path: Vec<String>,
    /// Outcome of the enablement check once it ran.
    enabled: Option<bool>,
}

pub struct RunContext {
    name: String,
    config: Arc<Config>,
    matrix: HashMap<String, Value>,
    run: Run,
    event_json: String,
    env: OnceCell<HashMap<String, String>>,
    state: Mutex<RunState>,
    containers: Arc<dyn ContainerFactory>,
    evaluators: Arc<dyn EvaluatorFactory>,
    git: Arc<dyn GitInfo>,
    actions: Arc<dyn ActionRunner>,
    masker: SecretMasker,
    commands: Mutex<CommandHandler>,
}

impl fmt::Display for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run.workflow.name, self.name)
    }
}

impl RunContext {
    pub fn new(
        config: Arc<Config>,
        run: Run,
        event_json: String,
        matrix: HashMap<String, Value>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let masker = SecretMasker::with_secrets(config.secrets.values());
        let initial = collaborators.evaluators.new_evaluator(ExpressionSnapshot::default());

        let rc = Arc::new(Self {
            name: run.job_id.clone(),
            config,
            matrix,
            run,
            event_json,
            env: OnceCell::new(),
            state: Mutex::new(RunState {
                steps: StepsContext::new(),
                current_step: String::new(),
                job_container: None,
                dind_container: None,
                evaluator: initial,
                extra_env: HashMap::new(),
                extra_path: Vec::new(),
                enabled: None,
            }),
            containers: collaborators.containers,
            evaluators: collaborators.evaluators,
            git: Arc::new(CachedGitInfo::new(collaborators.git)),
            actions: collaborators.actions,
            commands: Mutex::new(CommandHandler::new(masker.clone())),
            masker,
        });

        let evaluator = rc.new_expression_evaluator();
        rc.state.lock().evaluator = evaluator;
        rc
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workflow_run(&self) -> &Run {
        &self.run
    }

    pub fn matrix(&self) -> &HashMap<String, Value> {
        &self.matrix
    }

    pub fn masker(&self) -> &SecretMasker {
        &self.masker
    }

    pub fn steps(&self) -> StepsContext {
        self.state.lock().steps.clone()
    }

    pub fn current_step(&self) -> String {
        self.state.lock().current_step.clone()
    }

    pub fn job_container(&self) -> Option<Arc<dyn Container>> {
        self.state.lock().job_container.clone()
    }

    pub fn dind_container(&self) -> Option<Arc<dyn Container>> {
        self.state.lock().dind_container.clone()
    }

    /// `None` until the enablement check ran.
    pub fn enabled(&self) -> Option<bool> {
        self.state.lock().enabled
    }

    /// Evaluator for the current step, or the job before any step began.
    pub fn evaluator(&self) -> Arc<dyn ExpressionEvaluator> {
        Arc::clone(&self.state.lock().evaluator)
    }

    pub fn extra_env(&self) -> HashMap<String, String> {
        self.state.lock().extra_env.clone()
    }

    pub fn extra_path(&self) -> Vec<String> {
        self.state.lock().extra_path.clone()
    }

    pub fn action_cache_dir(&self) -> PathBuf {
        self.config.action_cache_dir()
    }

    pub(crate) fn actions(&self) -> Arc<dyn ActionRunner> {
        Arc::clone(&self.actions)
    }

    // -----------------------------------------------------------------------
    // Environment and naming
    // -----------------------------------------------------------------------

    /// Run-wide env overlay: config < workflow < job. Computed once.
    pub fn get_env(&self) -> &HashMap<String, String> {
        self.env.get_or_init(|| {
            merge_maps(&[&self.config.env, &self.run.workflow.env, &self.run.job().env])
        })
    }

    pub fn job_container_name(&self) -> String {
        create_container_name(&[constants::TOOL_NAME, &self.to_string()])
    }

    pub fn dind_container_name(&self) -> String {
        create_container_name(&[constants::TOOL_NAME, "dind", &self.to_string()])
    }

    fn cert_volume_name(&self) -> String {
        format!("{}{}", self.dind_container_name(), volumes::CERT_SUFFIX)
    }

    /// Named volumes mounted into both containers.
    fn shared_mounts(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (self.cert_volume_name(), paths::CERTS_CLIENT.to_string()),
            (
                self.job_container_name(),
                paths::GITHUB_ROOT.trim_end_matches('/').to_string(),
            ),
            (volumes::TOOLCACHE.to_string(), paths::TOOLCACHE.to_string()),
            (volumes::ACTIONS.to_string(), paths::ACTIONS.to_string()),
            (volumes::RUNNER_HOME.to_string(), paths::RUNNER_HOME.to_string()),
        ])
    }

    fn binds(&self) -> Vec<String> {
        if !self.config.bind_workdir {
            return Vec::new();
        }
        let modifier = if cfg!(target_os = "macos") { ":delegated" } else { "" };
        vec![format!(
            "{}:{}{}",
            self.config.workdir.display(),
            paths::WORKSPACE,
            modifier
        )]
    }

    // -----------------------------------------------------------------------
    // Container stages
    // -----------------------------------------------------------------------

    pub fn start_dind_container(self: &Arc<Self>) -> Executor {
        let rc = Arc::clone(self);
        Executor::from_fn(move |ctx| {
            let rc = Arc::clone(&rc);
            async move {
                let mut mounts = rc.shared_mounts();
                mounts.insert(
                    volumes::DIND_IMAGE_CACHE.to_string(),
                    paths::DIND_IMAGE_CACHE.to_string(),
                );
                let (key, value) = constants::env::DOCKER_TLS_CERTDIR;

                let dind = rc.containers.new_container(NewContainerInput {
                    image: containers::DIND_IMAGE.to_string(),
                    name: rc.dind_container_name(),
                    env: vec![format!("{key}={value}")],
                    mounts,
                    binds: rc.binds(),
                    network_mode: containers::NETWORK_MODE.to_string(),
                    privileged: true,
                    stderr: Some(rc.output_writer(false)),
                    ..Default::default()
                });
                rc.state.lock().dind_container = Some(Arc::clone(&dind));

                tracing::debug!(target: "job", job = %ctx.job(), "Start sidecar {}", dind.name());
                Executor::pipeline(vec![
                    dind.pull(false),
                    dind.remove().when_bool(!rc.config.reuse_containers),
                    dind.create(),
                    dind.start(false),
                ])
                .execute(ctx)
                .await
            }
        })
    }

    pub fn start_job_container(self: &Arc<Self>) -> Executor {
        let rc = Arc::clone(self);
        Executor::from_fn(move |ctx| {
            let rc = Arc::clone(&rc);
            async move {
                let image = rc
                    .platform_image()
                    .ok_or_else(|| anyhow!("No image resolved for job '{}'", rc))?;
                tracing::info!(target: "job", job = %ctx.job(), "Start image={}", image);

                let env = [
                    constants::env::RUNNER_TOOL_CACHE,
                    constants::env::RUNNER_OS,
                    constants::env::RUNNER_TEMP,
                    constants::env::DOCKER_TLS_VERIFY,
                    constants::env::DOCKER_CERT_PATH,
                    constants::env::DOCKER_HOST,
                ]
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();

                let dind_name = rc.dind_container_name();
                let links = containers::DIND_ALIASES
                    .iter()
                    .map(|alias| format!("{dind_name}:{alias}"))
                    .collect();

                let job = rc.containers.new_container(NewContainerInput {
                    image,
                    name: rc.job_container_name(),
                    entrypoint: containers::JOB_ENTRYPOINT.iter().map(|s| s.to_string()).collect(),
                    working_dir: paths::WORKSPACE.to_string(),
                    env,
                    mounts: rc.shared_mounts(),
                    binds: rc.binds(),
                    network_mode: containers::NETWORK_MODE.to_string(),
                    links,
                    privileged: false,
                    stdout: Some(rc.output_writer(true)),
                    stderr: Some(rc.output_writer(false)),
                    ..Default::default()
                });
                rc.state.lock().job_container = Some(Arc::clone(&job));

                let (checkout_path, has_checkout) = rc.local_checkout_path();
                let copy_workspace = !rc.config.bind_workdir && has_checkout;
                let copy_to_path = match checkout_path.trim_matches('/') {
                    "" => paths::WORKSPACE.to_string(),
                    sub => format!("{}/{}", paths::WORKSPACE, sub),
                };
                let workdir_src = format!("{}/.", rc.config.workdir.display());

                let files = vec![
                    FileEntry {
                        name: paths::EVENT_FILE.to_string(),
                        mode: containers::FILE_MODE,
                        body: rc.event_json.clone(),
                    },
                    FileEntry {
                        name: paths::HOME_MARKER.to_string(),
                        mode: containers::FILE_MODE,
                        body: String::new(),
                    },
                ];

                Executor::pipeline(vec![
                    job.pull(rc.config.force_pull),
                    job.remove().when_bool(!rc.config.reuse_containers),
                    job.create(),
                    job.start(false),
                    job.copy_dir(&copy_to_path, &workdir_src, false)
                        .when_bool(copy_workspace),
                    job.change_remote_to_https(&copy_to_path).when_bool(copy_workspace),
                    job.copy(paths::GITHUB_ROOT, files),
                ])
                .execute(ctx)
                .await
            }
        })
    }

    /// Run `command` in the job container. Fails when the container was not
    /// started.
    pub fn exec_job_container(&self, command: Vec<String>, env: HashMap<String, String>) -> Executor {
        match self.job_container() {
            Some(container) => container.exec(command, env),
            None => Executor::error(RunnerError::ContainerNotStarted("job")),
        }
    }

    /// Remove both containers and the job volume unless containers are reused.
    pub fn stop_job_container(self: &Arc<Self>) -> Executor {
        let rc = Arc::clone(self);
        Executor::from_fn(move |ctx| {
            let rc = Arc::clone(&rc);
            async move {
                let (job, dind) = {
                    let state = rc.state.lock();
                    (state.job_container.clone(), state.dind_container.clone())
                };
                let Some(job) = job else {
                    return Ok(());
                };
                if rc.config.reuse_containers {
                    return Ok(());
                }

                let mut stages = vec![job.remove()];
                if let Some(dind) = dind {
                    stages.push(dind.remove());
                }
                stages.push(rc.containers.remove_volume(&rc.job_container_name(), false));
                Executor::pipeline(stages).execute(ctx).await
            }
        })
    }

    // -----------------------------------------------------------------------
    // Job pipeline
    // -----------------------------------------------------------------------

    /// The whole job as one executor, gated by `is_enabled`.
    pub fn executor(self: &Arc<Self>) -> Executor {
        let mut stages = Vec::new();

        if !self.matrix.is_empty() {
            let matrix = serde_json::to_string(&self.matrix).unwrap_or_default();
            stages.push(Executor::from_fn(move |ctx| {
                let matrix = matrix.clone();
                async move {
                    tracing::info!(target: "job", job = %ctx.job(), "Matrix: {}", matrix);
                    Ok(())
                }
            }));
        }

        stages.push(self.start_dind_container());
        stages.push(self.start_job_container());
        for (index, step) in self.run.job().steps.iter().enumerate() {
            stages.push(StepContext::new(Arc::clone(self), step.clone(), index).executor());
        }
        stages.push(self.stop_job_container());

        let rc = Arc::clone(self);
        Executor::pipeline(stages).when(move |_| rc.is_enabled())
    }

    /// Execute the job and classify the outcome.
    pub async fn run(self: &Arc<Self>, ctx: PipelineContext) -> JobResult {
        let ctx = ctx.with_job(&self.to_string());
        let result = self.executor().execute(ctx).await;

        match result {
            Err(e) => {
                let reason = self.masker.mask_secrets(&format!("{e:#}"));
                tracing::error!(target: "job", job = %self, "Job failed: {}", reason);
                JobResult::Failed
            }
            Ok(()) if self.enabled() == Some(false) => JobResult::Skipped,
            Ok(()) => {
                tracing::info!(target: "job", job = %self, "Job succeeded");
                JobResult::Succeeded
            }
        }
    }

    /// Image for the job: the explicit container image, else the first
    /// `runs-on` label mapped in the platforms table.
    pub fn platform_image(&self) -> Option<String> {
        let job = self.run.job();
        if let Some(image) = job.container_image() {
            return Some(image.to_string());
        }

        let evaluator = self.evaluator();
        job.runs_on().into_iter().find_map(|label| {
            let platform = evaluator.interpolate(&label).unwrap_or_else(|e| {
                tracing::warn!(target: "job", "Unable to interpolate runs-on '{}': {:#}", label, e);
                label.clone()
            });
            self.config
                .platform_image(&platform.to_lowercase())
                .map(str::to_string)
        })
    }

    /// The job `if` holds and an image resolves. Records the outcome.
    pub fn is_enabled(&self) -> bool {
        let job = self.run.job();
        let evaluator = self.evaluator();
        let condition = eval_bool(evaluator.as_ref(), &job.if_condition);
        if let Some(e) = &condition.error {
            tracing::error!(target: "job", job = %self, "Error evaluating job condition '{}': {:#}", job.if_condition, e);
        }

        let enabled = if !condition.value {
            tracing::debug!(target: "job", job = %self, "Skipping job due to '{}'", job.if_condition);
            false
        } else if self.platform_image().is_none() {
            tracing::info!(target: "job", job = %self, "Skipping unsupported platform '{}'", job.runs_on().join(","));
            false
        } else {
            true
        };

        self.state.lock().enabled = Some(enabled);
        enabled
    }

    // -----------------------------------------------------------------------
    // Context projection
    // -----------------------------------------------------------------------

    pub fn github_context(&self) -> GithubContext {
        let current_step = self.current_step();
        GithubContext::project(&ProjectionSource {
            workflow: &self.run.workflow.name,
            actor: &self.config.actor,
            event_name: &self.config.event_name,
            event_json: &self.event_json,
            workdir: &self.config.workdir,
            current_step: &current_step,
            secrets: &self.config.secrets,
            token_fallback: self.config.github_token.as_deref(),
            git: self.git.as_ref(),
        })
    }

    pub fn with_github_env(&self, env: &mut HashMap<String, String>) {
        self.github_context().apply_env(env);
    }

    /// `with.path` of the first local checkout step, and whether one exists.
    pub fn local_checkout_path(&self) -> (String, bool) {
        let ghc = self.github_context();
        self.run
            .job()
            .steps
            .iter()
            .find(|step| ghc.is_local_checkout(step))
            .map(|step| (step.with.get("path").cloned().unwrap_or_default(), true))
            .unwrap_or_default()
    }

    fn job_context(&self, steps: &StepsContext) -> JobContext {
        let mut job = steps.job_context();
        if let Some(container) = self.job_container() {
            job.container.id = container.name().to_string();
            job.container.network = containers::NETWORK_MODE.to_string();
        }
        job
    }

    /// Snapshot of every expression context with `env` as the env context.
    pub fn snapshot(&self, env: HashMap<String, String>) -> ExpressionSnapshot {
        let steps = self.steps();
        ExpressionSnapshot {
            github: self.github_context(),
            env,
            job: self.job_context(&steps),
            steps,
            matrix: self.matrix.clone(),
            secrets: self.config.secrets.clone(),
        }
    }

    /// Job-level evaluator over the env overlay.
    pub fn new_expression_evaluator(&self) -> Arc<dyn ExpressionEvaluator> {
        self.new_evaluator_with_env(self.get_env().clone())
    }

    pub fn new_evaluator_with_env(&self, env: HashMap<String, String>) -> Arc<dyn ExpressionEvaluator> {
        self.evaluators.new_evaluator(self.snapshot(env))
    }

    // -----------------------------------------------------------------------
    // Step bookkeeping
    // -----------------------------------------------------------------------

    pub(crate) fn begin_step(&self, step_id: &str) {
        let mut state = self.state.lock();
        state.current_step = step_id.to_string();
        state.steps.begin_step(step_id);
    }

    pub(crate) fn mark_step_failed(&self, step_id: &str) {
        self.state.lock().steps.mark_failed(step_id);
    }

    pub(crate) fn set_evaluator(&self, evaluator: Arc<dyn ExpressionEvaluator>) {
        self.state.lock().evaluator = evaluator;
    }

    // -----------------------------------------------------------------------
    // Container output
    // -----------------------------------------------------------------------

    /// Line sink for container output; `commands` routes lines through the
    /// workflow command handler first.
    fn output_writer(self: &Arc<Self>, commands: bool) -> Arc<LineWriter> {
        let weak: Weak<RunContext> = Arc::downgrade(self);
        let handler: LineHandler = Box::new(move |line| {
            if let Some(rc) = weak.upgrade() {
                if commands {
                    rc.handle_output_line(line);
                } else {
                    rc.log_line(line);
                }
            }
            true
        });
        Arc::new(LineWriter::new(vec![handler]))
    }

    /// Apply a workflow command in `line`, or log it.
    pub fn handle_output_line(&self, line: &str) {
        let effect = self.commands.lock().try_process_command(line);
        match effect {
            None => self.log_line(line),
            Some(CommandEffect::SetOutput { name, value }) => {
                let mut state = self.state.lock();
                let step = state.current_step.clone();
                state.steps.set_output(&step, &name, &value);
            }
            Some(CommandEffect::SetEnv { name, value }) => {
                self.state.lock().extra_env.insert(name, value);
            }
            Some(CommandEffect::AddPath(path)) => self.state.lock().extra_path.push(path),
            Some(CommandEffect::Handled) => {}
        }
    }

    fn log_line(&self, line: &str) {
        let masked = self.masker.mask_secrets(line);
        if self.config.log_output {
            tracing::info!(target: "step", job = %self, "  | {}", masked);
        } else {
            tracing::debug!(target: "step", job = %self, "  | {}", masked);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::github_context::tests::FakeGit;
    use crate::model::Workflow;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    // -----------------------------------------------------------------------
    // Fakes
    // -----------------------------------------------------------------------

    /// Shared log of container operations.
    #[derive(Default)]
    pub(crate) struct OpLog {
        pub ops: Mutex<Vec<String>>,
        pub envs: Mutex<Vec<HashMap<String, String>>>,
        pub inputs: Mutex<Vec<NewContainerInput>>,
    }

    impl OpLog {
        pub(crate) fn ops(&self) -> Vec<String> {
            self.ops.lock().clone()
        }

        fn record(self: &Arc<Self>, op: String) -> Executor {
            let log = Arc::clone(self);
            Executor::from_fn(move |_| {
                let log = Arc::clone(&log);
                let op = op.clone();
                async move {
                    log.ops.lock().push(op);
                    Ok(())
                }
            })
        }
    }

    /// Records operations. `exec` echoes every script line starting with
    /// `::` to stdout, fails on scripts containing `exit 1` and blocks
    /// scripts containing `sleep` until the job is cancelled.
    pub(crate) struct FakeContainer {
        input: NewContainerInput,
        log: Arc<OpLog>,
    }

    impl Container for FakeContainer {
        fn name(&self) -> &str {
            &self.input.name
        }

        fn pull(&self, force_pull: bool) -> Executor {
            self.log.record(format!("pull {} force={}", self.input.name, force_pull))
        }

        fn remove(&self) -> Executor {
            self.log.record(format!("remove {}", self.input.name))
        }

        fn create(&self) -> Executor {
            self.log.record(format!("create {}", self.input.name))
        }

        fn start(&self, _attach: bool) -> Executor {
            self.log.record(format!("start {}", self.input.name))
        }

        fn exec(&self, command: Vec<String>, env: HashMap<String, String>) -> Executor {
            let log = Arc::clone(&self.log);
            let name = self.input.name.clone();
            let stdout = self.input.stdout.clone();
            Executor::from_fn(move |ctx| {
                let log = Arc::clone(&log);
                let script = command.last().cloned().unwrap_or_default();
                let op = format!("exec {} {}", name, script);
                let env = env.clone();
                let stdout = stdout.clone();
                async move {
                    log.ops.lock().push(op);
                    log.envs.lock().push(env);
                    if let Some(stdout) = stdout {
                        for line in script.lines().filter(|l| l.starts_with("::")) {
                            stdout.write_line(line);
                        }
                    }
                    if script.contains("exit 1") {
                        anyhow::bail!("Exit with FAILURE: 1");
                    }
                    if script.contains("sleep") {
                        ctx.cancel_token().cancelled().await;
                        return Err(act_sdk::ProcessCancelledError {
                            file_name: "docker".to_string(),
                        }
                        .into());
                    }
                    Ok(())
                }
            })
        }

        fn copy(&self, dest_path: &str, files: Vec<FileEntry>) -> Executor {
            let names: Vec<String> = files.into_iter().map(|f| f.name).collect();
            self.log
                .record(format!("copy {} {} {}", self.input.name, dest_path, names.join(",")))
        }

        fn copy_dir(&self, dest_path: &str, src_path: &str, _use_cache: bool) -> Executor {
            self.log
                .record(format!("copy_dir {} {} {}", self.input.name, dest_path, src_path))
        }

        fn change_remote_to_https(&self, repo_path: &str) -> Executor {
            self.log.record(format!("https {} {}", self.input.name, repo_path))
        }
    }

    pub(crate) struct FakeFactory {
        pub log: Arc<OpLog>,
    }

    impl ContainerFactory for FakeFactory {
        fn new_container(&self, input: NewContainerInput) -> Arc<dyn Container> {
            self.log.inputs.lock().push(input.clone());
            Arc::new(FakeContainer {
                input,
                log: Arc::clone(&self.log),
            })
        }

        fn remove_volume(&self, name: &str, force: bool) -> Executor {
            self.log.record(format!("volume_rm {} force={}", name, force))
        }
    }

    pub(crate) fn config() -> Config {
        Config {
            actor: "octocat".to_string(),
            workdir: PathBuf::from("/src/repo"),
            event_name: "push".to_string(),
            platforms: HashMap::from([(
                "ubuntu-latest".to_string(),
                "node:16-buster-slim".to_string(),
            )]),
            ..Default::default()
        }
    }

    pub(crate) fn run_context(yaml: &str, job: &str, config: Config) -> (Arc<RunContext>, Arc<OpLog>) {
        let workflow = Arc::new(Workflow::from_yaml(yaml).unwrap());
        let run = Run::new(workflow, job).unwrap();
        let log = Arc::new(OpLog::default());
        let collaborators = Collaborators {
            containers: Arc::new(FakeFactory { log: Arc::clone(&log) }),
            evaluators: Arc::new(DefaultEvaluatorFactory),
            git: Arc::new(FakeGit::new("nektos/act", "abc1234def", "refs/heads/main")),
            actions: Arc::new(DefaultActionRunner),
        };
        let rc = RunContext::new(Arc::new(config), run, "{}".to_string(), HashMap::new(), collaborators);
        (rc, log)
    }

    fn ctx() -> PipelineContext {
        PipelineContext::new(CancellationToken::new())
    }

    const BASIC: &str = r#"
name: CI
env:
  LEVEL: workflow
jobs:
  build:
    runs-on: ubuntu-latest
    env:
      JOB_ONLY: "yes"
    steps:
      - uses: actions/checkout@v2
      - run: echo hello
"#;

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[test]
    fn display_and_container_names() {
        let (rc, _) = run_context(BASIC, "build", config());
        assert_eq!(rc.to_string(), "CI/build");
        assert_eq!(rc.job_container_name(), "act-CI-build");
        assert_eq!(rc.dind_container_name(), "act-dind-CI-build");
    }

    #[test]
    fn env_overlay_precedence() {
        let mut config = config();
        config.env.insert("LEVEL".to_string(), "config".to_string());
        config.env.insert("CONFIG_ONLY".to_string(), "1".to_string());
        let (rc, _) = run_context(BASIC, "build", config);

        let env = rc.get_env();
        assert_eq!(env["LEVEL"], "workflow");
        assert_eq!(env["CONFIG_ONLY"], "1");
        assert_eq!(env["JOB_ONLY"], "yes");
        assert!(std::ptr::eq(rc.get_env(), env));
    }

    #[tokio::test]
    async fn full_pipeline_runs_in_order() {
        let (rc, log) = run_context(BASIC, "build", config());
        assert_eq!(rc.run(ctx()).await, JobResult::Succeeded);

        assert_eq!(
            log.ops(),
            vec![
                "pull act-dind-CI-build force=false",
                "remove act-dind-CI-build",
                "create act-dind-CI-build",
                "start act-dind-CI-build",
                "pull act-CI-build force=false",
                "remove act-CI-build",
                "create act-CI-build",
                "start act-CI-build",
                "copy_dir act-CI-build /github/workspace /src/repo/.",
                "https act-CI-build /github/workspace",
                "copy act-CI-build /github/ workflow/event.json,home/.act",
                "exec act-CI-build echo hello",
                "remove act-CI-build",
                "remove act-dind-CI-build",
                "volume_rm act-CI-build force=false",
            ]
        );
        assert_eq!(rc.enabled(), Some(true));
        assert_eq!(rc.steps().len(), 2);
        assert!(rc.steps().has_step("0"));
        assert!(rc.steps().has_step("1"));
    }

    #[tokio::test]
    async fn container_inputs() {
        let (rc, log) = run_context(BASIC, "build", config());
        rc.run(ctx()).await;

        let inputs = log.inputs.lock().clone();
        let (dind, job) = (&inputs[0], &inputs[1]);

        assert_eq!(dind.image, "docker:dind");
        assert!(dind.privileged);
        assert_eq!(dind.env, vec!["DOCKER_TLS_CERTDIR=/certs"]);
        assert_eq!(dind.mounts["act-dind-imagecache"], "/var/lib/docker/overlay2");
        assert_eq!(dind.mounts["act-CI-build"], "/github");

        assert_eq!(job.image, "node:16-buster-slim");
        assert!(!job.privileged);
        assert_eq!(job.entrypoint, vec!["/usr/bin/tail", "-f", "/dev/null"]);
        assert_eq!(job.working_dir, "/github/workspace");
        assert_eq!(job.network_mode, "default");
        assert_eq!(job.mounts["act-dind-CI-build-cert"], "/certs/client");
        assert_eq!(job.mounts["act-toolcache"], "/toolcache");
        assert_eq!(job.mounts["act-actions"], "/actions");
        assert_eq!(job.mounts["act-runner-home"], "/home/runner");
        assert!(!job.mounts.contains_key("act-dind-imagecache"));
        assert_eq!(
            job.links,
            vec!["act-dind-CI-build:docker", "act-dind-CI-build:deps.localdev.boreas.cloud"]
        );
        assert_eq!(job.env_value("DOCKER_HOST"), Some("tcp://docker:2376"));
        assert_eq!(job.env_value("RUNNER_OS"), Some("Linux"));
        assert!(job.binds.is_empty());
    }

    #[tokio::test]
    async fn bind_workdir_skips_copy() {
        let mut config = config();
        config.bind_workdir = true;
        let (rc, log) = run_context(BASIC, "build", config);
        assert_eq!(rc.run(ctx()).await, JobResult::Succeeded);

        assert!(!log.ops().iter().any(|op| op.starts_with("copy_dir") || op.starts_with("https")));
        let job = log.inputs.lock()[1].clone();
        assert!(job.binds[0].starts_with("/src/repo:/github/workspace"));
    }

    #[tokio::test]
    async fn checkout_path_and_no_checkout() {
        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v3
        with:
          path: sub
"#;
        let (rc, log) = run_context(yaml, "build", config());
        assert_eq!(rc.local_checkout_path(), ("sub".to_string(), true));
        rc.run(ctx()).await;
        assert!(log
            .ops()
            .contains(&"copy_dir act-CI-build /github/workspace/sub /src/repo/.".to_string()));

        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v3
        with:
          repository: other/repo
"#;
        let (rc, log) = run_context(yaml, "build", config());
        assert_eq!(rc.local_checkout_path(), (String::new(), false));
        rc.run(ctx()).await;
        assert!(!log.ops().iter().any(|op| op.starts_with("copy_dir")));
    }

    #[tokio::test]
    async fn reuse_keeps_containers() {
        let mut config = config();
        config.reuse_containers = true;
        config.force_pull = true;
        let (rc, log) = run_context(BASIC, "build", config);
        assert_eq!(rc.run(ctx()).await, JobResult::Succeeded);

        let ops = log.ops();
        assert!(!ops.iter().any(|op| op.starts_with("remove") || op.starts_with("volume_rm")));
        assert!(ops.contains(&"pull act-CI-build force=true".to_string()));
        assert!(ops.contains(&"pull act-dind-CI-build force=false".to_string()));
    }

    #[tokio::test]
    async fn unmapped_platform_is_skipped() {
        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: [self-hosted, macos-latest]
    steps:
      - run: echo hi
"#;
        let (rc, log) = run_context(yaml, "build", config());
        assert_eq!(rc.platform_image(), None);
        assert_eq!(rc.run(ctx()).await, JobResult::Skipped);
        assert!(log.ops().is_empty());
        assert!(log.inputs.lock().is_empty());
    }

    #[tokio::test]
    async fn explicit_container_image_wins() {
        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: macos-latest
    container: alpine:3.18
    steps:
      - run: echo hi
"#;
        let (rc, _) = run_context(yaml, "build", config());
        assert_eq!(rc.platform_image().as_deref(), Some("alpine:3.18"));
    }

    #[tokio::test]
    async fn runs_on_label_is_interpolated_and_lowercased() {
        let yaml = r#"
name: CI
env:
  OS: Ubuntu-Latest
jobs:
  build:
    runs-on: ${{ env.OS }}
    steps:
      - run: echo hi
"#;
        let (rc, _) = run_context(yaml, "build", config());
        assert_eq!(rc.platform_image().as_deref(), Some("node:16-buster-slim"));
    }

    #[tokio::test]
    async fn falsy_job_condition_is_skipped() {
        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: ubuntu-latest
    if: github.event_name == 'pull_request'
    steps:
      - run: echo hi
"#;
        let (rc, log) = run_context(yaml, "build", config());
        assert_eq!(rc.run(ctx()).await, JobResult::Skipped);
        assert!(log.ops().is_empty());
    }

    #[tokio::test]
    async fn failed_step_stops_the_job() {
        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: echo one
      - id: broken
        run: exit 1
      - run: echo never
"#;
        let (rc, log) = run_context(yaml, "build", config());
        assert_eq!(rc.run(ctx()).await, JobResult::Failed);

        let ops = log.ops();
        assert!(ops.contains(&"exec act-CI-build echo one".to_string()));
        assert!(ops.contains(&"exec act-CI-build exit 1".to_string()));
        assert!(!ops.iter().any(|op| op.contains("echo never")));
        assert!(!ops.iter().any(|op| op.starts_with("volume_rm")));

        let steps = rc.steps();
        assert!(steps.get("0").unwrap().success);
        assert!(!steps.get("broken").unwrap().success);
        assert!(!steps.has_step("2"));
        assert_eq!(steps.job_context().status, "failure");
    }

    #[tokio::test]
    async fn workflow_commands_update_state() {
        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - id: meta
        run: |
          ::set-output name=version::1.2.3
          ::set-env name=STAGE::beta
          ::add-path::/opt/tool/bin
      - run: echo ${{ steps.meta.outputs.version }} $STAGE
"#;
        let (rc, log) = run_context(yaml, "build", config());
        assert_eq!(rc.run(ctx()).await, JobResult::Succeeded);

        assert_eq!(rc.steps().get("meta").unwrap().outputs["version"], "1.2.3");
        assert!(log.ops().contains(&"exec act-CI-build echo 1.2.3 $STAGE".to_string()));

        let envs = log.envs.lock().clone();
        assert_eq!(envs[1]["STAGE"], "beta");
        assert!(envs[1]["PATH"].starts_with("/opt/tool/bin:"));
        assert!(!envs[0].contains_key("STAGE"));
    }

    #[tokio::test]
    async fn step_condition_skips() {
        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: echo skipped
        if: github.event_name == 'pull_request'
      - run: echo always
        if: always()
"#;
        let (rc, log) = run_context(yaml, "build", config());
        assert_eq!(rc.run(ctx()).await, JobResult::Succeeded);

        let ops = log.ops();
        assert!(!ops.iter().any(|op| op.contains("echo skipped")));
        assert!(ops.contains(&"exec act-CI-build echo always".to_string()));
        assert!(rc.steps().get("0").unwrap().success);
    }

    #[tokio::test]
    async fn unsupported_action_fails() {
        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - uses: docker://alpine
"#;
        let (rc, _) = run_context(yaml, "build", config());
        assert_eq!(rc.run(ctx()).await, JobResult::Failed);
        assert!(!rc.steps().get("0").unwrap().success);
    }

    #[tokio::test]
    async fn exec_before_start_fails() {
        let (rc, _) = run_context(BASIC, "build", config());
        let err = rc
            .exec_job_container(vec!["true".to_string()], HashMap::new())
            .execute(ctx())
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<RunnerError>(),
            Some(&RunnerError::ContainerNotStarted("job"))
        );
    }

    #[tokio::test]
    async fn cancelled_job_fails_without_running() {
        let (rc, log) = run_context(BASIC, "build", config());
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(rc.run(PipelineContext::new(token)).await, JobResult::Failed);
        assert!(log.ops().is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_running_step_stops_the_job() {
        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: echo one
      - id: waiting
        run: sleep 60
      - run: echo never
"#;
        let (rc, log) = run_context(yaml, "build", config());
        let token = CancellationToken::new();
        let job = {
            let rc = Arc::clone(&rc);
            let token = token.clone();
            tokio::spawn(async move { rc.run(PipelineContext::new(token)).await })
        };

        let waiting = "exec act-CI-build sleep 60".to_string();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !log.ops().contains(&waiting) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        token.cancel();

        assert_eq!(job.await.unwrap(), JobResult::Failed);
        let ops = log.ops();
        assert_eq!(ops.last(), Some(&waiting));
        assert!(!ops.iter().any(|op| op.contains("echo never")));
        assert!(!ops.iter().any(|op| op.starts_with("volume_rm")));

        let steps = rc.steps();
        assert!(steps.get("0").unwrap().success);
        assert!(!steps.get("waiting").unwrap().success);
        assert!(!steps.has_step("2"));
    }

    #[test]
    fn output_lines_are_masked_commands_are_applied() {
        let mut config = config();
        config.secrets.insert("API_KEY".to_string(), "topsecret".to_string());
        let (rc, _) = run_context(BASIC, "build", config);
        rc.begin_step("0");
        rc.handle_output_line("::add-mask::another");
        rc.handle_output_line("::set-output name=out::v");
        assert_eq!(rc.masker().mask_secrets("topsecret another"), "*** ***");
        assert_eq!(rc.steps().get("0").unwrap().outputs["out"], "v");
    }

    #[tokio::test]
    async fn git_is_consulted_once_per_job() {
        let workflow = Arc::new(Workflow::from_yaml(BASIC).unwrap());
        let run = Run::new(workflow, "build").unwrap();
        let git = Arc::new(FakeGit::new("nektos/act", "abc1234def", "refs/heads/main"));
        let collaborators = Collaborators {
            containers: Arc::new(FakeFactory {
                log: Arc::new(OpLog::default()),
            }),
            evaluators: Arc::new(DefaultEvaluatorFactory),
            git: git.clone(),
            actions: Arc::new(DefaultActionRunner),
        };
        let rc = RunContext::new(Arc::new(config()), run, "{}".to_string(), HashMap::new(), collaborators);

        assert_eq!(rc.run(ctx()).await, JobResult::Succeeded);
        assert_eq!(rc.github_context().repository, "nektos/act");
        assert_eq!(git.lookups(), 3);
    }

    #[test]
    fn github_context_from_run() {
        let mut config = config();
        config.github_token = Some("fallback".to_string());
        let (rc, _) = run_context(BASIC, "build", config);
        rc.begin_step("1");

        let ghc = rc.github_context();
        assert_eq!(ghc.workflow, "CI");
        assert_eq!(ghc.actor, "octocat");
        assert_eq!(ghc.repository, "nektos/act");
        assert_eq!(ghc.git_ref, "refs/heads/main");
        assert_eq!(ghc.action, "1");
        assert_eq!(ghc.token, "fallback");

        let mut env = HashMap::new();
        rc.with_github_env(&mut env);
        assert_eq!(env["GITHUB_ACTION"], "1");
        assert_eq!(env["HOME"], "/github/home");
    }
}
