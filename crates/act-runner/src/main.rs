// Entry point of the `act` binary: run one job of a workflow file locally.
//
//   act --workflow .github/workflows/ci.yml --job build -P ubuntu-latest=node:16-buster-slim
//
// The exit code encodes the `JobResult`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use act_common::{logging, Config, JobResult, LogSettings};
use act_runner::model::{Run, Workflow};
use act_runner::pipeline::PipelineContext;
use act_runner::run_context::{Collaborators, RunContext};

#[derive(Parser, Debug)]
#[command(name = "act", about = "Run CI workflow jobs locally in containers")]
struct Args {
    /// Workflow file to read.
    #[arg(short = 'W', long, default_value = ".github/workflows/main.yml")]
    workflow: PathBuf,

    /// Job to run. May be omitted when the workflow has a single job.
    #[arg(short, long)]
    job: Option<String>,

    /// Config file (JSON or YAML) with run-wide settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Repository working directory.
    #[arg(short = 'C', long)]
    directory: Option<PathBuf>,

    /// Event name that triggered the run.
    #[arg(long)]
    event: Option<String>,

    /// Path of the event payload JSON.
    #[arg(short, long)]
    event_path: Option<PathBuf>,

    /// User reported as `github.actor`.
    #[arg(short, long)]
    actor: Option<String>,

    /// Platform mapping `label=image`.
    #[arg(short = 'P', long = "platform", value_parser = parse_key_value)]
    platforms: Vec<(String, String)>,

    /// Secret `NAME=value`.
    #[arg(short, long = "secret", value_parser = parse_key_value)]
    secrets: Vec<(String, String)>,

    /// Environment variable `NAME=value`.
    #[arg(long = "env", value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Bind-mount the working directory instead of copying it.
    #[arg(short, long)]
    bind: bool,

    /// Reuse containers between runs.
    #[arg(short, long)]
    reuse: bool,

    /// Always pull images.
    #[arg(short, long)]
    pull: bool,

    /// Show container output at info level.
    #[arg(long)]
    log_output: bool,

    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON.
    #[arg(long)]
    json: bool,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=value, got '{raw}'")),
    }
}

fn main() {
    let args = Args::parse();

    if let Err(e) = logging::init(LogSettings {
        verbose: args.verbose,
        json: args.json,
    }) {
        eprintln!("{e:#}");
    }

    if which::which("docker").is_err() {
        tracing::error!("docker was not found in PATH");
        std::process::exit(JobResult::Failed.return_code());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = runtime.block_on(async move {
        match run(args).await {
            Ok(result) => {
                tracing::info!("Job completed with result {} (return code {})", result, result.return_code());
                result.return_code()
            }
            Err(e) => {
                tracing::error!("{:#}", e);
                JobResult::Failed.return_code()
            }
        }
    });

    std::process::exit(exit_code);
}

async fn run(args: Args) -> Result<JobResult> {
    let config = build_config(&args)?;

    let event_json = match &config.event_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event payload {}", path.display()))?,
        None => "{}".to_string(),
    };

    let workflow = Arc::new(Workflow::load(&args.workflow)?);
    let job_id = match args.job {
        Some(job) => job,
        None => single_job(&workflow)?,
    };
    let run = Run::new(workflow, &job_id)?;

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::warn!("Received Ctrl-C, cancelling the job");
        handler_token.cancel();
    }) {
        tracing::warn!("Unable to install Ctrl-C handler: {}", e);
    }

    let rc = RunContext::new(
        Arc::new(config),
        run,
        event_json,
        HashMap::new(),
        Collaborators::default(),
    );
    tracing::debug!("Action cache directory: {}", rc.action_cache_dir().display());
    Ok(rc.run(PipelineContext::new(cancel)).await)
}

/// Config file (if any), overlaid by flags and the ambient environment.
fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(directory) = &args.directory {
        config.workdir = directory.clone();
    }
    if config.workdir.as_os_str().is_empty() {
        config.workdir = PathBuf::from(".");
    }
    config.workdir = std::fs::canonicalize(&config.workdir)
        .with_context(|| format!("Invalid working directory {}", config.workdir.display()))?;

    if let Some(event) = &args.event {
        config.event_name = event.clone();
    }
    if config.event_name.is_empty() {
        config.event_name = act_common::constants::events::PUSH.to_string();
    }
    if args.event_path.is_some() {
        config.event_path = args.event_path.clone();
    }
    if let Some(actor) = &args.actor {
        config.actor = actor.clone();
    }

    config.platforms.extend(args.platforms.iter().cloned());
    config.secrets.extend(args.secrets.iter().cloned());
    config.env.extend(args.env.iter().cloned());

    config.bind_workdir |= args.bind;
    config.reuse_containers |= args.reuse;
    config.force_pull |= args.pull;
    config.log_output |= args.log_output;

    Ok(config.with_process_env())
}

fn single_job(workflow: &Workflow) -> Result<String> {
    let mut jobs = workflow.jobs.keys();
    match (jobs.next(), jobs.next()) {
        (Some(job), None) => Ok(job.clone()),
        (None, _) => bail!("Workflow '{}' has no jobs", workflow.name),
        _ => bail!(
            "Workflow '{}' has several jobs, pick one with --job: {}",
            workflow.name,
            workflow.jobs.keys().cloned().collect::<Vec<_>>().join(", ")
        ),
    }
}
