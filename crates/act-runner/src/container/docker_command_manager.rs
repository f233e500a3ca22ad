// DockerCommandManager: Docker CLI invocations through the process invoker.
// `DockerContainer` exposes them as pipeline executors for one container and
// `DockerCli` is the default `ContainerFactory`.

use anyhow::{Context, Result};
use act_sdk::{LineWriter, ProcessInvoker, TraceWriter, TracingTraceWriter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::container::container_info::{FileEntry, NewContainerInput};
use crate::container::{Container, ContainerFactory};
use crate::pipeline::Executor;

/// Output of a finished docker command.
#[derive(Debug, Clone, Default)]
pub struct DockerOutput {
    pub exit_code: i32,
    pub stdout: Vec<String>,
}

/// Manages Docker CLI operations.
#[derive(Debug, Clone)]
pub struct DockerCommandManager {
    docker_path: String,
}

impl DockerCommandManager {
    pub fn new() -> Self {
        Self::with_path("docker")
    }

    /// Use a custom Docker binary.
    pub fn with_path(docker_path: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
        }
    }

    pub fn docker_path(&self) -> &str {
        &self.docker_path
    }

    // -----------------------------------------------------------------------
    // Argument construction
    // -----------------------------------------------------------------------

    /// Arguments for `docker create`.
    pub fn create_args(input: &NewContainerInput) -> Vec<String> {
        let mut args = vec!["create".to_string()];

        if !input.name.is_empty() {
            args.push("--name".to_string());
            args.push(input.name.clone());
        }

        if !input.network_mode.is_empty() {
            args.push("--network".to_string());
            args.push(input.network_mode.clone());
        }

        if !input.working_dir.is_empty() {
            args.push("-w".to_string());
            args.push(input.working_dir.clone());
        }

        if input.privileged {
            args.push("--privileged".to_string());
        }

        if let Some(entrypoint) = input.entrypoint.first() {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }

        args.extend(input.build_env_args());
        args.extend(input.build_volume_args());
        args.extend(input.build_link_args());

        args.push(input.image.clone());

        // docker only takes the entrypoint binary; its arguments go in front of cmd
        args.extend(input.entrypoint.iter().skip(1).cloned());
        args.extend(input.cmd.iter().cloned());
        args
    }

    /// Arguments for `docker exec`. Only env keys are listed, sorted for
    /// stable output; the values are passed through the docker client's
    /// environment.
    pub fn exec_args(
        container: &str,
        command: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&str>,
    ) -> Vec<String> {
        let mut args = vec!["exec".to_string()];

        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            args.push("-e".to_string());
            args.push(key.clone());
        }

        if let Some(wd) = working_dir.filter(|wd| !wd.is_empty()) {
            args.push("-w".to_string());
            args.push(wd.to_string());
        }

        args.push(container.to_string());
        args.extend(command.iter().cloned());
        args
    }

    // -----------------------------------------------------------------------
    // Container lifecycle
    // -----------------------------------------------------------------------

    pub async fn image_exists(&self, image: &str, cancel: CancellationToken) -> Result<bool> {
        let output = self
            .try_docker_command(&args(&["image", "inspect", "--format", "{{.Id}}", image]), None, cancel)
            .await?;
        Ok(output.exit_code == 0)
    }

    pub async fn pull_image(&self, image: &str, cancel: CancellationToken) -> Result<()> {
        self.run_docker_command(&args(&["pull", image]), cancel).await?;
        Ok(())
    }

    /// Id of the container with exactly this name, if one exists.
    pub async fn find_container(&self, name: &str, cancel: CancellationToken) -> Result<Option<String>> {
        let filter = format!("name=^/{name}$");
        let output = self
            .run_docker_command(&args(&["ps", "-a", "-q", "--filter", &filter]), cancel)
            .await?;
        Ok(output.stdout.into_iter().map(|l| l.trim().to_string()).find(|l| !l.is_empty()))
    }

    /// Create a container and return its id.
    pub async fn create_container(&self, input: &NewContainerInput, cancel: CancellationToken) -> Result<String> {
        let output = self
            .run_docker_command_with_env(&Self::create_args(input), Some(&input.env_vars()), cancel)
            .await?;
        let id = output
            .stdout
            .last()
            .map(|l| l.trim().to_string())
            .unwrap_or_default();
        if id.is_empty() {
            anyhow::bail!("docker create returned no container id for '{}'", input.name);
        }
        Ok(id)
    }

    pub async fn start_container(&self, container_id: &str, cancel: CancellationToken) -> Result<()> {
        self.run_docker_command(&args(&["start", container_id]), cancel).await?;
        Ok(())
    }

    /// Start and stay attached until the container exits; output goes to the sinks.
    pub async fn start_attached(
        &self,
        container_id: &str,
        stdout: Option<Arc<LineWriter>>,
        stderr: Option<Arc<LineWriter>>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        self.stream_docker_command(&args(&["start", "--attach", container_id]), None, stdout, stderr, cancel)
            .await
    }

    pub async fn remove_container(&self, container_id: &str, cancel: CancellationToken) -> Result<()> {
        self.run_docker_command(&args(&["rm", "--force", "--volumes", container_id]), cancel)
            .await?;
        Ok(())
    }

    /// Run a command inside a running container and return its exit code.
    #[allow(clippy::too_many_arguments)]
    pub async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&str>,
        stdout: Option<Arc<LineWriter>>,
        stderr: Option<Arc<LineWriter>>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let arguments = Self::exec_args(container_id, command, env, working_dir);
        self.stream_docker_command(&arguments, Some(env), stdout, stderr, cancel)
            .await
    }

    /// Run a command inside a container and collect its stdout.
    pub async fn exec_capture(
        &self,
        container_id: &str,
        command: &[String],
        cancel: CancellationToken,
    ) -> Result<Vec<String>> {
        let arguments = Self::exec_args(container_id, command, &HashMap::new(), None);
        Ok(self.run_docker_command(&arguments, cancel).await?.stdout)
    }

    /// `docker cp <src> <container>:<dest>`.
    pub async fn copy_to_container(
        &self,
        src: &str,
        container_id: &str,
        dest: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let target = format!("{container_id}:{dest}");
        self.run_docker_command(&args(&["cp", src, &target]), cancel).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Volumes
    // -----------------------------------------------------------------------

    pub async fn volume_exists(&self, name: &str, cancel: CancellationToken) -> Result<bool> {
        let filter = format!("name=^{name}$");
        let output = self
            .run_docker_command(&args(&["volume", "ls", "-q", "--filter", &filter]), cancel)
            .await?;
        Ok(output.stdout.iter().any(|l| l.trim() == name))
    }

    pub async fn remove_volume(&self, name: &str, force: bool, cancel: CancellationToken) -> Result<()> {
        let mut arguments = args(&["volume", "rm"]);
        if force {
            arguments.push("--force".to_string());
        }
        arguments.push(name.to_string());
        self.run_docker_command(&arguments, cancel).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn invoker() -> ProcessInvoker {
        let trace: Arc<dyn TraceWriter> = Arc::new(TracingTraceWriter::new("docker"));
        ProcessInvoker::new(trace)
    }

    /// `docker <subcommand>`. Full argument lists carry scripts and env keys
    /// and stay out of log and error text.
    fn describe(&self, arguments: &[String]) -> String {
        match arguments.first() {
            Some(subcommand) => format!("{} {}", self.docker_path, subcommand),
            None => self.docker_path.clone(),
        }
    }

    /// Run a docker command, failing on a non-zero exit code.
    async fn run_docker_command(&self, arguments: &[String], cancel: CancellationToken) -> Result<DockerOutput> {
        self.run_docker_command_with_env(arguments, None, cancel).await
    }

    async fn run_docker_command_with_env(
        &self,
        arguments: &[String],
        environment: Option<&HashMap<String, String>>,
        cancel: CancellationToken,
    ) -> Result<DockerOutput> {
        let output = self.try_docker_command(arguments, environment, cancel).await?;
        if output.exit_code != 0 {
            anyhow::bail!(
                "Docker command exited with code {}: {}",
                output.exit_code,
                self.describe(arguments)
            );
        }
        Ok(output)
    }

    /// Run a docker command and collect stdout, whatever the exit code.
    async fn try_docker_command(
        &self,
        arguments: &[String],
        environment: Option<&HashMap<String, String>>,
        cancel: CancellationToken,
    ) -> Result<DockerOutput> {
        let mut invoker = Self::invoker();
        let mut stdout_rx = invoker
            .take_stdout_receiver()
            .context("stdout receiver already taken")?;
        let mut stderr_rx = invoker
            .take_stderr_receiver()
            .context("stderr receiver already taken")?;

        let collector = tokio::spawn(async move {
            let mut lines = Vec::new();
            while let Some(event) = stdout_rx.recv().await {
                lines.push(event.data);
            }
            lines
        });
        let stderr_logger = tokio::spawn(async move {
            while let Some(event) = stderr_rx.recv().await {
                tracing::debug!(target: "docker", "{}", event.data);
            }
        });

        let result = invoker
            .execute("", &self.docker_path, arguments, environment, false, false, cancel)
            .await;
        drop(invoker);

        let stdout = collector.await.unwrap_or_default();
        let _ = stderr_logger.await;

        let exit_code = result.with_context(|| format!("Docker command failed: {}", self.describe(arguments)))?;

        Ok(DockerOutput { exit_code, stdout })
    }

    /// Run a docker command, forwarding every output line to the sinks.
    async fn stream_docker_command(
        &self,
        arguments: &[String],
        environment: Option<&HashMap<String, String>>,
        stdout: Option<Arc<LineWriter>>,
        stderr: Option<Arc<LineWriter>>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let mut invoker = Self::invoker();
        let forwarders = [
            (invoker.take_stdout_receiver(), stdout),
            (invoker.take_stderr_receiver(), stderr),
        ]
        .into_iter()
        .filter_map(|(rx, sink)| rx.map(|rx| (rx, sink)))
        .map(|(mut rx, sink)| {
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Some(sink) = &sink {
                        sink.write_line(&event.data);
                    }
                }
            })
        })
        .collect::<Vec<_>>();

        let result = invoker
            .execute("", &self.docker_path, arguments, environment, false, false, cancel)
            .await;
        drop(invoker);

        for forwarder in forwarders {
            let _ = forwarder.await;
        }

        result.with_context(|| format!("Docker command failed: {}", self.describe(arguments)))
    }
}

impl Default for DockerCommandManager {
    fn default() -> Self {
        Self::new()
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// HTTPS form of an SSH git remote, or `None` when no rewrite is needed.
pub fn to_https_remote(url: &str) -> Option<String> {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("ssh://") {
        let rest = rest.split_once('@').map(|(_, r)| r).unwrap_or(rest);
        let (host, path) = rest.split_once('/')?;
        let host = host.split(':').next().unwrap_or(host);
        return Some(format!("https://{host}/{path}"));
    }
    if url.contains("://") {
        return None;
    }
    let (user_host, path) = url.split_once(':')?;
    let host = user_host.rsplit('@').next().unwrap_or(user_host);
    if host.is_empty() || path.is_empty() {
        return None;
    }
    Some(format!("https://{host}/{path}"))
}

// ---------------------------------------------------------------------------
// DockerContainer
// ---------------------------------------------------------------------------

struct DockerContainerInner {
    docker: Arc<DockerCommandManager>,
    input: NewContainerInput,
    id: Mutex<Option<String>>,
}

impl DockerContainerInner {
    /// Cached container id, else the id of the container with our name.
    async fn find(&self, cancel: CancellationToken) -> Result<Option<String>> {
        let cached = self.id.lock().clone();
        if cached.is_some() {
            return Ok(cached);
        }
        let found = self.docker.find_container(&self.input.name, cancel).await?;
        if let Some(id) = &found {
            *self.id.lock() = Some(id.clone());
        }
        Ok(found)
    }

    async fn require_id(&self, cancel: CancellationToken) -> Result<String> {
        self.find(cancel)
            .await?
            .with_context(|| format!("Container '{}' does not exist", self.input.name))
    }
}

/// One container driven through the Docker CLI.
#[derive(Clone)]
pub struct DockerContainer {
    inner: Arc<DockerContainerInner>,
}

impl DockerContainer {
    pub fn new(docker: Arc<DockerCommandManager>, input: NewContainerInput) -> Self {
        Self {
            inner: Arc::new(DockerContainerInner {
                docker,
                input,
                id: Mutex::new(None),
            }),
        }
    }

    pub fn input(&self) -> &NewContainerInput {
        &self.inner.input
    }
}

impl Container for DockerContainer {
    fn name(&self) -> &str {
        &self.inner.input.name
    }

    fn pull(&self, force_pull: bool) -> Executor {
        let inner = Arc::clone(&self.inner);
        Executor::from_fn(move |ctx| {
            let inner = Arc::clone(&inner);
            async move {
                let image = &inner.input.image;
                if !force_pull && inner.docker.image_exists(image, ctx.cancel_token()).await? {
                    tracing::debug!(target: "docker", job = %ctx.job(), "Image {} present locally", image);
                    return Ok(());
                }
                tracing::info!(target: "docker", job = %ctx.job(), "docker pull {}", image);
                inner
                    .docker
                    .pull_image(image, ctx.cancel_token())
                    .await
                    .with_context(|| format!("Failed to pull image {image}"))
            }
        })
    }

    fn remove(&self) -> Executor {
        let inner = Arc::clone(&self.inner);
        Executor::from_fn(move |ctx| {
            let inner = Arc::clone(&inner);
            async move {
                let Some(id) = inner.find(ctx.cancel_token()).await? else {
                    return Ok(());
                };
                *inner.id.lock() = None;

                if let Err(e) = inner.docker.remove_container(&id, ctx.cancel_token()).await {
                    // Only a container that is gone by now counts as removed.
                    let still_there = inner
                        .docker
                        .find_container(&inner.input.name, ctx.cancel_token())
                        .await?
                        .is_some();
                    if still_there {
                        return Err(e.context(format!("Failed to remove container {}", inner.input.name)));
                    }
                    tracing::debug!(target: "docker", job = %ctx.job(), "Container {} already gone: {:#}", inner.input.name, e);
                    return Ok(());
                }
                tracing::debug!(target: "docker", job = %ctx.job(), "Removed container {}", inner.input.name);
                Ok(())
            }
        })
    }

    fn create(&self) -> Executor {
        let inner = Arc::clone(&self.inner);
        Executor::from_fn(move |ctx| {
            let inner = Arc::clone(&inner);
            async move {
                tracing::info!(
                    target: "docker",
                    job = %ctx.job(),
                    "docker create image={} entrypoint={:?} cmd={:?}",
                    inner.input.image,
                    inner.input.entrypoint,
                    inner.input.cmd
                );
                if inner.find(ctx.cancel_token()).await?.is_some() {
                    tracing::debug!(target: "docker", job = %ctx.job(), "Reusing container {}", inner.input.name);
                    return Ok(());
                }
                let id = inner
                    .docker
                    .create_container(&inner.input, ctx.cancel_token())
                    .await
                    .with_context(|| format!("Failed to create container {}", inner.input.name))?;
                tracing::debug!(target: "docker", job = %ctx.job(), "Created container name={} id={}", inner.input.name, id);
                *inner.id.lock() = Some(id);
                Ok(())
            }
        })
    }

    fn start(&self, attach: bool) -> Executor {
        let inner = Arc::clone(&self.inner);
        Executor::from_fn(move |ctx| {
            let inner = Arc::clone(&inner);
            async move {
                tracing::info!(target: "docker", job = %ctx.job(), "docker run image={}", inner.input.image);
                let id = inner.require_id(ctx.cancel_token()).await?;
                if !attach {
                    return inner.docker.start_container(&id, ctx.cancel_token()).await;
                }
                let exit_code = inner
                    .docker
                    .start_attached(&id, inner.input.stdout.clone(), inner.input.stderr.clone(), ctx.cancel_token())
                    .await?;
                if exit_code != 0 {
                    anyhow::bail!("Container {} exited with code {}", inner.input.name, exit_code);
                }
                Ok(())
            }
        })
    }

    fn exec(&self, command: Vec<String>, env: HashMap<String, String>) -> Executor {
        let inner = Arc::clone(&self.inner);
        let command = Arc::new(command);
        let env = Arc::new(env);
        Executor::from_fn(move |ctx| {
            let inner = Arc::clone(&inner);
            let command = Arc::clone(&command);
            let env = Arc::clone(&env);
            async move {
                tracing::debug!(target: "docker", job = %ctx.job(), "docker exec in {}", inner.input.name);
                let id = inner.require_id(ctx.cancel_token()).await?;
                let exit_code = inner
                    .docker
                    .exec(
                        &id,
                        &command,
                        &env,
                        None,
                        inner.input.stdout.clone(),
                        inner.input.stderr.clone(),
                        ctx.cancel_token(),
                    )
                    .await?;
                if exit_code != 0 {
                    anyhow::bail!("Exit with FAILURE: {}", exit_code);
                }
                Ok(())
            }
        })
    }

    fn copy(&self, dest_path: &str, files: Vec<FileEntry>) -> Executor {
        let inner = Arc::clone(&self.inner);
        let dest_path = dest_path.to_string();
        let files = Arc::new(files);
        Executor::from_fn(move |ctx| {
            let inner = Arc::clone(&inner);
            let dest_path = dest_path.clone();
            let files = Arc::clone(&files);
            async move {
                let id = inner.require_id(ctx.cancel_token()).await?;
                let staging = tempfile::tempdir().context("Failed to create staging directory")?;
                for file in files.iter() {
                    write_staged_file(staging.path(), file)?;
                }
                tracing::debug!(target: "docker", job = %ctx.job(), "Copying {} file(s) to {}", files.len(), dest_path);

                let src = format!("{}/.", staging.path().display());
                inner
                    .docker
                    .exec_capture(&id, &args(&["mkdir", "-p", &dest_path]), ctx.cancel_token())
                    .await?;
                inner
                    .docker
                    .copy_to_container(&src, &id, &dest_path, ctx.cancel_token())
                    .await
                    .with_context(|| format!("Failed to copy files to {dest_path}"))
            }
        })
    }

    fn copy_dir(&self, dest_path: &str, src_path: &str, _use_cache: bool) -> Executor {
        let inner = Arc::clone(&self.inner);
        let dest_path = dest_path.to_string();
        let src_path = src_path.to_string();
        Executor::from_fn(move |ctx| {
            let inner = Arc::clone(&inner);
            let dest_path = dest_path.clone();
            let src_path = src_path.clone();
            async move {
                tracing::info!(target: "docker", job = %ctx.job(), "docker cp src={} dst={}", src_path, dest_path);
                let id = inner.require_id(ctx.cancel_token()).await?;
                inner
                    .docker
                    .exec_capture(&id, &args(&["mkdir", "-p", &dest_path]), ctx.cancel_token())
                    .await?;
                inner
                    .docker
                    .copy_to_container(&src_path, &id, &dest_path, ctx.cancel_token())
                    .await
                    .with_context(|| format!("Failed to copy {src_path} to {dest_path}"))
            }
        })
    }

    fn change_remote_to_https(&self, repo_path: &str) -> Executor {
        let inner = Arc::clone(&self.inner);
        let repo_path = repo_path.to_string();
        Executor::from_fn(move |ctx| {
            let inner = Arc::clone(&inner);
            let repo_path = repo_path.clone();
            async move {
                let rewrite = async {
                    let id = inner.require_id(ctx.cancel_token()).await?;
                    let remote = inner
                        .docker
                        .exec_capture(
                            &id,
                            &args(&["git", "-C", &repo_path, "remote", "get-url", "origin"]),
                            ctx.cancel_token(),
                        )
                        .await?;
                    let Some(https) = remote.first().and_then(|url| to_https_remote(url)) else {
                        return anyhow::Ok(());
                    };
                    tracing::debug!(target: "docker", job = %ctx.job(), "Setting origin of {} to {}", repo_path, https);
                    inner
                        .docker
                        .exec_capture(
                            &id,
                            &args(&["git", "-C", &repo_path, "remote", "set-url", "origin", &https]),
                            ctx.cancel_token(),
                        )
                        .await?;
                    anyhow::Ok(())
                }
                .await;
                if let Err(e) = rewrite {
                    tracing::debug!(target: "docker", job = %ctx.job(), "Unable to rewrite git remote in {}: {:#}", repo_path, e);
                }
                Ok(())
            }
        })
    }
}

fn write_staged_file(root: &Path, file: &FileEntry) -> Result<()> {
    let path = root.join(&file.name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, &file.body).with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(file.mode))
            .with_context(|| format!("Failed to set mode on {}", path.display()))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// DockerCli
// ---------------------------------------------------------------------------

/// Default container factory backed by the Docker CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerCli {
    docker: Arc<DockerCommandManager>,
}

impl DockerCli {
    pub fn new(docker: DockerCommandManager) -> Self {
        Self {
            docker: Arc::new(docker),
        }
    }
}

impl ContainerFactory for DockerCli {
    fn new_container(&self, input: NewContainerInput) -> Arc<dyn Container> {
        Arc::new(DockerContainer::new(Arc::clone(&self.docker), input))
    }

    fn remove_volume(&self, name: &str, force: bool) -> Executor {
        let docker = Arc::clone(&self.docker);
        let name = name.to_string();
        Executor::from_fn(move |ctx| {
            let docker = Arc::clone(&docker);
            let name = name.clone();
            async move {
                if !docker.volume_exists(&name, ctx.cancel_token()).await? {
                    return Ok(());
                }
                tracing::debug!(target: "docker", job = %ctx.job(), "Removing volume {}", name);
                docker
                    .remove_volume(&name, force, ctx.cancel_token())
                    .await
                    .with_context(|| format!("Failed to remove volume {name}"))
            }
        })
    }
}
