// Container lifecycle adapter: the contract the job engine uses to drive a
// container engine. Every operation returns a deferred `Executor` so it can
// be composed into the job pipeline.

pub mod container_info;
pub mod docker_command_manager;
pub mod naming;

use std::collections::HashMap;
use std::sync::Arc;

use crate::pipeline::Executor;

pub use container_info::{FileEntry, NewContainerInput};
pub use docker_command_manager::{DockerCli, DockerCommandManager, DockerContainer};
pub use naming::{create_container_name, merge_maps};

/// One container, identified by name.
pub trait Container: Send + Sync {
    fn name(&self) -> &str;

    /// Pull the image; without `force_pull` only when it is missing locally.
    fn pull(&self, force_pull: bool) -> Executor;

    /// Remove an existing container with this name. Succeeds when none exists.
    fn remove(&self) -> Executor;

    /// Create the container unless one with this name already exists.
    fn create(&self) -> Executor;

    fn start(&self, attach: bool) -> Executor;

    /// Run `command` in the running container; a non-zero exit fails.
    fn exec(&self, command: Vec<String>, env: HashMap<String, String>) -> Executor;

    /// Write `files` under `dest_path`.
    fn copy(&self, dest_path: &str, files: Vec<FileEntry>) -> Executor;

    fn copy_dir(&self, dest_path: &str, src_path: &str, use_cache: bool) -> Executor;

    /// Point the `origin` remote of the repository at `repo_path` to HTTPS.
    fn change_remote_to_https(&self, repo_path: &str) -> Executor;
}

pub trait ContainerFactory: Send + Sync {
    fn new_container(&self, input: NewContainerInput) -> Arc<dyn Container>;

    fn remove_volume(&self, name: &str, force: bool) -> Executor;
}
