// Container descriptions handed to the container engine driver.
// A `NewContainerInput` fully describes one container; `FileEntry` is a file
// injected into a running container.

use act_sdk::LineWriter;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct NewContainerInput {
    pub image: String,
    pub name: String,
    pub cmd: Vec<String>,
    /// First element replaces the image entrypoint, the rest become its arguments.
    pub entrypoint: Vec<String>,
    pub working_dir: String,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    /// Named volume → container path.
    pub mounts: BTreeMap<String, String>,
    /// `host:container[:modifiers]` bind specs.
    pub binds: Vec<String>,
    pub network_mode: String,
    /// `container:alias` pairs.
    pub links: Vec<String>,
    pub privileged: bool,
    pub stdout: Option<Arc<LineWriter>>,
    pub stderr: Option<Arc<LineWriter>>,
}

impl NewContainerInput {
    /// `-e KEY` for every env entry. Values are not put on the command line;
    /// docker reads them from its own environment, see `env_vars`.
    pub fn build_env_args(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|kv| kv.split_once('=').map_or(kv.as_str(), |(k, _)| k))
            .flat_map(|key| ["-e".to_string(), key.to_string()])
            .collect()
    }

    /// Env entries as a map, to be set on the docker client process.
    pub fn env_vars(&self) -> HashMap<String, String> {
        self.env
            .iter()
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// `-v` arguments for named mounts followed by binds.
    pub fn build_volume_args(&self) -> Vec<String> {
        let mounts = self
            .mounts
            .iter()
            .map(|(volume, path)| format!("{volume}:{path}"));
        mounts
            .chain(self.binds.iter().cloned())
            .flat_map(|spec| ["-v".to_string(), spec])
            .collect()
    }

    pub fn build_link_args(&self) -> Vec<String> {
        self.links
            .iter()
            .flat_map(|link| ["--link".to_string(), link.clone()])
            .collect()
    }

    /// Value of an env entry, if present.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|kv| {
            kv.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

/// A file copied into a container, relative to the copy destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub mode: u32,
    pub body: String,
}
