// Config: run-wide settings shared by every job of a run.
// Loaded from a JSON or YAML file, overlaid by command-line flags, and
// carrying the ambient process state (token, cache dirs) as explicit inputs
// so the engine never reads the process environment on its own.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// User reported as `github.actor`.
    pub actor: String,

    /// Host directory holding the checked out repository.
    pub workdir: PathBuf,

    /// Bind-mount `workdir` into the containers instead of copying it.
    pub bind_workdir: bool,

    /// Name of the event that triggered the run (`push`, `pull_request`, ...).
    pub event_name: String,

    /// Path of the event payload on the host, if any.
    pub event_path: Option<PathBuf>,

    /// Keep containers around between runs and reuse them by name.
    pub reuse_containers: bool,

    /// Always pull the job image even when present locally.
    pub force_pull: bool,

    /// Log container output at info level instead of debug.
    pub log_output: bool,

    /// Run-wide environment, lowest precedence.
    pub env: HashMap<String, String>,

    /// Secrets exposed as `secrets.*` and masked in output.
    pub secrets: HashMap<String, String>,

    /// `runs-on` label → container image.
    pub platforms: HashMap<String, String>,

    /// Token used when `secrets.GITHUB_TOKEN` is absent.
    pub github_token: Option<String>,

    /// Cache root overrides, normally taken from `XDG_CACHE_HOME` / `HOME`.
    pub xdg_cache_home: Option<PathBuf>,
    pub home: Option<PathBuf>,
}

impl Config {
    /// Load a config file. `.yml`/`.yaml` files are parsed as YAML, everything
    /// else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("yml") || e.eq_ignore_ascii_case("yaml"))
            .unwrap_or(false);

        let config: Config = if is_yaml {
            serde_yaml::from_str(&raw)
                .with_context(|| format!("Failed to parse YAML config {}", path.display()))?
        } else {
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse JSON config {}", path.display()))?
        };

        Ok(config)
    }

    /// Fill the ambient inputs from the process environment. Values already
    /// set are left alone.
    pub fn with_process_env(mut self) -> Self {
        self.apply_env(|name| std::env::var(name).ok());
        self
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.github_token.is_none() {
            self.github_token = lookup(constants::env::GITHUB_TOKEN).filter(|t| !t.is_empty());
        }
        if self.xdg_cache_home.is_none() {
            self.xdg_cache_home = lookup(constants::env::XDG_CACHE_HOME).map(PathBuf::from);
        }
        if self.home.is_none() {
            self.home = lookup(constants::env::HOME).map(PathBuf::from);
        }
    }

    /// Directory where downloaded actions are cached: `$XDG_CACHE_HOME/act`,
    /// else `$HOME/.cache/act`, else a relative `act`.
    pub fn action_cache_dir(&self) -> PathBuf {
        let cache_root = match (&self.xdg_cache_home, &self.home) {
            (Some(xdg), _) => xdg.clone(),
            (None, Some(home)) => home.join(".cache"),
            (None, None) => PathBuf::new(),
        };
        cache_root.join(constants::TOOL_NAME)
    }

    /// Image configured for a `runs-on` label. Labels match case-insensitively
    /// and an empty image counts as unmapped.
    pub fn platform_image(&self, label: &str) -> Option<&str> {
        let wanted = label.to_lowercase();
        self.platforms
            .iter()
            .find(|(name, _)| name.to_lowercase() == wanted)
            .map(|(_, image)| image.as_str())
            .filter(|image| !image.is_empty())
    }
}
