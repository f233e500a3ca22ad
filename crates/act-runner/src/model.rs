// Workflow model: the subset of a workflow file the job engine reads.
// Deserialized from YAML with serde; scalar values in `env`, `with` and `if`
// are normalized to strings the way a CI service would see them.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Workflow {
    pub name: String,
    #[serde(deserialize_with = "string_map")]
    pub env: HashMap<String, String>,
    pub jobs: BTreeMap<String, Job>,
}

impl Workflow {
    /// Load a workflow file. An unnamed workflow is named after its file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow {}", path.display()))?;
        let mut workflow = Self::from_yaml(&raw)
            .with_context(|| format!("Failed to parse workflow {}", path.display()))?;
        if workflow.name.is_empty() {
            workflow.name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(workflow)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Job {
    pub name: String,
    pub runs_on: RunsOn,
    pub container: Option<ContainerSpec>,
    #[serde(deserialize_with = "string_map")]
    pub env: HashMap<String, String>,
    #[serde(rename = "if", deserialize_with = "scalar_string")]
    pub if_condition: String,
    pub steps: Vec<Step>,
}

impl Job {
    pub fn runs_on(&self) -> Vec<String> {
        match &self.runs_on {
            RunsOn::Label(label) => vec![label.clone()],
            RunsOn::Labels(labels) => labels.clone(),
        }
    }

    /// Explicit container image, if the job declares one.
    pub fn container_image(&self) -> Option<&str> {
        self.container
            .as_ref()
            .map(ContainerSpec::image)
            .filter(|image| !image.is_empty())
    }

    /// `env` of a detailed `container:` entry.
    pub fn container_env(&self) -> Option<&HashMap<String, String>> {
        match &self.container {
            Some(ContainerSpec::Detailed { env, .. }) => Some(env),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RunsOn {
    Label(String),
    Labels(Vec<String>),
}

impl Default for RunsOn {
    fn default() -> Self {
        RunsOn::Labels(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ContainerSpec {
    Image(String),
    Detailed {
        image: String,
        #[serde(default, deserialize_with = "string_map")]
        env: HashMap<String, String>,
    },
}

impl ContainerSpec {
    pub fn image(&self) -> &str {
        match self {
            ContainerSpec::Image(image) => image,
            ContainerSpec::Detailed { image, .. } => image,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Step {
    pub id: String,
    pub name: String,
    pub uses: String,
    pub run: String,
    pub shell: String,
    pub working_directory: String,
    #[serde(deserialize_with = "string_map")]
    pub env: HashMap<String, String>,
    #[serde(deserialize_with = "string_map")]
    pub with: HashMap<String, String>,
    #[serde(rename = "if", deserialize_with = "scalar_string")]
    pub if_condition: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    /// `run:` script executed in the job container.
    Run,
    /// `uses: docker://image`.
    UsesDockerUrl,
    /// `uses: ./path` inside the repository.
    UsesActionLocal,
    /// `uses: owner/repo[/path]@ref`.
    UsesActionRemote,
    Invalid,
}

impl Step {
    pub fn step_type(&self) -> StepType {
        match (self.run.is_empty(), self.uses.is_empty()) {
            (false, true) => StepType::Run,
            (true, false) if self.uses.starts_with("docker://") => StepType::UsesDockerUrl,
            (true, false) if self.uses.starts_with("./") => StepType::UsesActionLocal,
            (true, false) => StepType::UsesActionRemote,
            _ => StepType::Invalid,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = [&self.name, &self.uses, &self.run, &self.id]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or("");
        f.write_str(label)
    }
}

static REMOTE_ACTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^/@]+)/([^/@]+)(?:/([^@]*))?(?:@(.*))?$").expect("Invalid remote action regex")
});

/// A `uses:` reference to an action in another repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAction {
    pub org: String,
    pub repo: String,
    pub path: String,
    pub git_ref: String,
}

impl RemoteAction {
    pub fn parse(uses: &str) -> Option<Self> {
        let caps = REMOTE_ACTION.captures(uses)?;
        let group = |i: usize| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default();
        Some(Self {
            org: group(1),
            repo: group(2),
            path: group(3),
            git_ref: group(4),
        })
    }

    pub fn is_checkout(&self) -> bool {
        self.org == "actions" && self.repo == "checkout"
    }
}

/// One job of a workflow selected for execution.
#[derive(Debug, Clone)]
pub struct Run {
    pub workflow: Arc<Workflow>,
    pub job_id: String,
    job: Job,
}

impl Run {
    pub fn new(workflow: Arc<Workflow>, job_id: &str) -> Result<Self> {
        let job = workflow
            .jobs
            .get(job_id)
            .cloned()
            .with_context(|| format!("Job '{}' not found in workflow '{}'", job_id, workflow.name))?;
        Ok(Self {
            workflow,
            job_id: job_id.to_string(),
            job,
        })
    }

    pub fn job(&self) -> &Job {
        &self.job
    }
}

// ---------------------------------------------------------------------------
// Scalar normalization
// ---------------------------------------------------------------------------

fn scalar_to_string(value: serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s,
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

fn scalar_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(scalar_to_string(serde_yaml::Value::deserialize(deserializer)?))
}

fn string_map<'de, D>(deserializer: D) -> std::result::Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<HashMap<String, serde_yaml::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, scalar_to_string(v)))
        .collect())
}
