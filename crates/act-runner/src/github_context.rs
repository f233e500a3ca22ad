// GithubContext: the `github.*` expression context and the GITHUB_* step
// environment, projected from configuration, the event payload and git.
// Every metadata source degrades on its own: a failing lookup logs and
// leaves its field empty.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use act_common::constants::{self, events, paths};

use crate::git::GitInfo;
use crate::model::{RemoteAction, Step, StepType};

/// The `github` context available in expressions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GithubContext {
    /// Decoded event payload.
    pub event: Value,
    pub event_path: String,
    pub workflow: String,
    pub run_id: String,
    pub run_number: String,
    pub actor: String,
    pub repository: String,
    pub event_name: String,
    pub sha: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Only set for `pull_request` events.
    pub head_ref: String,
    pub base_ref: String,
    pub token: String,
    pub workspace: String,
    /// Id of the executing step.
    pub action: String,
}

/// Inputs of a `GithubContext` projection, borrowed from the run.
pub struct ProjectionSource<'a> {
    pub workflow: &'a str,
    pub actor: &'a str,
    pub event_name: &'a str,
    pub event_json: &'a str,
    pub workdir: &'a Path,
    pub current_step: &'a str,
    pub secrets: &'a HashMap<String, String>,
    pub token_fallback: Option<&'a str>,
    pub git: &'a dyn GitInfo,
}

impl GithubContext {
    pub fn project(source: &ProjectionSource<'_>) -> Self {
        let token = source
            .secrets
            .get(constants::env::GITHUB_TOKEN)
            .map(String::as_str)
            .or(source.token_fallback)
            .unwrap_or_default()
            .to_string();

        let actor = if source.actor.is_empty() {
            constants::DEFAULT_ACTOR
        } else {
            source.actor
        };

        let mut ghc = GithubContext {
            event: Value::Object(Default::default()),
            event_path: paths::EVENT_PATH.to_string(),
            workflow: source.workflow.to_string(),
            run_id: constants::LOCAL_RUN_ID.to_string(),
            run_number: constants::LOCAL_RUN_ID.to_string(),
            actor: actor.to_string(),
            event_name: source.event_name.to_string(),
            token,
            workspace: paths::WORKSPACE.to_string(),
            action: source.current_step.to_string(),
            ..Default::default()
        };

        match source.git.find_github_repo(source.workdir) {
            Ok(repo) => ghc.repository = repo,
            Err(e) => tracing::warn!(target: "job", "Unable to get git repo: {:#}", e),
        }

        match source.git.find_git_revision(source.workdir) {
            Ok((_, sha)) => ghc.sha = sha,
            Err(e) => tracing::warn!(target: "job", "Unable to get git revision: {:#}", e),
        }

        match source.git.find_git_ref(source.workdir) {
            Ok(git_ref) => {
                tracing::debug!(target: "job", "Using github ref: {}", git_ref);
                ghc.git_ref = git_ref;
            }
            Err(e) => tracing::warn!(target: "job", "Unable to get git ref: {:#}", e),
        }

        if !source.event_json.is_empty() {
            match serde_json::from_str::<Value>(source.event_json) {
                Ok(event) => ghc.event = event,
                Err(e) => {
                    tracing::error!(target: "job", "Unable to decode event '{}': {}", source.event_json, e)
                }
            }
        }

        if ghc.event_name == events::PULL_REQUEST {
            ghc.base_ref = as_string(nested_map_lookup(&ghc.event, &["pull_request", "base", "ref"]));
            ghc.head_ref = as_string(nested_map_lookup(&ghc.event, &["pull_request", "head", "ref"]));
        }

        ghc
    }

    /// A step is a local checkout when it uses `actions/checkout` for this
    /// repository and ref.
    pub fn is_local_checkout(&self, step: &Step) -> bool {
        if step.step_type() != StepType::UsesActionRemote {
            return false;
        }
        if !RemoteAction::parse(&step.uses).is_some_and(|a| a.is_checkout()) {
            return false;
        }
        if step.with.get("repository").is_some_and(|r| *r != self.repository) {
            return false;
        }
        if step.with.get("ref").is_some_and(|r| *r != self.git_ref) {
            return false;
        }
        true
    }

    /// GITHUB_* variables and HOME injected into every step.
    pub fn apply_env(&self, env: &mut HashMap<String, String>) {
        let vars: [(&str, &str); 14] = [
            (constants::env::HOME, paths::HOME),
            ("GITHUB_WORKFLOW", self.workflow.as_str()),
            ("GITHUB_RUN_ID", self.run_id.as_str()),
            ("GITHUB_RUN_NUMBER", self.run_number.as_str()),
            ("GITHUB_ACTION", self.action.as_str()),
            ("GITHUB_ACTIONS", "true"),
            ("GITHUB_ACTOR", self.actor.as_str()),
            ("GITHUB_REPOSITORY", self.repository.as_str()),
            ("GITHUB_EVENT_NAME", self.event_name.as_str()),
            ("GITHUB_EVENT_PATH", self.event_path.as_str()),
            ("GITHUB_WORKSPACE", self.workspace.as_str()),
            ("GITHUB_SHA", self.sha.as_str()),
            ("GITHUB_REF", self.git_ref.as_str()),
            (constants::env::GITHUB_TOKEN, self.token.as_str()),
        ];
        for (name, value) in vars {
            env.insert(name.to_string(), value.to_string());
        }
    }
}

/// Walk `keys` through nested objects. A missing key or a non-object on the
/// way yields `None`.
pub fn nested_map_lookup<'a>(tree: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let (first, rest) = keys.split_first()?;
    let value = tree.as_object()?.get(*first)?;
    if rest.is_empty() {
        Some(value)
    } else {
        nested_map_lookup(value, rest)
    }
}

/// The string content of a JSON string; anything else is empty.
pub fn as_string(value: Option<&Value>) -> String {
    value.and_then(Value::as_str).unwrap_or_default().to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Git discovery returning fixed values, or failing when `None`.
    /// Counts every lookup.
    pub(crate) struct FakeGit {
        pub repo: Option<String>,
        pub sha: Option<String>,
        pub git_ref: Option<String>,
        lookups: AtomicUsize,
    }

    impl FakeGit {
        pub(crate) fn new(repo: &str, sha: &str, git_ref: &str) -> Self {
            Self {
                repo: Some(repo.to_string()),
                sha: Some(sha.to_string()),
                git_ref: Some(git_ref.to_string()),
                lookups: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                repo: None,
                sha: None,
                git_ref: None,
                lookups: AtomicUsize::new(0),
            }
        }

        pub(crate) fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    impl GitInfo for FakeGit {
        fn find_github_repo(&self, _dir: &Path) -> Result<String> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.repo.clone().ok_or_else(|| anyhow!("no repo"))
        }

        fn find_git_revision(&self, _dir: &Path) -> Result<(String, String)> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let sha = self.sha.clone().ok_or_else(|| anyhow!("no revision"))?;
            Ok((sha.chars().take(7).collect(), sha))
        }

        fn find_git_ref(&self, _dir: &Path) -> Result<String> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.git_ref.clone().ok_or_else(|| anyhow!("no ref"))
        }
    }

    fn source<'a>(
        git: &'a dyn GitInfo,
        secrets: &'a HashMap<String, String>,
        event_name: &'a str,
        event_json: &'a str,
    ) -> ProjectionSource<'a> {
        ProjectionSource {
            workflow: "ci",
            actor: "",
            event_name,
            event_json,
            workdir: Path::new("."),
            current_step: "build",
            secrets,
            token_fallback: Some("fallback-token"),
            git,
        }
    }

    #[test]
    fn projection_defaults_and_git_metadata() {
        let git = FakeGit::new("nektos/act", "0123456789abcdef", "refs/heads/main");
        let secrets = HashMap::new();
        let ghc = GithubContext::project(&source(&git, &secrets, "push", ""));

        assert_eq!(ghc.actor, "nektos/act");
        assert_eq!(ghc.run_id, "1");
        assert_eq!(ghc.run_number, "1");
        assert_eq!(ghc.event_path, "/github/workflow/event.json");
        assert_eq!(ghc.workspace, "/github/workspace");
        assert_eq!(ghc.action, "build");
        assert_eq!(ghc.repository, "nektos/act");
        assert_eq!(ghc.sha, "0123456789abcdef");
        assert_eq!(ghc.git_ref, "refs/heads/main");
        assert_eq!(ghc.token, "fallback-token");
        assert_eq!(ghc.event, json!({}));
        assert_eq!(ghc.base_ref, "");
    }

    #[test]
    fn failing_sources_degrade_to_empty() {
        let git = FakeGit::failing();
        let secrets = HashMap::new();
        let ghc = GithubContext::project(&source(&git, &secrets, "push", "{not json"));
        assert_eq!(ghc.repository, "");
        assert_eq!(ghc.sha, "");
        assert_eq!(ghc.git_ref, "");
        assert_eq!(ghc.event, json!({}));
    }

    #[test]
    fn secret_token_wins_over_fallback() {
        let git = FakeGit::failing();
        let secrets: HashMap<String, String> =
            [("GITHUB_TOKEN".to_string(), "secret-token".to_string())].into_iter().collect();
        let ghc = GithubContext::project(&source(&git, &secrets, "push", ""));
        assert_eq!(ghc.token, "secret-token");
    }

    #[test]
    fn pull_request_refs_come_from_event() {
        let git = FakeGit::failing();
        let secrets = HashMap::new();
        let event = r#"{"pull_request":{"base":{"ref":"main"},"head":{"ref":"feature"}}}"#;

        let ghc = GithubContext::project(&source(&git, &secrets, "pull_request", event));
        assert_eq!(ghc.base_ref, "main");
        assert_eq!(ghc.head_ref, "feature");

        let push = GithubContext::project(&source(&git, &secrets, "push", event));
        assert_eq!(push.base_ref, "");
        assert_eq!(push.head_ref, "");
    }

    #[test]
    fn nested_lookup() {
        let tree = json!({"pull_request": {"base": {"ref": "main"}, "number": 5}});
        let lookup = |keys: &[&str]| as_string(nested_map_lookup(&tree, keys));

        assert_eq!(lookup(&["pull_request", "base", "ref"]), "main");
        assert_eq!(lookup(&["pull_request", "head", "ref"]), "");
        assert_eq!(lookup(&["pull_request", "number", "x"]), "");
        assert_eq!(lookup(&["pull_request", "number"]), "");
        assert!(nested_map_lookup(&tree, &[]).is_none());
    }

    fn checkout(with: &[(&str, &str)]) -> Step {
        Step {
            uses: "actions/checkout@v2".to_string(),
            with: with.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn local_checkout_detection() {
        let ghc = GithubContext {
            repository: "nektos/act".to_string(),
            git_ref: "refs/heads/main".to_string(),
            ..Default::default()
        };

        assert!(ghc.is_local_checkout(&checkout(&[])));
        assert!(ghc.is_local_checkout(&checkout(&[("repository", "nektos/act"), ("path", "src")])));
        assert!(ghc.is_local_checkout(&checkout(&[("ref", "refs/heads/main")])));
        assert!(!ghc.is_local_checkout(&checkout(&[("repository", "other/repo")])));
        assert!(!ghc.is_local_checkout(&checkout(&[("ref", "refs/heads/dev")])));

        let other = Step {
            uses: "actions/setup-node@v3".to_string(),
            ..Default::default()
        };
        assert!(!ghc.is_local_checkout(&other));

        let run = Step {
            run: "echo".to_string(),
            ..Default::default()
        };
        assert!(!ghc.is_local_checkout(&run));
    }

    #[test]
    fn github_env() {
        let ghc = GithubContext {
            workflow: "ci".to_string(),
            sha: "abc".to_string(),
            token: "t".to_string(),
            ..Default::default()
        };
        let mut env = HashMap::new();
        ghc.apply_env(&mut env);
        assert_eq!(env["HOME"], "/github/home");
        assert_eq!(env["GITHUB_ACTIONS"], "true");
        assert_eq!(env["GITHUB_WORKFLOW"], "ci");
        assert_eq!(env["GITHUB_SHA"], "abc");
        assert_eq!(env["GITHUB_TOKEN"], "t");
        assert_eq!(env.len(), 14);
    }
}
