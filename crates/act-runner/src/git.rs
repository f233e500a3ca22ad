// Git repository discovery for the `github` context: repository slug,
// revision and ref of the working directory.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

pub trait GitInfo: Send + Sync {
    /// `owner/repo` parsed from the `origin` remote.
    fn find_github_repo(&self, dir: &Path) -> Result<String>;

    /// `(short, full)` commit sha of `HEAD`.
    fn find_git_revision(&self, dir: &Path) -> Result<(String, String)>;

    /// `refs/heads/<branch>` or `refs/tags/<tag>` for `HEAD`.
    fn find_git_ref(&self, dir: &Path) -> Result<String>;
}

static GITHUB_SLUG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z]+://)?(?:[^@/]+@)?[^:/]+(?::\d+)?[:/]([^/]+)/([^/]+?)(?:\.git)?/?$")
        .expect("Invalid git remote regex")
});

/// `owner/repo` from an SSH or HTTPS remote URL.
pub fn parse_github_slug(url: &str) -> Option<String> {
    let caps = GITHUB_SLUG.captures(url.trim())?;
    Some(format!("{}/{}", &caps[1], &caps[2]))
}

/// Discovery through the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_path: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            git_path: "git".to_string(),
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `git -C <dir> <args>`; `None` on a non-zero exit.
    fn git(&self, dir: &Path, args: &[&str]) -> Result<Option<String>> {
        let output = Command::new(&self.git_path)
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run {} {}", self.git_path, args.join(" ")))?;

        if !output.status.success() {
            tracing::trace!(target: "git", "git {} exited with {}", args.join(" "), output.status);
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }
}

impl GitInfo for GitCli {
    fn find_github_repo(&self, dir: &Path) -> Result<String> {
        let url = self
            .git(dir, &["remote", "get-url", "origin"])?
            .with_context(|| format!("No origin remote in {}", dir.display()))?;
        parse_github_slug(&url).with_context(|| format!("Unable to parse remote url '{url}'"))
    }

    fn find_git_revision(&self, dir: &Path) -> Result<(String, String)> {
        let full = self
            .git(dir, &["rev-parse", "HEAD"])?
            .filter(|sha| !sha.is_empty())
            .with_context(|| format!("No revision for HEAD in {}", dir.display()))?;
        let short = full.chars().take(7).collect();
        Ok((short, full))
    }

    fn find_git_ref(&self, dir: &Path) -> Result<String> {
        if let Some(branch) = self.git(dir, &["symbolic-ref", "-q", "HEAD"])?.filter(|r| !r.is_empty()) {
            return Ok(branch);
        }
        if let Some(tag) = self
            .git(dir, &["describe", "--tags", "--exact-match"])?
            .filter(|t| !t.is_empty())
        {
            return Ok(format!("refs/tags/{tag}"));
        }
        anyhow::bail!("Unable to determine git ref of {}", dir.display())
    }
}

// ---------------------------------------------------------------------------
// CachedGitInfo
// ---------------------------------------------------------------------------

type Cache<T> = Mutex<HashMap<PathBuf, Result<T, String>>>;

/// Remembers every answer of another `GitInfo`, failures included, per
/// directory. The working tree does not change during a job.
pub struct CachedGitInfo {
    inner: Arc<dyn GitInfo>,
    repos: Cache<String>,
    revisions: Cache<(String, String)>,
    refs: Cache<String>,
}

impl CachedGitInfo {
    pub fn new(inner: Arc<dyn GitInfo>) -> Self {
        Self {
            inner,
            repos: Mutex::default(),
            revisions: Mutex::default(),
            refs: Mutex::default(),
        }
    }
}

fn cached<T: Clone>(cache: &Cache<T>, dir: &Path, lookup: impl FnOnce() -> Result<T>) -> Result<T> {
    if let Some(hit) = cache.lock().get(dir) {
        return hit.clone().map_err(anyhow::Error::msg);
    }
    let result = lookup().map_err(|e| format!("{e:#}"));
    cache.lock().insert(dir.to_path_buf(), result.clone());
    result.map_err(anyhow::Error::msg)
}

impl GitInfo for CachedGitInfo {
    fn find_github_repo(&self, dir: &Path) -> Result<String> {
        cached(&self.repos, dir, || self.inner.find_github_repo(dir))
    }

    fn find_git_revision(&self, dir: &Path) -> Result<(String, String)> {
        cached(&self.revisions, dir, || self.inner.find_git_revision(dir))
    }

    fn find_git_ref(&self, dir: &Path) -> Result<String> {
        cached(&self.refs, dir, || self.inner.find_git_ref(dir))
    }
}
