//! Read-only inspection of a checkout.

use std::path::Path;
use tracing::debug;

use super::GitRunner;
use crate::error::{Error, Result};

/// Name of the remote pointing at the template a repository was forked from.
pub const UPSTREAM_REMOTE: &str = "upstream";

/// Branches tried, in order, when upstream will not tell us its HEAD.
const FALLBACK_BRANCHES: &[&str] = &["main", "master"];

/// Porcelain status codes for unmerged paths.
const UNMERGED_CODES: &[&str] = &["DD", "AU", "UD", "UA", "DU", "AA", "UU"];

/// What is at a repository path, derived once instead of re-checked ad hoc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutState {
    /// No valid checkout at the path.
    Absent,
    /// A checkout whose HEAD is not attached to a branch.
    Detached,
    /// A checkout on the named branch.
    OnBranch(String),
}

/// Answers questions about a checkout without mutating it.
pub struct Probe<'a> {
    runner: &'a dyn GitRunner,
}

impl<'a> Probe<'a> {
    pub fn new(runner: &'a dyn GitRunner) -> Self {
        Self { runner }
    }

    /// True if `path` is a directory holding a valid checkout.
    pub fn exists(&self, path: &Path) -> bool {
        path.is_dir() && path.join(".git").exists() && git2::Repository::open(path).is_ok()
    }

    /// Absent, detached, or on a branch.
    pub async fn state(&self, path: &Path) -> Result<CheckoutState> {
        if !self.exists(path) {
            return Ok(CheckoutState::Absent);
        }
        let out = self.runner.run(path, &["branch", "--show-current"]).await?;
        let branch = out.stdout.trim();
        Ok(if branch.is_empty() {
            CheckoutState::Detached
        } else {
            CheckoutState::OnBranch(branch.to_string())
        })
    }

    /// No uncommitted or untracked changes.
    pub async fn is_clean(&self, path: &Path) -> Result<bool> {
        Ok(self.status(path).await?.trim().is_empty())
    }

    /// Porcelain status shows unmerged entries.
    pub async fn has_conflicts(&self, path: &Path) -> Result<bool> {
        let status = self.status(path).await?;
        Ok(status
            .lines()
            .filter_map(|line| line.get(..2))
            .any(|code| UNMERGED_CODES.contains(&code)))
    }

    /// A merge has been started and not concluded or aborted.
    pub fn merge_in_progress(&self, path: &Path) -> bool {
        path.join(".git").join("MERGE_HEAD").exists()
    }

    /// Current `HEAD` commit, `None` on an unborn branch.
    pub async fn head_commit(&self, path: &Path) -> Result<Option<String>> {
        match self
            .runner
            .run(path, &["rev-parse", "--verify", "--quiet", "HEAD"])
            .await
        {
            Ok(out) => Ok(Some(out.stdout.trim().to_string())),
            Err(Error::Git(err)) if err.exit_code == Some(1) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Names of configured remotes.
    pub async fn remotes(&self, path: &Path) -> Result<Vec<String>> {
        let out = self.runner.run(path, &["remote"]).await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// The branch `upstream` considers canonical.
    ///
    /// Asks the remote for its symbolic HEAD; if that fails, looks for
    /// `upstream/main` then `upstream/master` among remote-tracking branches.
    pub async fn upstream_default_branch(&self, path: &Path) -> Result<Option<String>> {
        match self
            .runner
            .run(path, &["ls-remote", "--symref", UPSTREAM_REMOTE, "HEAD"])
            .await
        {
            Ok(out) => {
                if let Some(branch) = parse_symref_head(&out.stdout) {
                    return Ok(Some(branch));
                }
                debug!("upstream did not advertise a symbolic HEAD");
            }
            Err(e) => debug!(error = %e, "ls-remote against upstream failed"),
        }

        for candidate in FALLBACK_BRANCHES {
            let tracking = format!("{UPSTREAM_REMOTE}/{candidate}");
            let out = self
                .runner
                .run(path, &["branch", "-r", "--list", &tracking])
                .await?;
            if !out.stdout.trim().is_empty() {
                return Ok(Some((*candidate).to_string()));
            }
        }
        Ok(None)
    }

    /// Commits reachable from `upstream/<branch>` but not from `HEAD`.
    pub async fn behind_count(&self, path: &Path, branch: &str) -> Result<u32> {
        let range = format!("HEAD..{UPSTREAM_REMOTE}/{branch}");
        let out = self
            .runner
            .run(path, &["rev-list", "--count", &range])
            .await?;
        out.stdout
            .trim()
            .parse()
            .map_err(|_| Error::Other(format!("unexpected rev-list output: {:?}", out.stdout)))
    }

    async fn status(&self, path: &Path) -> Result<String> {
        Ok(self
            .runner
            .run(path, &["status", "--porcelain"])
            .await?
            .stdout)
    }
}

/// Pull `main` out of `ref: refs/heads/main\tHEAD`.
fn parse_symref_head(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (target, name) = line.strip_prefix("ref:")?.trim().split_once('\t')?;
        if name.trim() != "HEAD" {
            return None;
        }
        target.trim().strip_prefix("refs/heads/").map(String::from)
    })
}
