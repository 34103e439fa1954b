//! Repository synchronization engine
//!
//! [`SyncEngine`] decides, for one repository at a time, whether to clone,
//! fast-forward, merge from an upstream template, or back up and re-clone.
//!
//! # Flow
//!
//! ```text
//! sync_repository
//!   └─ ensure_up_to_date ── absent ──────────► clone (one credential refresh)
//!         │                 detached ────────► leave untouched
//!         │                 on branch ───────► fetch, pull --ff-only
//!         │                                      └─ diverged ─► recovery
//!         └─ upstream set? ─► sync_with_upstream (stash, merge, push, restore)
//! ```
//!
//! Calls against the same path are serialized by a per-path lock; calls
//! against different paths may run concurrently.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::auth_url::redact;
use crate::credentials::{CredentialCache, CredentialSupplier};
use crate::error::{Error, GitErrorKind, Result};
use crate::git::{CheckoutState, GitRunner, Probe};
use crate::interaction::UserInteraction;

mod fork;
mod locks;
mod recovery;

pub use fork::{ForkSyncReport, RemoteAddition, StashHandle};
pub use locks::PathLocks;

/// A directory on disk holding one checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalRepository {
    pub name: String,
    /// Unique key for per-repository serialization
    pub path: PathBuf,
    /// The user's own, writable remote
    pub origin_url: String,
    /// Template remote this repository was forked from
    pub upstream_url: Option<String>,
}

/// How one sync attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOutcome {
    Cloned,
    Updated,
    Unchanged,
    Recovered,
    SkippedDirty,
    Failed,
}

impl SyncOutcome {
    /// The checkout is in a known-good state and further steps may run.
    pub fn is_success(self) -> bool {
        !matches!(self, SyncOutcome::SkippedDirty | SyncOutcome::Failed)
    }
}

/// Result of the upstream step of a sync, if it ran
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum UpstreamSync {
    Synced(ForkSyncReport),
    Failed { error: String },
}

/// Record of one invocation against one repository. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SyncAttempt {
    pub name: String,
    pub path: PathBuf,
    pub outcome: SyncOutcome,
    /// Where the pre-recovery files were copied, if recovery ran
    pub backup: Option<PathBuf>,
    pub error: Option<String>,
    pub upstream: Option<UpstreamSync>,
}

impl SyncAttempt {
    fn new(repo: &LocalRepository, outcome: SyncOutcome) -> Self {
        Self {
            name: repo.name.clone(),
            path: repo.path.clone(),
            outcome,
            backup: None,
            error: None,
            upstream: None,
        }
    }

    fn failed(repo: &LocalRepository, err: &Error) -> Self {
        let backup = match err {
            Error::RecloneFailed { backup, .. } => backup.clone(),
            _ => None,
        };
        Self {
            backup,
            error: Some(err.to_string()),
            ..Self::new(repo, SyncOutcome::Failed)
        }
    }
}

/// Knobs that do not change per repository
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Clone with `--depth 1`
    pub shallow_clone: bool,
}

/// The clone/update coordinator
pub struct SyncEngine {
    runner: Arc<dyn GitRunner>,
    credentials: CredentialCache,
    ui: Arc<dyn UserInteraction>,
    options: SyncOptions,
    locks: PathLocks,
}

impl SyncEngine {
    pub fn new(
        runner: Arc<dyn GitRunner>,
        credentials: Arc<dyn CredentialSupplier>,
        ui: Arc<dyn UserInteraction>,
    ) -> Self {
        Self {
            runner,
            credentials: CredentialCache::new(credentials),
            ui,
            options: SyncOptions::default(),
            locks: PathLocks::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn probe(&self) -> Probe<'_> {
        Probe::new(self.runner.as_ref())
    }

    /// Bring the checkout up to date and, if it has an upstream template,
    /// merge in whatever the template gained since.
    #[instrument(skip_all, fields(repo = %repo.name))]
    pub async fn sync_repository(&self, repo: &LocalRepository) -> SyncAttempt {
        let _guard = self.locks.acquire(&repo.path).await;

        let mut attempt = self.update_locked(repo).await;
        if attempt.outcome.is_success() && repo.upstream_url.is_some() {
            if let Ok(CheckoutState::Detached) = self.probe().state(&repo.path).await {
                info!("detached HEAD, skipping template sync");
                return attempt;
            }
            attempt.upstream = Some(match self.fork_sync_locked(repo).await {
                Ok(report) => UpstreamSync::Synced(report),
                Err(e) => UpstreamSync::Failed {
                    error: e.to_string(),
                },
            });
        }
        attempt
    }

    /// Clone the repository if absent, otherwise fast-forward it.
    ///
    /// Never returns an error: failures are reported to the user and recorded
    /// as [`SyncOutcome::Failed`] so a batch can move on.
    #[instrument(skip_all, fields(repo = %repo.name))]
    pub async fn ensure_up_to_date(&self, repo: &LocalRepository) -> SyncAttempt {
        let _guard = self.locks.acquire(&repo.path).await;
        self.update_locked(repo).await
    }

    async fn update_locked(&self, repo: &LocalRepository) -> SyncAttempt {
        match self.try_update(repo).await {
            Ok(attempt) => {
                info!(outcome = ?attempt.outcome, "sync finished");
                attempt
            }
            Err(e) => {
                warn!(error = %e, "sync failed");
                let message = match e.suggestion() {
                    Some(hint) => format!("Could not sync {}: {e}. {hint}.", repo.name),
                    None => format!("Could not sync {}: {e}", repo.name),
                };
                self.ui.warn(&message).await;
                SyncAttempt::failed(repo, &e)
            }
        }
    }

    async fn try_update(&self, repo: &LocalRepository) -> Result<SyncAttempt> {
        let probe = self.probe();
        if !probe.exists(&repo.path) {
            self.clone_with_auth_retry(repo).await?;
            return Ok(SyncAttempt::new(repo, SyncOutcome::Cloned));
        }

        self.fetch_with_auth_retry(repo).await?;

        let branch = match probe.state(&repo.path).await? {
            CheckoutState::OnBranch(branch) => branch,
            CheckoutState::Detached => {
                info!("detached HEAD, leaving checkout untouched");
                return Ok(SyncAttempt::new(repo, SyncOutcome::Unchanged));
            }
            CheckoutState::Absent => {
                return Err(Error::NotCloned {
                    path: repo.path.clone(),
                })
            }
        };

        let before = probe.head_commit(&repo.path).await?;
        if let Err(e) = self.runner.run(&repo.path, &["pull", "--ff-only"]).await {
            return match e.git_kind() {
                Some(GitErrorKind::NonFastForward) => {
                    let backup = self.recover_from_history_rewrite(repo).await?;
                    Ok(SyncAttempt {
                        backup,
                        ..SyncAttempt::new(repo, SyncOutcome::Recovered)
                    })
                }
                Some(GitErrorKind::DirtyWorkingTree) => {
                    self.ui
                        .warn(&format!(
                            "{} has local changes that conflict with new commits on {branch}; \
                             commit or stash them and sync again.",
                            repo.name
                        ))
                        .await;
                    Ok(SyncAttempt::new(repo, SyncOutcome::SkippedDirty))
                }
                _ => Err(e),
            };
        }

        let after = probe.head_commit(&repo.path).await?;
        let outcome = if before == after {
            SyncOutcome::Unchanged
        } else {
            SyncOutcome::Updated
        };
        debug!(?before, ?after, "pull complete");
        Ok(SyncAttempt::new(repo, outcome))
    }

    /// Clone `repo.origin_url` into `repo.path`, refreshing the credential
    /// once if the host rejects it or the clone times out.
    pub(crate) async fn clone_with_auth_retry(&self, repo: &LocalRepository) -> Result<()> {
        let parent = repo
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
        let existed_before = repo.path.exists();

        let url = self.credentials.authenticated(&repo.origin_url).await;
        let first = match self.clone_into(&url, &repo.path, parent).await {
            Ok(()) => return Ok(()),
            Err(e) if e.git_kind().is_some_and(GitErrorKind::is_credential_retryable) => e,
            Err(e) => return Err(e),
        };

        warn!(error = %first, "clone rejected, retrying with a fresh credential");
        if !existed_before && repo.path.exists() {
            tokio::fs::remove_dir_all(&repo.path)
                .await
                .map_err(|e| Error::io(&repo.path, e))?;
        }

        let url = self.credentials.reauthenticated(&repo.origin_url).await;
        self.clone_into(&url, &repo.path, parent)
            .await
            .map_err(|e| Error::CloneFailed {
                url: redact(&repo.origin_url).into_owned(),
                source: Box::new(e),
            })
    }

    async fn clone_into(&self, url: &str, dest: &Path, cwd: &Path) -> Result<()> {
        let dest = dest.to_string_lossy();
        let mut args = vec!["clone"];
        if self.options.shallow_clone {
            args.extend(["--depth", "1"]);
        }
        args.extend(["--", url, dest.as_ref()]);

        self.runner.run(cwd, &args).await?;
        info!(dest = %dest, "cloned");
        Ok(())
    }

    /// Fetch `origin` only, re-pointing it at a fresh credential once if the
    /// stored one is rejected.
    async fn fetch_with_auth_retry(&self, repo: &LocalRepository) -> Result<()> {
        // `upstream` may hold a stale token; fork-sync re-points and fetches it.
        let fetch = ["fetch", "--prune", "origin"];
        let first = match self.runner.run(&repo.path, &fetch).await {
            Ok(_) => return Ok(()),
            Err(e) if e.git_kind().is_some_and(GitErrorKind::is_credential_retryable) => e,
            Err(e) => return Err(e),
        };

        warn!(error = %first, "fetch rejected, retrying with a fresh credential");
        let url = self.credentials.reauthenticated(&repo.origin_url).await;
        self.runner
            .run(&repo.path, &["remote", "set-url", "origin", &url])
            .await?;
        self.runner.run(&repo.path, &fetch).await?;
        Ok(())
    }
}
