//! Merging an upstream template into the user's fork
//!
//! The run stashes local work, merges `upstream/<default>` into the current
//! branch, pushes to `origin`, and puts everything back. Cleanup always
//! runs once the stash exists:
//!
//! 1. pop the stash this run created (never retried; failure is reported with
//!    the command to run by hand)
//! 2. remove the `upstream` remote if this run added it

use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{LocalRepository, SyncEngine};
use crate::error::{Error, GitErrorKind, Result};
use crate::git::{CheckoutState, UPSTREAM_REMOTE};

const STASH_MARKER_PREFIX: &str = "coursesync-autostash";

/// A stash entry created by this run, located again by its marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashHandle {
    /// Unique text embedded in the stash message
    pub marker: String,
    /// `stash@{N}` at the time the stash was created
    pub reference: String,
}

/// Whether the `upstream` remote existed before this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAddition {
    AddedByUs,
    PreExisting,
}

/// What a fork sync did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForkSyncReport {
    /// Upstream commits were merged
    pub updated: bool,
    /// Commits the branch was behind `upstream/<default>`
    pub behind: u32,
    /// The merge result reached `origin`
    pub pushed: bool,
    /// Stash left behind because it could not be restored
    pub unrestored_stash: Option<String>,
}

/// State that cleanup needs, filled in as the run progresses.
#[derive(Debug, Default)]
struct ForkRun {
    stash: Option<StashHandle>,
    remote: Option<RemoteAddition>,
    report: ForkSyncReport,
}

impl SyncEngine {
    /// Merge new commits from the repository's upstream template.
    ///
    /// Local changes survive whether or not the merge succeeds, and the remote
    /// list is left as it was found.
    #[instrument(skip_all, fields(repo = %repo.name))]
    pub async fn sync_with_upstream(&self, repo: &LocalRepository) -> Result<ForkSyncReport> {
        let _guard = self.locks.acquire(&repo.path).await;
        self.fork_sync_locked(repo).await
    }

    pub(super) async fn fork_sync_locked(&self, repo: &LocalRepository) -> Result<ForkSyncReport> {
        let Some(upstream_url) = repo.upstream_url.as_deref() else {
            return Err(Error::NoUpstream {
                name: repo.name.clone(),
            });
        };
        let path = repo.path.as_path();
        let probe = self.probe();

        if probe.merge_in_progress(path) {
            warn!("found an unfinished merge, aborting it");
            if let Err(e) = self.runner.run(path, &["merge", "--abort"]).await {
                debug!(error = %e, "merge --abort failed");
            }
        }

        if probe.has_conflicts(path).await? {
            self.ui
                .warn(&format!(
                    "{} has unresolved merge conflicts. Resolve them and commit before \
                     syncing with the template.",
                    repo.name
                ))
                .await;
            return Err(Error::ConflictsPresent {
                path: path.to_path_buf(),
            });
        }

        let branch = match probe.state(path).await? {
            CheckoutState::OnBranch(branch) => branch,
            CheckoutState::Detached => {
                self.ui
                    .warn(&format!(
                        "{} is not on a branch; check out a branch to receive template updates.",
                        repo.name
                    ))
                    .await;
                return Err(Error::DetachedHead {
                    path: path.to_path_buf(),
                });
            }
            CheckoutState::Absent => {
                return Err(Error::NotCloned {
                    path: path.to_path_buf(),
                })
            }
        };

        let mut run = ForkRun::default();
        if !probe.is_clean(path).await? {
            match self.stash_local_changes(path).await {
                Ok(handle) => run.stash = handle,
                Err(e) => {
                    self.ui
                        .warn(&format!(
                            "Could not save local changes in {}; template sync skipped. ({e})",
                            repo.name
                        ))
                        .await;
                    return Err(Error::StashFailed {
                        path: path.to_path_buf(),
                        source: Box::new(e),
                    });
                }
            }
        }

        let result = self.merge_upstream(repo, upstream_url, &branch, &mut run).await;
        if let Err(e) = &result {
            warn!(error = %e, "template sync failed");
            self.abort_merge(path).await;
        }

        self.cleanup(repo, &mut run).await;

        match result {
            Ok(()) => Ok(run.report),
            Err(e) => {
                self.ui
                    .warn(&format!("Template sync for {} failed: {e}", repo.name))
                    .await;
                Err(e)
            }
        }
    }

    async fn merge_upstream(
        &self,
        repo: &LocalRepository,
        upstream_url: &str,
        branch: &str,
        run: &mut ForkRun,
    ) -> Result<()> {
        let path = repo.path.as_path();
        let probe = self.probe();

        let url = self.credentials.authenticated(upstream_url).await;
        if probe.remotes(path).await?.iter().any(|r| r == UPSTREAM_REMOTE) {
            self.runner
                .run(path, &["remote", "set-url", UPSTREAM_REMOTE, &url])
                .await?;
            run.remote = Some(RemoteAddition::PreExisting);
        } else {
            self.runner
                .run(path, &["remote", "add", UPSTREAM_REMOTE, &url])
                .await?;
            run.remote = Some(RemoteAddition::AddedByUs);
        }
        self.fetch_upstream(path, upstream_url).await?;

        let Some(default_branch) = probe.upstream_default_branch(path).await? else {
            self.ui
                .warn(&format!(
                    "Could not find the default branch of the template for {}. \
                     Please let your instructor know.",
                    repo.name
                ))
                .await;
            return Err(Error::UpstreamBranchUnresolved {
                path: path.to_path_buf(),
            });
        };

        let behind = probe.behind_count(path, &default_branch).await?;
        run.report.behind = behind;
        if behind == 0 {
            debug!("already up to date with upstream/{default_branch}");
            return Ok(());
        }

        let question = format!(
            "{} is {behind} commit(s) behind the template ({UPSTREAM_REMOTE}/{default_branch}). \
             Merge them into {branch} now?",
            repo.name
        );
        if !self.ui.confirm(&question).await {
            info!("template merge declined");
            return Ok(());
        }

        let target = format!("{UPSTREAM_REMOTE}/{default_branch}");
        self.runner
            .run(path, &["merge", "--no-edit", &target])
            .await
            .inspect_err(|e| {
                if e.git_kind() == Some(GitErrorKind::MergeConflict) {
                    warn!("template merge hit conflicts");
                }
            })?;
        run.report.updated = true;
        info!(behind, "merged {target}");

        match self.runner.run(path, &["push", "origin", "HEAD"]).await {
            Ok(_) => run.report.pushed = true,
            Err(e) => warn!(error = %e, "push to origin failed, merge kept locally"),
        }
        Ok(())
    }

    async fn fetch_upstream(&self, path: &Path, upstream_url: &str) -> Result<()> {
        let fetch = ["fetch", UPSTREAM_REMOTE];
        match self.runner.run(path, &fetch).await {
            Ok(_) => Ok(()),
            Err(e) if e.git_kind().is_some_and(GitErrorKind::is_credential_retryable) => {
                warn!(error = %e, "upstream fetch rejected, retrying with a fresh credential");
                let url = self.credentials.reauthenticated(upstream_url).await;
                self.runner
                    .run(path, &["remote", "set-url", UPSTREAM_REMOTE, &url])
                    .await?;
                self.runner.run(path, &fetch).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stash tracked and untracked changes under a unique marker.
    ///
    /// `Ok(None)` if git found nothing to save.
    async fn stash_local_changes(&self, path: &Path) -> Result<Option<StashHandle>> {
        let marker = format!("{STASH_MARKER_PREFIX}-{}", Uuid::new_v4());
        let out = self
            .runner
            .run(path, &["stash", "push", "--include-untracked", "-m", &marker])
            .await?;
        if out.stdout.contains("No local changes to save")
            || out.stderr.contains("No local changes to save")
        {
            return Ok(None);
        }

        match self.find_stash(path, &marker).await? {
            Some(reference) => {
                info!(%reference, "stashed local changes");
                Ok(Some(StashHandle { marker, reference }))
            }
            None => Err(Error::Other(format!(
                "stash entry '{marker}' not found after stashing"
            ))),
        }
    }

    async fn find_stash(&self, path: &Path, marker: &str) -> Result<Option<String>> {
        let out = self
            .runner
            .run(path, &["stash", "list", "--format=%gd %s"])
            .await?;
        Ok(out.stdout.lines().find_map(|line| {
            let (reference, subject) = line.split_once(' ')?;
            subject.contains(marker).then(|| reference.to_string())
        }))
    }

    async fn restore_stash(&self, path: &Path, handle: &StashHandle) -> Result<()> {
        let reference = self
            .find_stash(path, &handle.marker)
            .await?
            .ok_or_else(|| Error::Other(format!("stash entry '{}' disappeared", handle.marker)))?;
        self.runner.run(path, &["stash", "pop", &reference]).await?;
        info!(%reference, "restored local changes");
        Ok(())
    }

    async fn abort_merge(&self, path: &Path) {
        if self.probe().merge_in_progress(path) {
            if let Err(e) = self.runner.run(path, &["merge", "--abort"]).await {
                warn!(error = %e, "merge --abort failed");
            }
        }
    }

    async fn cleanup(&self, repo: &LocalRepository, run: &mut ForkRun) {
        let path = repo.path.as_path();

        if let Some(handle) = run.stash.take() {
            if let Err(e) = self.restore_stash(path, &handle).await {
                warn!(error = %e, "could not restore stash");
                self.ui
                    .warn(&format!(
                        "Your uncommitted changes in {} were saved but could not be restored \
                         automatically ({e}). Run `git stash pop {}` in {} to get them back.",
                        repo.name,
                        handle.reference,
                        path.display()
                    ))
                    .await;
                run.report.unrestored_stash = Some(handle.reference);
            }
        }

        if run.remote == Some(RemoteAddition::AddedByUs) {
            if let Err(e) = self
                .runner
                .run(path, &["remote", "remove", UPSTREAM_REMOTE])
                .await
            {
                warn!(error = %e, "could not remove the upstream remote");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{engine, repo_at};
    use super::*;
    use crate::testing::{RecordingUi, ScriptedRunner};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fork_repo(tmp: &TempDir) -> LocalRepository {
        let path = tmp.path().join("lab1");
        git2::Repository::init(&path).unwrap();
        LocalRepository {
            upstream_url: Some("https://git.example.edu/cs101/lab1.git".into()),
            ..repo_at(&path)
        }
    }

    /// Dirty tree, no upstream remote, template five commits ahead.
    fn behind_upstream() -> ScriptedRunner {
        ScriptedRunner::new()
            .ok("status --porcelain", "?? notes.txt\n?? scratch.c\n")
            .ok("branch --show-current", "main\n")
            .ok("remote", "origin\n")
            .ok("ls-remote --symref upstream HEAD", "ref: refs/heads/main\tHEAD\nabc\tHEAD\n")
            .ok("rev-list --count HEAD..upstream/main", "5\n")
    }

    fn position(calls: &[String], prefix: &str) -> usize {
        calls
            .iter()
            .position(|c| c.starts_with(prefix))
            .unwrap_or_else(|| panic!("no call starting with {prefix:?} in {calls:#?}"))
    }

    #[tokio::test]
    async fn test_dirty_fork_is_stashed_merged_pushed_and_restored() {
        let tmp = TempDir::new().unwrap();
        let repo = fork_repo(&tmp);
        let runner = Arc::new(behind_upstream());
        let ui = Arc::new(RecordingUi::answering(true));

        let report = engine(&runner, &ui).sync_with_upstream(&repo).await.unwrap();

        assert!(report.updated);
        assert!(report.pushed);
        assert_eq!(report.behind, 5);
        assert_eq!(report.unrestored_stash, None);
        assert!(ui.questions()[0].contains("5 commit(s)"));

        let calls = runner.calls();
        let stash = position(&calls, "stash push --include-untracked -m coursesync-autostash-");
        let add = position(&calls, "remote add upstream https://x-access-token:tok1@");
        let merge = position(&calls, "merge --no-edit upstream/main");
        let push = position(&calls, "push origin HEAD");
        let pop = position(&calls, "stash pop stash@{0}");
        let remove = position(&calls, "remote remove upstream");
        assert!(stash < add && add < merge && merge < push && push < pop && pop < remove);
    }

    #[tokio::test]
    async fn test_conflicts_abort_before_stash_or_merge() {
        let tmp = TempDir::new().unwrap();
        let repo = fork_repo(&tmp);
        let runner = Arc::new(ScriptedRunner::new().ok("status --porcelain", "UU main.c\n"));
        let ui = Arc::new(RecordingUi::answering(true));

        let err = engine(&runner, &ui).sync_with_upstream(&repo).await.unwrap_err();

        assert!(matches!(err, Error::ConflictsPresent { .. }));
        assert_eq!(ui.warnings().len(), 1);
        assert!(!runner.called("stash"));
        assert!(!runner.called("merge"));
        assert!(!runner.called("remote"));
    }

    #[tokio::test]
    async fn test_unfinished_merge_is_aborted_first() {
        let tmp = TempDir::new().unwrap();
        let repo = fork_repo(&tmp);
        std::fs::write(repo.path.join(".git/MERGE_HEAD"), "abc\n").unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .fail("merge --abort", 128, "fatal: There is no merge to abort")
                .ok("branch --show-current", "main\n")
                .ok("ls-remote", "ref: refs/heads/main\tHEAD\n")
                .ok("rev-list", "0\n"),
        );
        let ui = Arc::new(RecordingUi::answering(true));

        let report = engine(&runner, &ui).sync_with_upstream(&repo).await.unwrap();

        assert!(!report.updated);
        assert_eq!(runner.calls()[0], "merge --abort");
    }

    #[tokio::test]
    async fn test_up_to_date_skips_prompt_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let repo = fork_repo(&tmp);
        let runner = Arc::new(
            ScriptedRunner::new()
                .ok("branch --show-current", "main\n")
                .ok("remote", "origin\n")
                .ok("ls-remote", "ref: refs/heads/main\tHEAD\n")
                .ok("rev-list", "0\n"),
        );
        let ui = Arc::new(RecordingUi::answering(true));

        let report = engine(&runner, &ui).sync_with_upstream(&repo).await.unwrap();

        assert_eq!(report, ForkSyncReport::default());
        assert!(ui.questions().is_empty());
        assert!(!runner.called("stash"));
        assert!(runner.called("remote remove upstream"));
    }

    #[tokio::test]
    async fn test_declined_merge_restores_everything() {
        let tmp = TempDir::new().unwrap();
        let repo = fork_repo(&tmp);
        let runner = Arc::new(behind_upstream());
        let ui = Arc::new(RecordingUi::answering(false));

        let report = engine(&runner, &ui).sync_with_upstream(&repo).await.unwrap();

        assert!(!report.updated);
        assert!(!runner.called("merge"));
        assert!(runner.called("stash pop"));
        assert!(runner.called("remote remove upstream"));
    }

    #[tokio::test]
    async fn test_preexisting_upstream_is_kept() {
        let tmp = TempDir::new().unwrap();
        let repo = fork_repo(&tmp);
        let runner = Arc::new(
            ScriptedRunner::new()
                .ok("branch --show-current", "main\n")
                .ok("remote", "origin\nupstream\n")
                .ok("ls-remote", "ref: refs/heads/main\tHEAD\n")
                .ok("rev-list", "0\n"),
        );
        let ui = Arc::new(RecordingUi::answering(true));

        engine(&runner, &ui).sync_with_upstream(&repo).await.unwrap();

        assert!(runner.called("remote set-url upstream https://x-access-token:tok1@"));
        assert!(!runner.called("remote add"));
        assert!(!runner.called("remote remove"));
    }

    #[tokio::test]
    async fn test_merge_failure_aborts_and_still_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let repo = fork_repo(&tmp);
        let runner = Arc::new(behind_upstream().fail(
            "merge --no-edit",
            1,
            "CONFLICT (content): Merge conflict in main.c\nAutomatic merge failed; fix conflicts and then commit the result.",
        ));
        let ui = Arc::new(RecordingUi::answering(true));

        let err = engine(&runner, &ui).sync_with_upstream(&repo).await.unwrap_err();

        assert_eq!(err.git_kind(), Some(GitErrorKind::MergeConflict));
        assert!(!runner.called("push"));
        assert!(runner.called("stash pop"));
        assert!(runner.called("remote remove upstream"));
    }

    #[tokio::test]
    async fn test_push_failure_keeps_merge() {
        let tmp = TempDir::new().unwrap();
        let repo = fork_repo(&tmp);
        let runner = Arc::new(behind_upstream().fail("push", 1, "! [rejected] HEAD -> main (fetch first)"));
        let ui = Arc::new(RecordingUi::answering(true));

        let report = engine(&runner, &ui).sync_with_upstream(&repo).await.unwrap();

        assert!(report.updated);
        assert!(!report.pushed);
        assert!(runner.called("stash pop"));
    }

    #[tokio::test]
    async fn test_unresolved_default_branch_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let repo = fork_repo(&tmp);
        let runner = Arc::new(
            ScriptedRunner::new()
                .ok("branch --show-current", "main\n")
                .ok("remote", "origin\n")
                .fail("ls-remote", 128, "fatal: unable to access")
                .ok("branch -r", ""),
        );
        let ui = Arc::new(RecordingUi::answering(true));

        let err = engine(&runner, &ui).sync_with_upstream(&repo).await.unwrap_err();

        assert!(matches!(err, Error::UpstreamBranchUnresolved { .. }));
        assert!(runner.called("remote remove upstream"));
        assert!(ui.warnings().iter().any(|w| w.contains("default branch")));
    }

    #[tokio::test]
    async fn test_stash_failure_stops_before_touching_remotes() {
        let tmp = TempDir::new().unwrap();
        let repo = fork_repo(&tmp);
        let runner = Arc::new(behind_upstream().fail("stash push", 1, "error: could not write index"));
        let ui = Arc::new(RecordingUi::answering(true));

        let err = engine(&runner, &ui).sync_with_upstream(&repo).await.unwrap_err();

        assert!(matches!(err, Error::StashFailed { .. }));
        assert!(!runner.called("remote add"));
        assert!(!runner.called("merge"));
    }

    #[tokio::test]
    async fn test_failed_restore_is_reported_not_retried() {
        let tmp = TempDir::new().unwrap();
        let repo = fork_repo(&tmp);
        let runner = Arc::new(behind_upstream().fail(
            "stash pop",
            1,
            "notes.txt already exists, no checkout\nerror: could not restore untracked files from stash",
        ));
        let ui = Arc::new(RecordingUi::answering(true));

        let report = engine(&runner, &ui).sync_with_upstream(&repo).await.unwrap();

        assert_eq!(report.unrestored_stash.as_deref(), Some("stash@{0}"));
        assert_eq!(runner.count("stash pop"), 1);
        assert!(ui.warnings().iter().any(|w| w.contains("git stash pop stash@{0}")));
    }

    #[tokio::test]
    async fn test_missing_upstream_url() {
        let tmp = TempDir::new().unwrap();
        let repo = repo_at(tmp.path());
        let runner = Arc::new(ScriptedRunner::new());
        let ui = Arc::new(RecordingUi::answering(true));

        let err = engine(&runner, &ui).sync_with_upstream(&repo).await.unwrap_err();
        assert!(matches!(err, Error::NoUpstream { .. }));
        assert!(runner.calls().is_empty());
    }
}
