//! Recovery from a rewritten remote history
//!
//! When `pull --ff-only` finds that the remote no longer contains the local
//! history, the checkout is copied (minus `.git`) to a sibling backup, moved
//! aside, and re-cloned. If the clone fails the old checkout is moved back,
//! so `repo.path` ends up either a fresh clone or exactly what it was.

use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use super::{LocalRepository, SyncEngine};
use crate::error::{Error, Result};
use crate::naming::{backup_path, staging_path};

impl SyncEngine {
    /// Back up, replace with a fresh clone, and tell the user where the
    /// backup went. Returns the backup path if one was made.
    pub(crate) async fn recover_from_history_rewrite(
        &self,
        repo: &LocalRepository,
    ) -> Result<Option<PathBuf>> {
        self.ui
            .warn(&format!(
                "The history of {} changed on the server in a way that cannot be merged. \
                 This is unusual; please tell your instructor. Your files will be backed up \
                 and the repository downloaded again.",
                repo.name
            ))
            .await;

        let target = backup_path(&repo.path);
        let backup = match copy_without_metadata(&repo.path, &target).await {
            Ok(files) => {
                info!(files, backup = %target.display(), "backed up working tree");
                Some(target)
            }
            Err(e) => {
                error!(error = %e, "backup failed, continuing with recovery");
                None
            }
        };

        let staging = staging_path(&repo.path);
        tokio::fs::rename(&repo.path, &staging)
            .await
            .map_err(|e| Error::io(&repo.path, e))?;

        if let Err(e) = self.clone_with_auth_retry(repo).await {
            self.put_back(&staging, &repo.path).await;
            let err = Error::RecloneFailed {
                path: repo.path.clone(),
                backup: backup.clone(),
                source: Box::new(e),
            };
            self.ui.warn(&err.to_string()).await;
            return Err(err);
        }

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            warn!(error = %e, staging = %staging.display(), "could not remove replaced checkout");
        }

        match &backup {
            Some(path) => {
                let question = format!(
                    "{} was downloaded again. Your previous files are in {}. Open that folder?",
                    repo.name,
                    path.display()
                );
                if self.ui.confirm(&question).await {
                    self.ui.reveal(path).await;
                }
            }
            None => {
                self.ui
                    .inform(&format!(
                        "{} was downloaded again. No backup could be made of the previous files.",
                        repo.name
                    ))
                    .await;
            }
        }
        Ok(backup)
    }

    async fn put_back(&self, staging: &Path, path: &Path) {
        if path.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(path).await {
                error!(error = %e, "could not clear failed clone");
                return;
            }
        }
        if let Err(e) = tokio::fs::rename(staging, path).await {
            error!(
                error = %e,
                staging = %staging.display(),
                "could not move the previous checkout back"
            );
        }
    }
}

/// Copy `src` into a new directory `dst`, skipping `.git`. Returns the
/// number of files copied.
pub(crate) async fn copy_without_metadata(src: &Path, dst: &Path) -> Result<usize> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || copy_tree(&src, &dst)).await?
}

fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    std::fs::create_dir_all(dst).map_err(|e| Error::io(dst, e))?;
    let mut files = 0;

    for entry in WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
    {
        let entry = entry.map_err(|e| Error::Other(format!("walking {}: {e}", src.display())))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Other(e.to_string()))?;
        let dest = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest).map_err(|e| Error::io(&dest, e))?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            match std::fs::copy(entry.path(), &dest) {
                Ok(_) => files += 1,
                // Dangling symlinks have nothing to copy.
                Err(e) if entry.path_is_symlink() => {
                    warn!(path = %entry.path().display(), error = %e, "skipped symlink");
                }
                Err(e) => return Err(Error::io(entry.path(), e)),
            }
        }
    }
    Ok(files)
}
