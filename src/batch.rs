//! Syncing many repositories in one run
//!
//! Repositories are processed one after another. A failure in one is recorded
//! and the batch moves on. Cancellation is only observed between repositories;
//! an in-flight clone or merge always runs to completion.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::sync::{LocalRepository, SyncAttempt, SyncEngine, SyncOutcome, UpstreamSync};

/// Everything that happened in one batch run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub attempts: Vec<SyncAttempt>,
    /// Repositories never started because the batch was cancelled
    pub skipped: Vec<String>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn failures(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| {
                a.outcome == SyncOutcome::Failed
                    || matches!(a.upstream, Some(UpstreamSync::Failed { .. }))
            })
            .count()
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failures() == 0
    }
}

/// Run [`SyncEngine::sync_repository`] over `repos` in order.
pub async fn sync_all(
    engine: &SyncEngine,
    repos: &[LocalRepository],
    cancel: &CancellationToken,
) -> BatchReport {
    let mut report = BatchReport::default();

    for (i, repo) in repos.iter().enumerate() {
        if cancel.is_cancelled() {
            info!(remaining = repos.len() - i, "batch cancelled");
            report.cancelled = true;
            report.skipped = repos[i..].iter().map(|r| r.name.clone()).collect();
            break;
        }
        info!(repo = %repo.name, "syncing {}/{}", i + 1, repos.len());
        report.attempts.push(engine.sync_repository(repo).await);
    }

    report
}
