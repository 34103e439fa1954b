//! Git backend for coursesync
//!
//! Every git invocation in the crate goes through a [`GitRunner`]. The
//! production runner, [`ProcessRunner`], shells out to the system `git`
//! binary; tests substitute a scripted fake.
//!
//! # Process Model
//!
//! 1. **No prompts**: runners must never let git ask for credentials on a
//!    terminal. A missing or rejected token surfaces as an error.
//! 2. **Captured output**: stdout and stderr are returned as strings; a
//!    non-zero exit becomes a classified
//!    [`GitCommandError`](crate::error::GitCommandError).
//! 3. **Read-only probing**: [`Probe`] answers questions about a checkout
//!    without touching the working tree.

use async_trait::async_trait;
use std::path::Path;

mod probe;
mod process;

pub use probe::{CheckoutState, Probe, UPSTREAM_REMOTE};
pub use process::ProcessRunner;

/// Captured output of a successful git invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

/// The capability to run a git subcommand in a working directory.
///
/// Implementations return [`crate::Error::Git`] when git exits unsuccessfully.
#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn run(&self, cwd: &Path, args: &[&str]) -> crate::Result<GitOutput>;
}
