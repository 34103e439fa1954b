//! coursesync - course repository synchronization
//!
//! Keeps per-user clones of course repositories in step with their
//! authenticated remotes, surviving force-pushed templates, diverged forks,
//! and dirty working trees without discarding anyone's work.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Batch Driver                             │
//! │            (one repository at a time, cancellable)              │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SyncEngine                              │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐  │
//! │  │  Clone/Update   │  │   Fork-Sync     │  │ History-Rewrite │  │
//! │  │  Coordinator    │─▶│   Coordinator   │  │    Recovery     │  │
//! │  └────────┬────────┘  └────────┬────────┘  └────────┬────────┘  │
//! │           │     per-path lock  │                    │           │
//! └───────────┼────────────────────┼────────────────────┼───────────┘
//!             │                    │                    │
//!             ▼                    ▼                    ▼
//! ┌──────────────────┐ ┌──────────────────────┐ ┌───────────────────┐
//! │  State Probe     │ │  Credential Cache    │ │  Naming Policy    │
//! │  (read-only)     │ │  + URL Builder       │ │  (dirs, backups)  │
//! └────────┬─────────┘ └──────────────────────┘ └───────────────────┘
//!          │
//!          ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                GitRunner (git subprocess, no prompts)           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Prompts and notifications go through [`UserInteraction`] so the engine
//! does not care whether it runs in a terminal or behind some other UI.

pub mod auth_url;
pub mod batch;
pub mod config;
pub mod credentials;
pub mod error;
pub mod git;
pub mod interaction;
pub mod naming;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{sync_all, BatchReport};
pub use config::SyncConfig;
pub use credentials::{CredentialSupplier, EnvTokenSupplier};
pub use error::{Error, GitErrorKind, Result};
pub use git::{GitRunner, ProcessRunner};
pub use interaction::{NonInteractive, TerminalInteraction, UserInteraction};
pub use sync::{
    ForkSyncReport, LocalRepository, SyncAttempt, SyncEngine, SyncOptions, SyncOutcome,
    UpstreamSync,
};

use std::sync::Arc;

impl SyncEngine {
    /// Build an engine wired to the system git binary as `config` describes.
    pub fn from_config(
        config: &SyncConfig,
        credentials: Arc<dyn CredentialSupplier>,
        ui: Arc<dyn UserInteraction>,
    ) -> Self {
        let runner = ProcessRunner::new(&config.git_binary).with_timeout(config.command_timeout());
        SyncEngine::new(Arc::new(runner), credentials, ui).with_options(SyncOptions {
            shallow_clone: config.shallow_clone,
        })
    }
}
