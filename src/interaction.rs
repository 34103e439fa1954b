//! User-facing prompts and notifications
//!
//! The engine only ever informs, warns, asks yes/no, or points at a path.
//! Front ends decide how those look.

use async_trait::async_trait;
use std::io::{self, BufRead, Write};
use std::path::Path;
use tokio::process::Command;
use tracing::{info, warn};

/// What the engine may ask of the person whose repositories it syncs.
#[async_trait]
pub trait UserInteraction: Send + Sync {
    async fn inform(&self, message: &str);
    async fn warn(&self, message: &str);
    async fn confirm(&self, message: &str) -> bool;
    async fn reveal(&self, path: &Path);
}

/// Prompts on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalInteraction;

#[async_trait]
impl UserInteraction for TerminalInteraction {
    async fn inform(&self, message: &str) {
        eprintln!("{message}");
    }

    async fn warn(&self, message: &str) {
        eprintln!("warning: {message}");
    }

    async fn confirm(&self, message: &str) -> bool {
        let prompt = format!("{message} [y/N] ");
        let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
            let mut stderr = io::stderr();
            stderr.write_all(prompt.as_bytes())?;
            stderr.flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }

    async fn reveal(&self, path: &Path) {
        let opener = if cfg!(target_os = "macos") {
            "open"
        } else if cfg!(target_os = "windows") {
            "explorer"
        } else {
            "xdg-open"
        };
        match Command::new(opener).arg(path).status().await {
            Ok(status) if status.success() => {}
            _ => eprintln!("{}", path.display()),
        }
    }
}

/// Answers every question the same way and logs instead of printing.
#[derive(Debug, Clone, Copy)]
pub struct NonInteractive {
    pub assume_yes: bool,
}

#[async_trait]
impl UserInteraction for NonInteractive {
    async fn inform(&self, message: &str) {
        info!("{message}");
    }

    async fn warn(&self, message: &str) {
        warn!("{message}");
    }

    async fn confirm(&self, message: &str) -> bool {
        info!(answer = self.assume_yes, "{message}");
        self.assume_yes
    }

    async fn reveal(&self, path: &Path) {
        info!(path = %path.display(), "see backup");
    }
}
