//! [`GitRunner`] backed by [`tokio::process::Command`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{GitOutput, GitRunner};
use crate::auth_url::redact;
use crate::error::{Error, GitCommandError, Result};

/// Runs the system `git` binary with prompting disabled.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    binary: PathBuf,
    timeout: Option<Duration>,
    env_vars: Vec<(String, String)>,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new("git")
    }
}

impl ProcessRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: None,
            env_vars: Vec::new(),
        }
    }

    /// Kill any invocation that runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Extra environment passed to every invocation.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    fn command(&self, cwd: &Path, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).current_dir(cwd);

        // Fail instead of prompting, and keep messages in a locale the
        // classifier understands.
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .env("GCM_INTERACTIVE", "never")
            .env("LC_ALL", "C")
            .env("LANG", "C");
        if std::env::var_os("GIT_SSH_COMMAND").is_none() {
            cmd.env("GIT_SSH_COMMAND", "ssh -o BatchMode=yes");
        }
        for (k, v) in &self.env_vars {
            cmd.env(k, v);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl GitRunner for ProcessRunner {
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput> {
        debug!(
            cwd = %cwd.display(),
            args = %redact(&args.join(" ")),
            "spawning git"
        );

        let output = self.command(cwd, args).output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, output).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(args = %redact(&args.join(" ")), "git timed out after {limit:?}");
                    return Err(GitCommandError::timed_out(args, limit).into());
                }
            },
            None => output.await,
        }
        .map_err(|source| Error::Spawn {
            program: self.binary.display().to_string(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let err = GitCommandError::new(args, output.status.code(), &stdout, &stderr);
            debug!(kind = ?err.kind, status = %output.status, "git failed");
            return Err(err.into());
        }

        Ok(GitOutput { stdout, stderr })
    }
}
