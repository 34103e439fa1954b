//! Fakes for the engine's external collaborators.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::credentials::CredentialSupplier;
use crate::error::{GitCommandError, Result};
use crate::git::{GitOutput, GitRunner};
use crate::interaction::UserInteraction;

enum Reply {
    Ok(String),
    Fail(i32, String),
    TimedOut,
}

struct Rule {
    prefix: String,
    reply: Reply,
    once: bool,
    used: bool,
}

/// A [`GitRunner`] that answers from a script and records every call.
///
/// Rules match on the space-joined argument list by prefix; the first unused
/// matching rule wins. Unmatched calls succeed with empty output, except
/// `stash push/list/pop`, which emulate a one-entry stash so generated
/// markers round-trip.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    stash: Mutex<Option<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(self, prefix: &str, reply: Reply, once: bool) -> Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            reply,
            once,
            used: false,
        });
        self
    }

    pub fn ok(self, prefix: &str, stdout: &str) -> Self {
        self.rule(prefix, Reply::Ok(stdout.to_string()), false)
    }

    pub fn ok_once(self, prefix: &str, stdout: &str) -> Self {
        self.rule(prefix, Reply::Ok(stdout.to_string()), true)
    }

    pub fn fail(self, prefix: &str, code: i32, stderr: &str) -> Self {
        self.rule(prefix, Reply::Fail(code, stderr.to_string()), false)
    }

    pub fn fail_once(self, prefix: &str, code: i32, stderr: &str) -> Self {
        self.rule(prefix, Reply::Fail(code, stderr.to_string()), true)
    }

    /// The first matching call runs past its deadline.
    pub fn time_out_once(self, prefix: &str) -> Self {
        self.rule(prefix, Reply::TimedOut, true)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn emulate_stash(&self, args: &[&str]) -> GitOutput {
        let mut stash = self.stash.lock().unwrap();
        let stdout = match args.get(1).copied() {
            Some("push") => {
                let marker = args
                    .iter()
                    .position(|a| *a == "-m")
                    .and_then(|i| args.get(i + 1))
                    .map(|m| m.to_string())
                    .unwrap_or_default();
                *stash = Some(marker.clone());
                format!("Saved working directory and index state On main: {marker}\n")
            }
            Some("list") => stash
                .as_ref()
                .map(|m| format!("stash@{{0}} On main: {m}\n"))
                .unwrap_or_default(),
            Some("pop") => {
                *stash = None;
                String::new()
            }
            _ => String::new(),
        };
        GitOutput {
            stdout,
            stderr: String::new(),
        }
    }
}

#[async_trait]
impl GitRunner for ScriptedRunner {
    async fn run(&self, _cwd: &Path, args: &[&str]) -> Result<GitOutput> {
        let joined = args.join(" ");
        self.calls.lock().unwrap().push(joined.clone());

        let reply = {
            let mut rules = self.rules.lock().unwrap();
            rules
                .iter_mut()
                .find(|r| !(r.once && r.used) && joined.starts_with(&r.prefix))
                .map(|r| {
                    r.used = true;
                    match &r.reply {
                        Reply::Ok(out) => Ok(out.clone()),
                        Reply::Fail(code, err) => Err(Some((*code, err.clone()))),
                        Reply::TimedOut => Err(None),
                    }
                })
        };

        match reply {
            Some(Ok(stdout)) => Ok(GitOutput {
                stdout,
                stderr: String::new(),
            }),
            Some(Err(Some((code, stderr)))) => {
                Err(GitCommandError::new(args, Some(code), "", &stderr).into())
            }
            Some(Err(None)) => {
                Err(GitCommandError::timed_out(args, Duration::from_secs(600)).into())
            }
            None if args.first() == Some(&"stash") => Ok(self.emulate_stash(args)),
            None => Ok(GitOutput::default()),
        }
    }
}

/// A [`UserInteraction`] that records everything shown to the user.
pub(crate) struct RecordingUi {
    answer: bool,
    pub infos: Mutex<Vec<String>>,
    pub warnings: Mutex<Vec<String>>,
    pub questions: Mutex<Vec<String>>,
    pub revealed: Mutex<Vec<PathBuf>>,
}

impl RecordingUi {
    pub fn answering(answer: bool) -> Self {
        Self {
            answer,
            infos: Mutex::default(),
            warnings: Mutex::default(),
            questions: Mutex::default(),
            revealed: Mutex::default(),
        }
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().unwrap().clone()
    }
}

#[async_trait]
impl UserInteraction for RecordingUi {
    async fn inform(&self, message: &str) {
        self.infos.lock().unwrap().push(message.to_string());
    }

    async fn warn(&self, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }

    async fn confirm(&self, message: &str) -> bool {
        self.questions.lock().unwrap().push(message.to_string());
        self.answer
    }

    async fn reveal(&self, path: &Path) {
        self.revealed.lock().unwrap().push(path.to_path_buf());
    }
}

/// Hands out tokens in order; each invalidation moves to the next one.
#[derive(Default)]
pub(crate) struct RotatingTokens {
    tokens: Mutex<Vec<String>>,
    pub resolved: Mutex<Vec<String>>,
    pub invalidated: Mutex<Vec<String>>,
}

impl RotatingTokens {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: Mutex::new(tokens.iter().map(|t| t.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn invalidations(&self) -> usize {
        self.invalidated.lock().unwrap().len()
    }
}

#[async_trait]
impl CredentialSupplier for RotatingTokens {
    async fn resolve_token(&self, host_origin: &str) -> Option<String> {
        self.resolved.lock().unwrap().push(host_origin.to_string());
        self.tokens.lock().unwrap().first().cloned()
    }

    async fn invalidate(&self, host_origin: &str) {
        self.invalidated.lock().unwrap().push(host_origin.to_string());
        let mut tokens = self.tokens.lock().unwrap();
        if !tokens.is_empty() {
            tokens.remove(0);
        }
    }
}
