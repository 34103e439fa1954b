//! Configuration file
//!
//! ```yaml
//! workspace_root: ~/courses/cs101
//! command_timeout_secs: 300
//! tokens:
//!   https://git.example.edu: COURSE_GIT_TOKEN
//! repositories:
//!   - name: lab1
//!     origin: https://git.example.edu/students/alice/lab1.git
//!     upstream: https://git.example.edu/cs101/lab1-template.git
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::naming::{checkout_paths, repo_name_from_url};
use crate::sync::LocalRepository;

fn default_git_binary() -> PathBuf {
    PathBuf::from("git")
}

fn default_timeout_secs() -> u64 {
    600
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory under which checkouts without an explicit path live
    pub workspace_root: PathBuf,

    #[serde(default = "default_git_binary")]
    pub git_binary: PathBuf,

    /// Per-subprocess deadline; 0 disables it
    #[serde(default = "default_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default)]
    pub shallow_clone: bool,

    /// Answer to every confirmation when running unattended
    #[serde(default)]
    pub assume_yes: bool,

    /// Host origin -> environment variable holding its token
    #[serde(default)]
    pub tokens: HashMap<String, String>,

    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

/// One repository entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Defaults to the last segment of `origin`
    #[serde(default)]
    pub name: Option<String>,
    pub origin: String,
    #[serde(default)]
    pub upstream: Option<String>,
    /// Absolute, or relative to `workspace_root`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl RepositoryConfig {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => repo_name_from_url(&self.origin),
        }
    }
}

impl SyncConfig {
    /// Load and validate a YAML config file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::io(path, e))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: SyncConfig = serde_yaml::from_str(content)?;
        config.workspace_root = expand_home(&config.workspace_root);
        config.validate()?;
        Ok(config)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }

    fn validate(&self) -> Result<()> {
        for (i, repo) in self.repositories.iter().enumerate() {
            if repo.origin.trim().is_empty() {
                return Err(Error::Config {
                    message: format!("repository #{} has an empty origin", i + 1),
                });
            }
            if repo.upstream.as_deref().is_some_and(|u| u.trim().is_empty()) {
                return Err(Error::Config {
                    message: format!("repository '{}' has an empty upstream", repo.display_name()),
                });
            }
        }

        let mut seen = HashSet::new();
        for repo in self.repositories() {
            if !seen.insert(repo.path.clone()) {
                return Err(Error::Config {
                    message: format!(
                        "more than one repository is configured at '{}'",
                        repo.path.display()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Resolve every entry into a [`LocalRepository`] with a concrete path.
    pub fn repositories(&self) -> Vec<LocalRepository> {
        let names: Vec<String> = self.repositories.iter().map(|r| r.display_name()).collect();
        let generated = checkout_paths(&self.workspace_root, names.iter().map(String::as_str));

        self.repositories
            .iter()
            .zip(names)
            .zip(generated)
            .map(|((repo, name), generated)| {
                let path = match &repo.path {
                    Some(p) if p.is_absolute() => p.clone(),
                    Some(p) => self.workspace_root.join(p),
                    None => generated,
                };
                LocalRepository {
                    name,
                    path,
                    origin_url: repo.origin.clone(),
                    upstream_url: repo.upstream.clone(),
                }
            })
            .collect()
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
