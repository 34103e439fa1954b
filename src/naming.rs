//! Directory and backup naming
//!
//! Checkout directories are derived from repository names, backups and
//! staging directories from the checkout they belong to. Every name is a
//! pure function of its input plus what already exists on disk, so re-running
//! a sync lands on the same paths and never overwrites an earlier backup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Maximum length of a generated directory name
pub const MAX_DIR_NAME_LENGTH: usize = 255;

/// Names the filesystem refuses or treats specially on some platform
const RESERVED_NAMES: &[&str] = &[
    ".", "..", "con", "prn", "aux", "nul",
    "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8", "com9",
    "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

const FALLBACK_NAME: &str = "repository";

/// Turn an arbitrary repository name into a safe directory name.
///
/// Rules:
/// - Only alphanumeric, dot, underscore, and hyphen survive
/// - Runs of anything else become a single hyphen
/// - Cannot start with a dot, hyphen, or underscore
/// - Reserved names get a `-repo` suffix
pub fn sanitize_dir_name(input: &str) -> String {
    let mut result = String::with_capacity(input.len());

    for c in input.chars() {
        if c.is_ascii_alphanumeric() || ((c == '_' || c == '-' || c == '.') && !result.is_empty()) {
            result.push(c);
        } else if !result.is_empty() && !result.ends_with('-') {
            result.push('-');
        }
    }

    let mut result = result.trim_end_matches(['-', '.']).to_string();
    result.truncate(MAX_DIR_NAME_LENGTH);

    if result.is_empty() {
        return FALLBACK_NAME.to_string();
    }
    let base = result.split('.').next().unwrap_or(&result).to_lowercase();
    if RESERVED_NAMES.contains(&base.as_str()) {
        result.push_str("-repo");
    }
    result
}

/// The repository name implied by a clone URL: its last path segment
/// without a trailing `.git`.
pub fn repo_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    let last = last.strip_suffix(".git").unwrap_or(last);
    sanitize_dir_name(last)
}

/// Assign each name a distinct checkout directory under `root`.
///
/// The first repository to claim a directory name keeps it; later ones get
/// `-2`, `-3`, ... in input order.
pub fn checkout_paths<'a>(root: &Path, names: impl IntoIterator<Item = &'a str>) -> Vec<PathBuf> {
    let mut taken = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            let base = sanitize_dir_name(name);
            let mut candidate = base.clone();
            let mut n = 2;
            while !taken.insert(candidate.to_lowercase()) {
                candidate = format!("{base}-{n}");
                n += 1;
            }
            root.join(candidate)
        })
        .collect()
}

/// First free sibling `<name>-backup`, `<name>-backup-2`, ...
pub fn backup_path(repo_path: &Path) -> PathBuf {
    free_sibling(repo_path, "", "-backup")
}

/// First free hidden sibling used to hold a checkout while it is replaced.
pub fn staging_path(repo_path: &Path) -> PathBuf {
    free_sibling(repo_path, ".", ".recovering")
}

fn free_sibling(repo_path: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let parent = repo_path.parent().unwrap_or_else(|| Path::new("."));
    let name = repo_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| FALLBACK_NAME.to_string());

    let first = parent.join(format!("{prefix}{name}{suffix}"));
    if !first.exists() {
        return first;
    }
    (2u32..)
        .map(|n| parent.join(format!("{prefix}{name}{suffix}-{n}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}
