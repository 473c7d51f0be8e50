//! Input checks for values that end up on disk or on a command line.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{DeployError, DeployResult};

static DIRECTORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));
static BRANCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9/_.-]+$").expect("valid regex"));
static SCP_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9.-]+:[^\s]+$").expect("valid regex"));
static ENV_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

const MAX_DIRECTORY_LEN: usize = 50;
const MAX_BRANCH_LEN: usize = 100;

pub fn validate_directory(directory: &str) -> DeployResult<()> {
    if directory.len() > MAX_DIRECTORY_LEN || !DIRECTORY_RE.is_match(directory) {
        return Err(DeployError::InvalidInput(format!(
            "directory '{}' must match [A-Za-z0-9_-]+ and be at most {} characters",
            directory, MAX_DIRECTORY_LEN
        )));
    }
    Ok(())
}

pub fn validate_branch(branch: &str) -> DeployResult<()> {
    let ok = branch.len() <= MAX_BRANCH_LEN
        && BRANCH_RE.is_match(branch)
        && !branch.starts_with('.')
        && !branch.ends_with('.')
        && !branch.starts_with('-')
        && !branch.contains("..");
    if !ok {
        return Err(DeployError::InvalidInput(format!("invalid branch name '{}'", branch)));
    }
    Ok(())
}

pub fn validate_repository_url(url: &str) -> DeployResult<()> {
    let url = url.trim();
    let has_scheme = ["https://", "http://", "ssh://", "git://", "file://"]
        .iter()
        .any(|scheme| url.starts_with(scheme) && url.len() > scheme.len());
    let ok = !url.starts_with('-')
        && !url.chars().any(char::is_whitespace)
        && (has_scheme || SCP_URL_RE.is_match(url));
    if !ok {
        return Err(DeployError::InvalidInput(format!("invalid repository URL '{}'", url)));
    }
    Ok(())
}

/// Keys are embedded as identifiers in generated source, so they are held
/// to identifier syntax.
pub fn is_valid_env_key(key: &str) -> bool {
    ENV_KEY_RE.is_match(key)
}
