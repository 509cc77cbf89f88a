//! Git operations
//!
//! Clones repositories (version-controlled resources and the installer tool)
//! using the gix crate.

use gix::remote::fetch::Shallow;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Git operation errors
#[derive(Error, Debug)]
pub enum GitError {
    /// Failed to clone repository
    #[error("Failed to clone '{url}': {error}")]
    CloneFailed { url: String, error: String },

    /// Branch name is not a valid reference
    #[error("Invalid branch '{branch}': {error}")]
    InvalidBranch { branch: String, error: String },

    /// IO error
    #[error("IO error for '{path}': {error}")]
    IoError { path: PathBuf, error: String },
}

/// Result of a git clone operation
#[derive(Debug, Clone)]
pub struct CloneResult {
    /// Path to the cloned repository
    pub path: PathBuf,
    /// Commit checked out, when it could be resolved
    pub commit_sha: Option<String>,
}

/// Capability to clone repositories
pub trait RepoCloner: Send + Sync {
    /// Clone `url` into `dest`, checking out `branch` or the remote default
    fn clone_repo(
        &self,
        url: &str,
        branch: Option<&str>,
        dest: &Path,
    ) -> Result<CloneResult, GitError>;
}

/// Git repository operations backed by gix
#[derive(Debug, Default, Clone)]
pub struct GitOperations;

impl GitOperations {
    /// Create a new git operations handler
    pub fn new() -> Self {
        Self
    }
}

impl RepoCloner for GitOperations {
    fn clone_repo(
        &self,
        url: &str,
        branch: Option<&str>,
        dest: &Path,
    ) -> Result<CloneResult, GitError> {
        let clone_err = |e: &dyn std::fmt::Display| GitError::CloneFailed {
            url: url.to_string(),
            error: e.to_string(),
        };

        // Remove a leftover partial clone
        if dest.exists() {
            std::fs::remove_dir_all(dest).map_err(|e| GitError::IoError {
                path: dest.to_path_buf(),
                error: e.to_string(),
            })?;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GitError::IoError {
                path: parent.to_path_buf(),
                error: e.to_string(),
            })?;
        }

        let mut prepare = gix::prepare_clone(url, dest).map_err(|e| clone_err(&e))?;

        if let Some(branch) = branch {
            prepare = prepare
                .with_ref_name(Some(branch))
                .map_err(|e| GitError::InvalidBranch {
                    branch: branch.to_string(),
                    error: e.to_string(),
                })?;
        }

        // The ISO only needs the working tree
        prepare = prepare.with_shallow(Shallow::DepthAtRemote(NonZeroU32::MIN));

        let (mut checkout, _outcome) = prepare
            .fetch_then_checkout(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
            .map_err(|e| clone_err(&e))?;

        let (repo, _outcome) = checkout
            .main_worktree(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
            .map_err(|e| clone_err(&e))?;

        let commit_sha = repo.head_id().ok().map(|id| id.to_hex().to_string());
        tracing::debug!(
            "Cloned {url} at {}",
            commit_sha.as_deref().unwrap_or("unknown commit")
        );

        Ok(CloneResult {
            path: dest.to_path_buf(),
            commit_sha,
        })
    }
}

/// Directory name a repository URL clones into (`.../name.git` -> `name`)
pub fn repo_dir_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next().unwrap_or(trimmed);
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        "repository".to_string()
    } else {
        name.to_string()
    }
}
