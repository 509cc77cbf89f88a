//! Resource fetching
//!
//! Stages operator resources (downloads, git repositories, local files)
//! into `<builddir>/resources/` under stable names. Failures are collected
//! per resource; whether a failure is retried, skipped or aborts the run is
//! decided by a [`Prompt`].

use std::collections::HashSet;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::error::ResourceFetchError;
use crate::infra::download::{compute_checksum, file_checksum, Fetch};
use crate::infra::filesystem;
use crate::infra::git::{repo_dir_name, RepoCloner};

/// How a resource is retrieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    /// Version-controlled repository (`….git`, `git://`)
    Git(String),
    /// Network download
    Http(String),
    /// File or directory on the host
    Local(PathBuf),
}

impl ResourceKind {
    /// Classify a descriptor
    pub fn classify(descriptor: &str) -> Result<Self, ResourceFetchError> {
        let d = descriptor.trim();
        let lower = d.to_ascii_lowercase();
        let is_remote = lower.contains("://") || lower.starts_with("git@");

        if lower.starts_with("git://")
            || (is_remote && lower.trim_end_matches('/').ends_with(".git"))
        {
            return Ok(Self::Git(d.to_string()));
        }
        if lower.starts_with("https://") || lower.starts_with("http://") {
            return Ok(Self::Http(d.to_string()));
        }
        if !is_remote && !d.is_empty() && Path::new(d).exists() {
            return Ok(Self::Local(PathBuf::from(d)));
        }
        Err(ResourceFetchError::Unrecognized {
            resource: descriptor.to_string(),
        })
    }

    /// Name the resource is staged under
    pub fn staged_name(&self) -> String {
        match self {
            Self::Git(url) => repo_dir_name(url),
            Self::Http(url) => {
                let path = url.split(['?', '#']).next().unwrap_or(url);
                let rest = path
                    .split_once("://")
                    .map_or(path, |(_, rest)| rest)
                    .trim_end_matches('/');
                // Host only, or a segment that is not a file name
                match rest.split_once('/').and_then(|(_, p)| p.rsplit('/').next()) {
                    Some(last) if !matches!(last, "" | "." | "..") => last.to_string(),
                    _ => format!("resource-{}", &compute_checksum(url.as_bytes())[..12]),
                }
            }
            Self::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "resource".to_string()),
        }
    }
}

/// Decision after a resource failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry,
    Skip,
    Abort,
}

/// Decides what happens to a failed resource
pub trait Prompt: Send + Sync {
    fn on_failure(&self, error: &ResourceFetchError) -> FailureAction;
}

/// Never prompts: every failure is skipped
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentPolicy;

impl Prompt for SilentPolicy {
    fn on_failure(&self, _error: &ResourceFetchError) -> FailureAction {
        FailureAction::Skip
    }
}

/// Asks on the terminal; skips when stdin is not interactive
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn on_failure(&self, error: &ResourceFetchError) -> FailureAction {
        if !io::stdin().is_terminal() {
            return FailureAction::Skip;
        }

        eprintln!();
        eprintln!("⚠️  {error}");
        loop {
            eprint!("   [r]etry, [s]kip or [a]bort? ");
            let _ = io::stderr().flush();

            let mut input = String::new();
            if io::stdin().read_line(&mut input).unwrap_or(0) == 0 {
                return FailureAction::Skip;
            }
            match input.trim().to_lowercase().as_str() {
                "r" | "retry" => return FailureAction::Retry,
                "s" | "skip" => return FailureAction::Skip,
                "a" | "abort" => return FailureAction::Abort,
                _ => {}
            }
        }
    }
}

/// A resource present in the staging area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedResource {
    /// Descriptor as configured
    pub descriptor: String,
    /// Location under the staging directory
    pub path: PathBuf,
    /// Whether this run had to fetch it
    pub fetched: bool,
}

/// Outcome of a batch
#[derive(Debug, Default)]
pub struct FetchReport {
    /// Staged resources, in configuration order
    pub staged: Vec<StagedResource>,
    /// Skipped failures
    pub failed: Vec<ResourceFetchError>,
}

/// Fetches resources into a staging directory
pub struct ResourceFetcher<'a> {
    fetch: &'a dyn Fetch,
    cloner: Arc<dyn RepoCloner>,
    staging: PathBuf,
}

impl<'a> ResourceFetcher<'a> {
    /// Create a fetcher staging into `staging`
    pub fn new(fetch: &'a dyn Fetch, cloner: Arc<dyn RepoCloner>, staging: PathBuf) -> Self {
        Self {
            fetch,
            cloner,
            staging,
        }
    }

    /// Stage every descriptor; only an explicit abort fails the batch
    pub async fn fetch_all(
        &self,
        descriptors: &[String],
        prompt: &dyn Prompt,
    ) -> Result<FetchReport, ResourceFetchError> {
        let mut report = FetchReport::default();
        let mut names = HashSet::new();

        for descriptor in descriptors {
            let kind = match ResourceKind::classify(descriptor) {
                Ok(kind) => kind,
                Err(e) => {
                    self.handle_failure(e, prompt, &mut report, false)?;
                    continue;
                }
            };
            let name = unique_name(kind.staged_name(), &mut names);
            let dest = self.staging.join(&name);

            loop {
                match self.stage(&kind, descriptor, &dest).await {
                    Ok(fetched) => {
                        report.staged.push(StagedResource {
                            descriptor: descriptor.clone(),
                            path: dest.clone(),
                            fetched,
                        });
                        break;
                    }
                    Err(e) => {
                        if self.handle_failure(e, prompt, &mut report, true)? {
                            continue;
                        }
                        break;
                    }
                }
            }
        }

        if !report.failed.is_empty() {
            tracing::warn!(
                "{} resource(s) skipped: {}",
                report.failed.len(),
                report
                    .failed
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ")
            );
        }
        Ok(report)
    }

    /// Returns whether to retry
    fn handle_failure(
        &self,
        error: ResourceFetchError,
        prompt: &dyn Prompt,
        report: &mut FetchReport,
        retryable: bool,
    ) -> Result<bool, ResourceFetchError> {
        match prompt.on_failure(&error) {
            FailureAction::Retry if retryable => {
                tracing::info!("Retrying: {error}");
                Ok(true)
            }
            FailureAction::Abort => {
                report.failed.push(error);
                Err(ResourceFetchError::Aborted {
                    failed: report.failed.iter().map(ToString::to_string).collect(),
                })
            }
            _ => {
                report.failed.push(error);
                Ok(false)
            }
        }
    }

    /// Stage one resource; returns whether anything was fetched
    async fn stage(
        &self,
        kind: &ResourceKind,
        descriptor: &str,
        dest: &Path,
    ) -> Result<bool, ResourceFetchError> {
        match kind {
            ResourceKind::Http(url) => {
                if dest.is_file() {
                    tracing::debug!("Resource {} already staged", dest.display());
                    return Ok(false);
                }
                let partial = partial_path(dest);
                let download_err = |e: &dyn std::fmt::Display| ResourceFetchError::Download {
                    resource: descriptor.to_string(),
                    error: e.to_string(),
                };
                self.fetch
                    .download(url, &partial)
                    .await
                    .map_err(|e| download_err(&e))?;
                filesystem::rename(&partial, dest).map_err(|e| download_err(&e))?;
                tracing::info!("Downloaded {url}");
                Ok(true)
            }
            ResourceKind::Git(url) => {
                if dest.join(".git").exists() {
                    tracing::debug!("Repository {} already staged", dest.display());
                    return Ok(false);
                }
                let cloner = Arc::clone(&self.cloner);
                let (url, target) = (url.clone(), dest.to_path_buf());
                let clone_err = |error: String| ResourceFetchError::Clone {
                    resource: descriptor.to_string(),
                    error,
                };
                tokio::task::spawn_blocking(move || cloner.clone_repo(&url, None, &target))
                    .await
                    .map_err(|e| clone_err(e.to_string()))?
                    .map_err(|e| clone_err(e.to_string()))?;
                tracing::info!("Cloned {descriptor}");
                Ok(true)
            }
            ResourceKind::Local(source) => {
                let copy_err = |e: &dyn std::fmt::Display| ResourceFetchError::Copy {
                    resource: descriptor.to_string(),
                    error: e.to_string(),
                };
                if source.is_dir() {
                    if dest.is_dir() {
                        if same_tree(source, dest) {
                            tracing::debug!("Resource {} unchanged", dest.display());
                            return Ok(false);
                        }
                        filesystem::remove_dir_all(dest).map_err(|e| copy_err(&e))?;
                    }
                    filesystem::copy_tree(source, dest).map_err(|e| copy_err(&e))?;
                } else {
                    if dest.is_file() && same_content(source, dest) {
                        tracing::debug!("Resource {} unchanged", dest.display());
                        return Ok(false);
                    }
                    filesystem::copy_file(source, dest).map_err(|e| copy_err(&e))?;
                }
                tracing::info!("Copied {}", source.display());
                Ok(true)
            }
        }
    }
}

/// Relative path and content fingerprint of every entry below `root`
fn tree_fingerprint(root: &Path) -> Option<Vec<(PathBuf, String)>> {
    WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| {
            let entry = entry.ok()?;
            let relative = entry.path().strip_prefix(root).ok()?.to_path_buf();
            let file_type = entry.file_type();
            let print = if file_type.is_dir() {
                "dir".to_string()
            } else if file_type.is_symlink() {
                format!("link:{}", std::fs::read_link(entry.path()).ok()?.display())
            } else {
                file_checksum(entry.path()).ok()?
            };
            Some((relative, print))
        })
        .collect()
}

fn same_tree(a: &Path, b: &Path) -> bool {
    match (tree_fingerprint(a), tree_fingerprint(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn same_content(a: &Path, b: &Path) -> bool {
    match (file_checksum(a), file_checksum(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}.part"))
}

/// Disambiguate colliding staged names (`name`, `name-2`, …)
fn unique_name(name: String, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.clone()) {
        return name;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{name}-{n}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}
