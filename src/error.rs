//! Error types for archoffline
//!
//! Domain-specific error types using thiserror. Components raise their own
//! typed errors; only the pipeline decides what is fatal and wraps them in
//! [`PipelineError`] together with the stage that failed.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::pipeline::Stage;

/// Bad or contradictory input. Never retried.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// A configuration field has an unusable value
    #[error("Invalid value for '{field}': {message}")]
    InvalidField { field: String, message: String },

    /// Config file could not be read or parsed
    #[error("Failed to load config file '{path}': {error}")]
    ConfigFile { path: PathBuf, error: String },

    /// No mirror specification was given
    #[error("A mirror specification is required (region, 'copy', https://... or file://...)")]
    MissingMirror,

    /// Mirror specification matches none of the supported forms
    #[error("Unrecognized mirror specification '{spec}'")]
    UnrecognizedMirror { spec: String },

    /// Region keyword is not a known mirror country
    #[error("Unknown mirror region '{region}'")]
    UnknownRegion { region: String },

    /// Region is known but has no usable HTTPS mirrors
    #[error("No active HTTPS mirrors found for region '{region}'")]
    NoMirrors { region: String },

    /// Mirror status list could not be retrieved
    #[error("Failed to retrieve mirror status: {error}")]
    MirrorStatus { error: String },

    /// Local mirror path does not exist
    #[error("Local mirror path does not exist: {path}")]
    MirrorPathMissing { path: PathBuf },

    /// Local mirror path has no package database
    #[error("Local mirror path contains no package index: {path}")]
    MirrorPathNoIndex { path: PathBuf },

    /// System mirror list has no usable server line
    #[error("System mirror list '{path}' has no active Server entries")]
    EmptyMirrorlist { path: PathBuf },

    /// Image template directory was not found
    #[error("Image template not found: {path}")]
    TemplateNotFound { path: PathBuf },

    /// Image template misses a required file
    #[error("Image template at '{path}' is missing '{missing}'")]
    InvalidTemplate { path: PathBuf, missing: String },

    /// Build directory cannot be resumed
    #[error("Build directory '{path}' cannot be resumed ({reason}). Re-run with --rebuild")]
    NeedsRebuild { path: PathBuf, reason: String },

    /// Another run holds the build directory
    #[error("{0}")]
    Locked(#[from] LockError),

    /// The build must run as root
    #[error("This tool requires root permission (running as uid {uid})")]
    NotRoot { uid: String },
}

/// Build directory lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Lock is held by another process with readable metadata
    #[error(
        "Build directory is locked by another run: {command} (PID {pid}, started {started_at_unix})\n\
         If no other archoffline process is running, remove the lock file:\n  {lock_path}"
    )]
    Contention {
        command: String,
        pid: u32,
        started_at_unix: u64,
        lock_path: PathBuf,
    },

    /// Lock is held but its metadata is unreadable
    #[error(
        "Build directory is locked (could not read lock metadata)\n\
         If no other archoffline process is running, remove the lock file:\n  {lock_path}"
    )]
    ContentionUnknown { lock_path: PathBuf },

    /// Lock file could not be opened or written
    #[error("Failed to lock '{lock_path}': {error}")]
    Io { lock_path: PathBuf, error: String },
}

/// A single resource could not be staged
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceFetchError {
    /// Resource is neither a URL nor an existing path
    #[error("Resource '{resource}' is not a recognized URL or path")]
    Unrecognized { resource: String },

    /// Download failed
    #[error("Could not download '{resource}': {error}")]
    Download { resource: String, error: String },

    /// Repository clone failed
    #[error("Could not clone '{resource}': {error}")]
    Clone { resource: String, error: String },

    /// Local copy failed
    #[error("Could not copy '{resource}': {error}")]
    Copy { resource: String, error: String },

    /// Operator aborted after failures
    #[error("Resource staging aborted after {} failure(s): {}", .failed.len(), .failed.join(", "))]
    Aborted { failed: Vec<String> },
}

/// Requested package names could not be resolved
#[derive(Error, Debug)]
pub enum ValidationError {
    /// AUR packages unknown to the AUR
    #[error("Unknown AUR package(s): {}", .names.join(", "))]
    UnknownAurPackages { names: Vec<String> },

    /// The AUR could not be queried
    #[error("Failed to query the AUR: {error}")]
    AurLookup { error: String },
}

/// A source package could not be built
#[derive(Error, Debug)]
pub enum PackageBuildError {
    /// Build recipe could not be fetched
    #[error("Could not fetch build recipe for '{package}': {error}")]
    Recipe { package: String, error: String },

    /// Build command failed
    #[error("Building '{package}' failed ({status}){}", tail_suffix(.output))]
    Build {
        package: String,
        status: String,
        output: String,
    },

    /// Build succeeded but produced no package files
    #[error("Building '{package}' produced no package files")]
    NoArtifacts { package: String },

    /// Build workspace could not be prepared or cleaned
    #[error("Build workspace error for '{package}': {error}")]
    Workspace { package: String, error: String },
}

/// The local repository could not be assembled
#[derive(Error, Debug)]
pub enum RepositoryAssemblyError {
    /// Filesystem operation on the repository failed
    #[error("Repository I/O error for '{path}': {error}")]
    Io { path: PathBuf, error: String },

    /// Index generation tool failed
    #[error("Index generation failed ({status}){}", tail_suffix(.output))]
    IndexFailed { status: String, output: String },

    /// Repository has no packages to index
    #[error("Repository '{path}' contains no packages")]
    Empty { path: PathBuf },
}

/// An external tool returned a failure
#[derive(Error, Debug)]
pub enum ToolInvocationError {
    /// Tool could not be started
    #[error("Failed to run '{tool}': {error}")]
    Spawn { tool: String, error: String },

    /// Tool exited unsuccessfully
    #[error("'{tool}' failed ({status}){}", tail_suffix(.output))]
    Failed {
        tool: String,
        status: String,
        output: String,
    },
}

/// Cleanup of privileged state failed
#[derive(Error, Debug)]
#[error("Teardown of build user '{user}' incomplete: {}", .steps.join("; "))]
pub struct TeardownError {
    /// Build user being torn down
    pub user: String,
    /// Failed teardown steps
    pub steps: Vec<String>,
}

/// Download errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DownloadError {
    /// Network error
    #[error("Network error downloading '{url}': {error}")]
    NetworkError { url: String, error: String },

    /// IO error
    #[error("IO error for '{path}': {error}")]
    IoError { path: PathBuf, error: String },

    /// Max retries exceeded
    #[error("Download failed after {retries} retries: {url}")]
    MaxRetriesExceeded { url: String, retries: u32 },
}

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// Failed to create directory
    #[error("Failed to create directory '{path}': {error}")]
    CreateDir { path: PathBuf, error: String },

    /// Failed to remove directory
    #[error("Failed to remove directory '{path}': {error}")]
    RemoveDir { path: PathBuf, error: String },

    /// Failed to write file
    #[error("Failed to write file '{path}': {error}")]
    WriteFile { path: PathBuf, error: String },

    /// Failed to read file
    #[error("Failed to read file '{path}': {error}")]
    ReadFile { path: PathBuf, error: String },

    /// Failed to copy a file or tree
    #[error("Failed to copy '{from}' to '{to}': {error}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        error: String,
    },

    /// Failed to move a file or tree
    #[error("Failed to move '{from}' to '{to}': {error}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        error: String,
    },
}

/// Kind of a pipeline failure
#[derive(Error, Debug)]
pub enum ErrorKind {
    /// Configuration error
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Resource fetch error
    #[error(transparent)]
    ResourceFetch(#[from] ResourceFetchError),

    /// Validation error
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Package build error
    #[error(transparent)]
    PackageBuild(#[from] PackageBuildError),

    /// Repository assembly error
    #[error(transparent)]
    RepositoryAssembly(#[from] RepositoryAssemblyError),

    /// Tool invocation error
    #[error(transparent)]
    ToolInvocation(#[from] ToolInvocationError),

    /// Teardown error
    #[error(transparent)]
    Teardown(#[from] TeardownError),

    /// Filesystem error
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    /// Run was interrupted
    #[error("Interrupted")]
    Interrupted,
}

/// Top-level archoffline error: what failed, and where
#[derive(Error, Debug)]
#[error("{stage} failed: {kind}{}", teardown_suffix(.teardown.as_ref()))]
pub struct PipelineError {
    /// Stage the failure originated in
    pub stage: Stage,
    /// Underlying cause
    pub kind: ErrorKind,
    /// Teardown failure observed while surfacing `kind`
    pub teardown: Option<TeardownError>,
}

impl PipelineError {
    /// Create an error for a stage
    pub fn new(stage: Stage, kind: impl Into<ErrorKind>) -> Self {
        Self {
            stage,
            kind: kind.into(),
            teardown: None,
        }
    }

    /// Attach a teardown failure without masking the original cause
    #[must_use]
    pub fn with_teardown(mut self, teardown: Option<TeardownError>) -> Self {
        if teardown.is_some() {
            self.teardown = teardown;
        }
        self
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match &self.kind {
            ErrorKind::Configuration(_) => exit_codes::CONFIGURATION,
            ErrorKind::Validation(_) => exit_codes::VALIDATION,
            ErrorKind::PackageBuild(_) => exit_codes::PACKAGE_BUILD,
            ErrorKind::ToolInvocation(_) => exit_codes::TOOL_INVOCATION,
            ErrorKind::RepositoryAssembly(_) => exit_codes::REPOSITORY_ASSEMBLY,
            ErrorKind::ResourceFetch(_) => exit_codes::RESOURCE_FETCH,
            ErrorKind::Teardown(_) => exit_codes::TEARDOWN,
            ErrorKind::Interrupted => exit_codes::INTERRUPTED,
            ErrorKind::Filesystem(_) => exit_codes::GENERIC,
        }
    }
}

/// Process exit codes
pub mod exit_codes {
    /// Success
    pub const SUCCESS: i32 = 0;
    /// Unclassified failure
    pub const GENERIC: i32 = 1;
    /// Bad or contradictory input
    pub const CONFIGURATION: i32 = 2;
    /// Unresolvable package names
    pub const VALIDATION: i32 = 3;
    /// A source package failed to build
    pub const PACKAGE_BUILD: i32 = 4;
    /// An external tool failed
    pub const TOOL_INVOCATION: i32 = 5;
    /// The repository index could not be generated
    pub const REPOSITORY_ASSEMBLY: i32 = 6;
    /// Resource staging was aborted
    pub const RESOURCE_FETCH: i32 = 7;
    /// Privileged cleanup did not complete
    pub const TEARDOWN: i32 = 8;
    /// Interrupted by the operator
    pub const INTERRUPTED: i32 = 130;
}

fn teardown_suffix(teardown: Option<&TeardownError>) -> String {
    teardown.map(|t| format!(" (additionally: {t})")).unwrap_or_default()
}

/// Last lines of captured tool output, for error messages
fn tail_suffix(output: &str) -> String {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return String::new();
    }
    let start = lines.len().saturating_sub(5);
    format!(":\n  {}", lines[start..].join("\n  "))
}
