//! Build directory layout and lifecycle
//!
//! ```text
//! <builddir>/
//! ├── .lock                  held for the whole run
//! ├── .cache-saved/<repo>/   repository parked across a rebuild
//! ├── .needs-rebuild         tree must not be resumed
//! ├── .build-users           build accounts awaiting removal
//! ├── .stamps/               completed-work records for resume
//! ├── template/              adapted archiso profile
//! ├── repo/<repo>/           local repository
//! ├── built/<package>/       source builds awaiting the repository
//! ├── resources/             staged resources
//! ├── pacdb/                 build-time pacman database
//! ├── pacman.build.conf
//! ├── work/                  mkarchiso scratch
//! └── out/                   produced images
//! ```

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{ConfigurationError, FilesystemError};
use crate::infra::filesystem;
use crate::infra::lock::LOCK_FILENAME;

/// Files a usable template must contain
pub const TEMPLATE_REQUIRED: [&str; 3] = ["profiledef.sh", "packages.x86_64", "pacman.conf"];

/// Network mirror refresh that must not run on the live medium
const REFLECTOR_DROP_IN: &str = "airootfs/etc/systemd/system/reflector.service.d/archiso.conf";

const CACHE_SAVED: &str = ".cache-saved";
const NEEDS_REBUILD: &str = ".needs-rebuild";
const STAMPS: &str = ".stamps";
const BUILD_USERS: &str = ".build-users";

/// Entries that survive a rebuild wipe
const PRESERVED: [&str; 3] = [LOCK_FILENAME, CACHE_SAVED, BUILD_USERS];

/// State of the build directory, computed once per run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirState {
    /// Nothing to resume
    Fresh,
    /// A previous tree can be continued
    Resumed,
    /// A previous tree exists but must be rebuilt
    Invalid {
        /// Why it cannot be resumed
        reason: String,
    },
}

/// Paths and lifecycle of one build directory
#[derive(Debug, Clone)]
pub struct BuildDirectory {
    root: PathBuf,
    repo_name: String,
}

impl BuildDirectory {
    pub fn new(root: PathBuf, repo_name: &str) -> Self {
        Self {
            root,
            repo_name: repo_name.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn template_dir(&self) -> PathBuf {
        self.root.join("template")
    }

    /// Root filesystem overlay of the image
    pub fn airootfs(&self) -> PathBuf {
        self.template_dir().join("airootfs")
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.root.join("repo").join(&self.repo_name)
    }

    /// Source build output moved out of the build user's home
    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("built")
    }

    pub fn resources_dir(&self) -> PathBuf {
        self.root.join("resources")
    }

    pub fn pacdb_dir(&self) -> PathBuf {
        self.root.join("pacdb")
    }

    pub fn pacman_conf(&self) -> PathBuf {
        self.root.join("pacman.build.conf")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root.join("out")
    }

    /// Where the repository is parked across a rebuild
    pub fn saved_repo_dir(&self) -> PathBuf {
        self.root.join(CACHE_SAVED).join(&self.repo_name)
    }

    /// Accounts created for package builds and not yet removed
    pub fn build_user_record(&self) -> PathBuf {
        self.root.join(BUILD_USERS)
    }

    fn marker(&self) -> PathBuf {
        self.root.join(NEEDS_REBUILD)
    }

    fn stamp_path(&self, name: &str) -> PathBuf {
        self.root.join(STAMPS).join(name)
    }

    /// Classify the directory
    pub fn classify(&self) -> DirState {
        if !self.has_content() {
            return DirState::Fresh;
        }
        if let Ok(reason) = fs::read_to_string(self.marker()) {
            let reason = reason.trim();
            return DirState::Invalid {
                reason: if reason.is_empty() {
                    "a previous run left it incomplete".to_string()
                } else {
                    reason.to_string()
                },
            };
        }
        match validate_template(&self.template_dir()) {
            Ok(()) => DirState::Resumed,
            Err(e) => DirState::Invalid {
                reason: e.to_string(),
            },
        }
    }

    /// Whether anything besides preserved entries exists
    fn has_content(&self) -> bool {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .any(|e| !is_preserved(&e.file_name()))
            })
            .unwrap_or(false)
    }

    /// Remove everything except the lock and parked caches
    pub fn wipe(&self) -> Result<(), FilesystemError> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Ok(());
        };
        for entry in entries.filter_map(Result::ok) {
            if is_preserved(&entry.file_name()) {
                continue;
            }
            filesystem::remove_path(&entry.path())?;
        }
        tracing::info!("Cleared build directory {}", self.root.display());
        Ok(())
    }

    /// Create the directory skeleton
    pub fn create_layout(&self) -> Result<(), FilesystemError> {
        for dir in [
            self.root.clone(),
            self.repo_dir(),
            self.resources_dir(),
            self.pacdb_dir(),
            self.root.join(STAMPS),
        ] {
            filesystem::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Copy and adapt an archiso template
    pub fn install_template(&self, source: &Path) -> Result<(), ConfigurationError> {
        validate_template(source)?;
        let target = self.template_dir();
        let copy_err = |e: FilesystemError| ConfigurationError::InvalidTemplate {
            path: source.to_path_buf(),
            missing: e.to_string(),
        };

        if target.exists() {
            filesystem::remove_dir_all(&target).map_err(copy_err)?;
        }
        filesystem::copy_tree(source, &target).map_err(copy_err)?;

        let reflector = target.join(REFLECTOR_DROP_IN);
        if reflector.exists() {
            filesystem::remove_path(&reflector).map_err(copy_err)?;
            tracing::debug!("Removed {}", reflector.display());
        }
        tracing::info!("Copied template {}", source.display());
        Ok(())
    }

    /// Flag the tree as not resumable
    pub fn mark_needs_rebuild(&self, reason: &str) -> Result<(), FilesystemError> {
        filesystem::write_file(&self.marker(), &format!("{reason}\n"))
    }

    /// Content of a stamp, if recorded
    pub fn stamp(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.stamp_path(name)).ok()
    }

    /// Record a stamp
    pub fn write_stamp(&self, name: &str, content: &str) -> Result<(), FilesystemError> {
        filesystem::write_file_atomic(&self.stamp_path(name), content)
    }

    /// Record a stamp serialized as JSON
    pub fn write_json_stamp<T: Serialize>(&self, name: &str, value: &T) -> Result<(), FilesystemError> {
        let path = self.stamp_path(name);
        let content = serde_json::to_string(value).map_err(|e| FilesystemError::WriteFile {
            path: path.clone(),
            error: e.to_string(),
        })?;
        filesystem::write_file_atomic(&path, &content)
    }

    /// Stamp that tracks the repository index
    pub fn index_stamp(&self) -> PathBuf {
        self.stamp_path("repo-index")
    }

    /// Most recently modified image in `out/`
    pub fn latest_iso(&self) -> Option<PathBuf> {
        fs::read_dir(self.out_dir())
            .ok()?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "iso"))
            .max_by_key(|p| fs::metadata(p).and_then(|m| m.modified()).ok())
    }
}

fn is_preserved(name: &OsStr) -> bool {
    PRESERVED.iter().any(|p| name == *p)
}

/// Check the files archiso needs are present
pub fn validate_template(dir: &Path) -> Result<(), ConfigurationError> {
    if !dir.is_dir() {
        return Err(ConfigurationError::TemplateNotFound {
            path: dir.to_path_buf(),
        });
    }
    let missing: Vec<&str> = TEMPLATE_REQUIRED
        .iter()
        .copied()
        .filter(|f| !dir.join(f).is_file())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidTemplate {
            path: dir.to_path_buf(),
            missing: missing.join(", "),
        })
    }
}
