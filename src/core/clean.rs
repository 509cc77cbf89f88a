//! Build directory removal

use crate::core::builddir::BuildDirectory;
use crate::core::repository::LocalRepository;
use crate::error::{ConfigurationError, ErrorKind};
use crate::infra::filesystem;
use crate::infra::lock::BuildLock;

/// What [`clean`] did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanResult {
    /// Whether there was anything to remove
    pub removed: bool,
    /// Whether the repository was kept in `.cache-saved/`
    pub kept_cache: bool,
}

/// Remove the build directory, optionally parking the repository first
///
/// Refuses while another run holds the directory.
pub fn clean(dir: &BuildDirectory, keep_cache: bool) -> Result<CleanResult, ErrorKind> {
    let root = dir.root();
    if !root.exists() {
        return Ok(CleanResult::default());
    }
    let _lock = BuildLock::acquire(root, "archoffline clean").map_err(ConfigurationError::from)?;

    if keep_cache {
        let kept_cache = LocalRepository::save(&dir.repo_dir(), &dir.saved_repo_dir())?;
        dir.wipe()?;
        return Ok(CleanResult {
            removed: true,
            kept_cache,
        });
    }

    filesystem::remove_dir_all(root)?;
    tracing::info!("Removed {}", root.display());
    Ok(CleanResult {
        removed: true,
        kept_cache: false,
    })
}
