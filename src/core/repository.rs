//! Local package repository
//!
//! A directory of package files plus a `repo-add` index. Adding artifacts
//! marks the index stale; [`LocalRepository::finalize`] regenerates it in a
//! scratch directory and renames the result into place, so readers only
//! ever see a complete index.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{FilesystemError, RepositoryAssemblyError};
use crate::infra::download::compute_checksum;
use crate::infra::filesystem;
use crate::infra::process::{CommandRunner, CommandSpec};

/// Binary package files produced for one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArtifact {
    /// Name of the spec that produced the files
    pub package: String,
    /// Package files
    pub files: Vec<PathBuf>,
}

/// Parts of a package file name: `name-pkgver-pkgrel-arch.pkg.tar.*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFileName {
    pub name: String,
    pub version: String,
    pub arch: String,
}

impl PackageFileName {
    /// Parse a package file name; `None` for anything else
    pub fn parse(file_name: &str) -> Option<Self> {
        if !is_package_file(file_name) {
            return None;
        }
        let stem = &file_name[..file_name.find(".pkg.tar")?];
        let mut parts = stem.rsplitn(4, '-');
        let arch = parts.next()?;
        let rel = parts.next()?;
        let ver = parts.next()?;
        let name = parts.next()?;
        if name.is_empty() || ver.is_empty() || rel.is_empty() || arch.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            version: format!("{ver}-{rel}"),
            arch: arch.to_string(),
        })
    }
}

/// Package archives, not signatures or partial downloads
pub fn is_package_file(file_name: &str) -> bool {
    file_name.contains(".pkg.tar")
        && !file_name.ends_with(".sig")
        && !file_name.ends_with(".part")
        && !file_name.starts_with('.')
}

/// Outcome of [`LocalRepository::finalize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// The index was rebuilt
    Regenerated,
    /// Nothing changed since the last index
    UpToDate,
}

/// A named package directory with its index
pub struct LocalRepository {
    name: String,
    dir: PathBuf,
    index_stamp: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl LocalRepository {
    /// Open (creating if needed) the repository at `dir`
    ///
    /// `index_stamp` records the package set the current index describes.
    pub fn open(
        name: &str,
        dir: PathBuf,
        index_stamp: PathBuf,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, RepositoryAssemblyError> {
        filesystem::create_dir_all(&dir).map_err(io_error)?;
        Ok(Self {
            name: name.to_string(),
            dir,
            index_stamp,
            runner,
        })
    }

    /// Repository name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Repository directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Index archive path (`<name>.db.tar.gz`)
    pub fn index_path(&self) -> PathBuf {
        self.dir.join(format!("{}.db.tar.gz", self.name))
    }

    /// Copy an artifact in, replacing other versions of the same packages
    pub fn add(&mut self, artifact: &BuiltArtifact) -> Result<(), RepositoryAssemblyError> {
        for file in &artifact.files {
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| RepositoryAssemblyError::Io {
                    path: file.clone(),
                    error: "not a file".to_string(),
                })?;

            if let Some(parsed) = PackageFileName::parse(&file_name) {
                self.remove_other_versions(&parsed.name, &file_name)?;
            }

            let dest = self.dir.join(&file_name);
            if file.as_path() != dest.as_path() {
                filesystem::copy_file(file, &dest).map_err(io_error)?;
            }
            tracing::debug!("Added {file_name} to [{}]", self.name);
        }
        self.mark_stale()
    }

    fn remove_other_versions(
        &self,
        package: &str,
        keep: &str,
    ) -> Result<(), RepositoryAssemblyError> {
        for existing in self.packages()? {
            let Some(file_name) = existing.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            let same_package =
                PackageFileName::parse(&file_name).is_some_and(|p| p.name == package);
            if same_package && file_name != keep {
                tracing::debug!("Replacing {file_name}");
                filesystem::remove_path(&existing).map_err(io_error)?;
                let signature = self.dir.join(format!("{file_name}.sig"));
                if signature.exists() {
                    filesystem::remove_path(&signature).map_err(io_error)?;
                }
            }
        }
        Ok(())
    }

    /// Package files currently present, sorted by name
    pub fn packages(&self) -> Result<Vec<PathBuf>, RepositoryAssemblyError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| RepositoryAssemblyError::Io {
            path: self.dir.clone(),
            error: e.to_string(),
        })?;
        let mut packages: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| is_package_file(&n.to_string_lossy()))
            })
            .collect();
        packages.sort();
        Ok(packages)
    }

    /// Invalidate the index
    pub fn mark_stale(&self) -> Result<(), RepositoryAssemblyError> {
        if self.index_stamp.exists() {
            filesystem::remove_path(&self.index_stamp).map_err(io_error)?;
        }
        Ok(())
    }

    /// Fingerprint of the package set (names and sizes)
    fn package_digest(&self, packages: &[PathBuf]) -> String {
        let listing: String = packages
            .iter()
            .map(|p| {
                let size = fs::metadata(p).map(|m| m.len()).unwrap_or(0);
                format!("{}\t{size}\n", p.file_name().unwrap_or_default().to_string_lossy())
            })
            .collect();
        compute_checksum(listing.as_bytes())
    }

    /// Whether the index describes exactly the present packages
    pub fn is_current(&self) -> Result<bool, RepositoryAssemblyError> {
        let digest = self.package_digest(&self.packages()?);
        let recorded = fs::read_to_string(&self.index_stamp).unwrap_or_default();
        Ok(recorded.trim() == digest && self.index_path().is_file())
    }

    /// Regenerate the index over all present packages
    pub fn finalize(&mut self) -> Result<IndexState, RepositoryAssemblyError> {
        let packages = self.packages()?;
        if packages.is_empty() {
            return Err(RepositoryAssemblyError::Empty {
                path: self.dir.clone(),
            });
        }

        let digest = self.package_digest(&packages);
        if self.is_current()? {
            tracing::debug!("Index of [{}] is up to date", self.name);
            return Ok(IndexState::UpToDate);
        }

        tracing::info!(
            "Indexing {} package(s) into [{}]",
            packages.len(),
            self.name
        );

        let scratch = self
            .dir
            .with_file_name(format!(".{}.index", self.name));
        if scratch.exists() {
            filesystem::remove_dir_all(&scratch).map_err(io_error)?;
        }
        filesystem::create_dir_all(&scratch).map_err(io_error)?;

        let db = format!("{}.db.tar.gz", self.name);
        let files = format!("{}.files.tar.gz", self.name);

        let output = self
            .runner
            .run(
                &CommandSpec::new("repo-add")
                    .arg("--quiet")
                    .arg(scratch.join(&db))
                    .args(packages.iter().map(|p| p.as_os_str().to_os_string()))
                    .capture(),
            )
            .map_err(|e| RepositoryAssemblyError::IndexFailed {
                status: "not started".to_string(),
                output: e.to_string(),
            })?;
        if !output.success() || !scratch.join(&db).is_file() {
            let _ = filesystem::remove_dir_all(&scratch);
            return Err(RepositoryAssemblyError::IndexFailed {
                status: output.status_text(),
                output: output.combined(),
            });
        }

        // Archives first, then the names pacman reads
        for archive in [&db, &files] {
            let built = scratch.join(archive);
            if built.is_file() {
                filesystem::rename(&built, &self.dir.join(archive)).map_err(io_error)?;
            }
        }
        for (link, target) in [
            (format!("{}.db", self.name), &db),
            (format!("{}.files", self.name), &files),
        ] {
            if self.dir.join(target).is_file() {
                replace_symlink(&self.dir, &link, target)?;
            }
        }
        filesystem::remove_dir_all(&scratch).map_err(io_error)?;

        filesystem::write_file_atomic(&self.index_stamp, &digest).map_err(io_error)?;
        Ok(IndexState::Regenerated)
    }

    /// Move the repository to `saved` so it survives a wipe
    pub fn save(dir: &Path, saved: &Path) -> Result<bool, RepositoryAssemblyError> {
        if !dir.is_dir() {
            return Ok(false);
        }
        if saved.exists() {
            merge_into(dir, saved)?;
            filesystem::remove_dir_all(dir).map_err(io_error)?;
        } else {
            filesystem::move_path(dir, saved).map_err(io_error)?;
        }
        tracing::info!("Saved repository cache to {}", saved.display());
        Ok(true)
    }

    /// Move a saved repository back; files already in `dir` win
    pub fn restore(saved: &Path, dir: &Path) -> Result<bool, RepositoryAssemblyError> {
        if !saved.is_dir() {
            return Ok(false);
        }
        if dir.exists() {
            merge_into(saved, dir)?;
            filesystem::remove_dir_all(saved).map_err(io_error)?;
        } else {
            filesystem::move_path(saved, dir).map_err(io_error)?;
        }
        tracing::info!("Restored repository cache into {}", dir.display());
        Ok(true)
    }
}

/// Move files from `from` into `to`, keeping files already in `to`
fn merge_into(from: &Path, to: &Path) -> Result<(), RepositoryAssemblyError> {
    filesystem::create_dir_all(to).map_err(io_error)?;
    let entries = fs::read_dir(from).map_err(|e| RepositoryAssemblyError::Io {
        path: from.to_path_buf(),
        error: e.to_string(),
    })?;
    for entry in entries.filter_map(Result::ok) {
        let target = to.join(entry.file_name());
        if !target.exists() && entry.path().is_file() {
            filesystem::move_path(&entry.path(), &target).map_err(io_error)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn replace_symlink(dir: &Path, link: &str, target: &str) -> Result<(), RepositoryAssemblyError> {
    let staged = dir.join(format!(".{link}.link"));
    let _ = fs::remove_file(&staged);
    std::os::unix::fs::symlink(target, &staged).map_err(|e| RepositoryAssemblyError::Io {
        path: staged.clone(),
        error: e.to_string(),
    })?;
    filesystem::rename(&staged, &dir.join(link)).map_err(io_error)
}

#[cfg(not(unix))]
fn replace_symlink(dir: &Path, link: &str, target: &str) -> Result<(), RepositoryAssemblyError> {
    filesystem::copy_file(&dir.join(target), &dir.join(link)).map_err(io_error)
}

fn io_error(e: FilesystemError) -> RepositoryAssemblyError {
    let path = match &e {
        FilesystemError::CreateDir { path, .. }
        | FilesystemError::RemoveDir { path, .. }
        | FilesystemError::WriteFile { path, .. }
        | FilesystemError::ReadFile { path, .. } => path.clone(),
        FilesystemError::Copy { to, .. } | FilesystemError::Rename { to, .. } => to.clone(),
    };
    RepositoryAssemblyError::Io {
        path,
        error: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fakes::{output, ScriptedRunner};
    use crate::test_utils::generators::{package_arch, package_name, package_version};
    use proptest::prelude::*;
    use tempfile::TempDir;

    /// `repo-add` stand-in writing the sorted package names into the db
    fn repo_add_runner() -> ScriptedRunner {
        ScriptedRunner::new().on("repo-add", |spec| {
            let args = spec.arg_strings();
            let db = PathBuf::from(&args[1]);
            let listing: Vec<String> = args[2..]
                .iter()
                .map(|p| Path::new(p).file_name().unwrap().to_string_lossy().into_owned())
                .collect();
            std::fs::write(&db, listing.join("\n")).unwrap();
            let files = db.with_file_name(
                db.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .replace(".db.", ".files."),
            );
            std::fs::write(files, listing.join("\n")).unwrap();
            output(0, "")
        })
    }

    fn package(dir: &Path, file_name: &str, content: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(file_name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn open(temp: &TempDir, runner: Arc<ScriptedRunner>) -> LocalRepository {
        LocalRepository::open(
            "localrepo",
            temp.path().join("repo/localrepo"),
            temp.path().join(".stamps/index"),
            runner,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_package_file_name() {
        let parsed = PackageFileName::parse("python-foo-bar-1.2.3-2-any.pkg.tar.zst").unwrap();
        assert_eq!(parsed.name, "python-foo-bar");
        assert_eq!(parsed.version, "1.2.3-2");
        assert_eq!(parsed.arch, "any");

        assert!(PackageFileName::parse("nano-8.0-1-x86_64.pkg.tar.zst.sig").is_none());
        assert!(PackageFileName::parse("localrepo.db.tar.gz").is_none());
        assert!(PackageFileName::parse("broken.pkg.tar.zst").is_none());
    }

    #[test]
    fn test_add_replaces_older_version() {
        let temp = TempDir::new().unwrap();
        let mut repo = open(&temp, Arc::new(repo_add_runner()));
        let incoming = temp.path().join("incoming");

        let old = package(repo.dir(), "yay-12.0-1-x86_64.pkg.tar.zst", "old");
        package(repo.dir(), "yay-12.0-1-x86_64.pkg.tar.zst.sig", "sig");
        package(repo.dir(), "yay-bin-11.0-1-x86_64.pkg.tar.zst", "other");

        repo.add(&BuiltArtifact {
            package: "yay".to_string(),
            files: vec![package(&incoming, "yay-12.1-1-x86_64.pkg.tar.zst", "new")],
        })
        .unwrap();

        assert!(!old.exists());
        assert!(!repo.dir().join("yay-12.0-1-x86_64.pkg.tar.zst.sig").exists());
        let names: Vec<String> = repo
            .packages()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["yay-12.1-1-x86_64.pkg.tar.zst", "yay-bin-11.0-1-x86_64.pkg.tar.zst"]
        );
    }

    #[test]
    fn test_finalize_publishes_index_and_links() {
        let temp = TempDir::new().unwrap();
        let mut repo = open(&temp, Arc::new(repo_add_runner()));
        package(repo.dir(), "nano-8.0-1-x86_64.pkg.tar.zst", "nano");

        assert_eq!(repo.finalize().unwrap(), IndexState::Regenerated);

        let db_link = repo.dir().join("localrepo.db");
        assert!(repo.index_path().is_file());
        assert_eq!(
            std::fs::read_link(&db_link).unwrap(),
            PathBuf::from("localrepo.db.tar.gz")
        );
        assert!(repo.dir().join("localrepo.files").exists());
        assert!(!temp.path().join("repo/.localrepo.index").exists());
    }

    #[test]
    fn test_finalize_twice_is_byte_identical() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(repo_add_runner());
        let mut repo = open(&temp, runner.clone());
        package(repo.dir(), "nano-8.0-1-x86_64.pkg.tar.zst", "nano");
        package(repo.dir(), "wget-1.24-1-x86_64.pkg.tar.zst", "wget");

        repo.finalize().unwrap();
        let first = std::fs::read(repo.index_path()).unwrap();
        assert_eq!(repo.finalize().unwrap(), IndexState::UpToDate);
        let second = std::fs::read(repo.index_path()).unwrap();

        assert_eq!(first, second);
        assert_eq!(runner.invocations("repo-add").len(), 1);
    }

    #[test]
    fn test_add_after_finalize_forces_regeneration() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(repo_add_runner());
        let mut repo = open(&temp, runner.clone());
        package(repo.dir(), "nano-8.0-1-x86_64.pkg.tar.zst", "nano");
        repo.finalize().unwrap();

        repo.add(&BuiltArtifact {
            package: "yay".to_string(),
            files: vec![package(
                &temp.path().join("in"),
                "yay-12.1-1-x86_64.pkg.tar.zst",
                "yay",
            )],
        })
        .unwrap();
        assert!(!repo.is_current().unwrap());
        assert_eq!(repo.finalize().unwrap(), IndexState::Regenerated);

        let index = std::fs::read_to_string(repo.index_path()).unwrap();
        assert!(index.contains("yay-12.1-1-x86_64.pkg.tar.zst"));
        assert_eq!(runner.invocations("repo-add").len(), 2);
    }

    #[test]
    fn test_failed_index_keeps_previous() {
        let temp = TempDir::new().unwrap();
        let mut repo = open(&temp, Arc::new(repo_add_runner()));
        package(repo.dir(), "nano-8.0-1-x86_64.pkg.tar.zst", "nano");
        repo.finalize().unwrap();
        let before = std::fs::read(repo.index_path()).unwrap();

        package(repo.dir(), "vim-9.1-1-x86_64.pkg.tar.zst", "vim");
        let mut failing = LocalRepository::open(
            "localrepo",
            repo.dir().to_path_buf(),
            temp.path().join(".stamps/index"),
            Arc::new(ScriptedRunner::new().on("repo-add", |_| output(1, "bad package"))),
        )
        .unwrap();

        assert!(matches!(
            failing.finalize(),
            Err(RepositoryAssemblyError::IndexFailed { .. })
        ));
        assert_eq!(std::fs::read(repo.index_path()).unwrap(), before);
    }

    #[test]
    fn test_empty_repository_rejected() {
        let temp = TempDir::new().unwrap();
        let mut repo = open(&temp, Arc::new(repo_add_runner()));
        assert!(matches!(
            repo.finalize(),
            Err(RepositoryAssemblyError::Empty { .. })
        ));
    }

    #[test]
    fn test_save_and_restore_merge() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("repo/localrepo");
        let saved = temp.path().join(".cache-saved/localrepo");
        package(&dir, "nano-8.0-1-x86_64.pkg.tar.zst", "nano");

        assert!(LocalRepository::save(&dir, &saved).unwrap());
        assert!(!dir.exists());
        assert!(saved.join("nano-8.0-1-x86_64.pkg.tar.zst").is_file());

        package(&dir, "wget-1.24-1-x86_64.pkg.tar.zst", "wget");
        assert!(LocalRepository::restore(&saved, &dir).unwrap());
        assert!(dir.join("nano-8.0-1-x86_64.pkg.tar.zst").is_file());
        assert!(dir.join("wget-1.24-1-x86_64.pkg.tar.zst").is_file());
        assert!(!saved.exists());

        assert!(!LocalRepository::restore(&saved, &dir).unwrap());
    }

    proptest! {
        #[test]
        fn prop_package_file_name_parses(
            name in package_name(),
            version in package_version(),
            arch in package_arch(),
        ) {
            let file = format!("{name}-{version}-{arch}.pkg.tar.zst");
            let parsed = PackageFileName::parse(&file).unwrap();
            prop_assert_eq!(parsed.name, name);
            prop_assert_eq!(parsed.version, version);
            prop_assert_eq!(parsed.arch, arch);
        }
    }
}
