//! Image tree customization
//!
//! Injects the local repository, staged resources, the optional installer
//! clone, the customization hook and the autorun directive into the
//! archiso profile. Every step rewrites its target from scratch, so running
//! it again on a resumed tree leaves the same result.

use std::path::{Path, PathBuf};

use crate::config::defaults;
use crate::core::builddir::BuildDirectory;
use crate::core::config::BuildConfig;
use crate::core::resources::StagedResource;
use crate::error::{ErrorKind, FilesystemError, ResourceFetchError};
use crate::infra::filesystem;
use crate::infra::git::RepoCloner;

const AUTORUN_BEGIN: &str = "# >>> archoffline autorun >>>";
const AUTORUN_END: &str = "# <<< archoffline autorun <<<";

/// Hook archiso runs inside the image before it is packed
const CUSTOMIZE_HOOK: &str = "root/customize_airootfs.sh";

/// Point a pacman.conf at the embedded repository only
///
/// Official repository sections and any previous section for `repo` are
/// dropped; a `[repo]` section served from `/root/<repo>/` is appended.
pub fn rewrite_pacman_conf(content: &str, repo: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut skipping = false;

    for line in content.lines() {
        if let Some(section) = section_name(line.trim()) {
            skipping = section == repo
                || defaults::STRIPPED_REPOS
                    .iter()
                    .any(|r| section.eq_ignore_ascii_case(r));
        }
        if !skipping {
            kept.push(line.trim_end());
        }
    }
    while kept.last().is_some_and(|l| l.is_empty()) {
        kept.pop();
    }

    let mut result = kept.join("\n");
    if !result.is_empty() {
        result.push_str("\n\n");
    }
    result.push_str(&format!(
        "[{repo}]\nSigLevel = Optional TrustAll\nServer = file:///root/{repo}/\n"
    ));
    result
}

fn section_name(line: &str) -> Option<&str> {
    line.strip_prefix('[')?.strip_suffix(']')
}

/// Replace the autorun block of a shell profile
///
/// The command only starts on the first virtual terminal without a display.
pub fn apply_autorun(profile: &str, command: Option<&str>) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut inside = false;
    for line in profile.lines() {
        match line.trim() {
            AUTORUN_BEGIN => inside = true,
            AUTORUN_END => inside = false,
            _ if !inside => lines.push(line),
            _ => {}
        }
    }
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    let mut result = lines.join("\n");
    if !result.is_empty() {
        result.push('\n');
    }
    if let Some(command) = command {
        if !result.is_empty() {
            result.push('\n');
        }
        let quoted = command.replace('\'', r"'\''");
        result.push_str(&format!(
            "{AUTORUN_BEGIN}\n[[ -z $DISPLAY && $XDG_VTNR -eq 1 ]] && sh -c '{quoted}'\n{AUTORUN_END}\n"
        ));
    }
    result
}

/// Applies the build configuration to the profile tree
pub struct Customizer<'a> {
    config: &'a BuildConfig,
    dir: &'a BuildDirectory,
    cloner: &'a dyn RepoCloner,
}

impl<'a> Customizer<'a> {
    pub fn new(config: &'a BuildConfig, dir: &'a BuildDirectory, cloner: &'a dyn RepoCloner) -> Self {
        Self {
            config,
            dir,
            cloner,
        }
    }

    /// Run every customization step
    pub fn apply(&self, resources: &[StagedResource]) -> Result<(), ErrorKind> {
        self.install_pacman_conf()?;
        self.stage_repository()?;
        self.stage_resources(resources)?;
        self.install_installer()?;
        self.install_customize_hook()?;
        self.install_autorun()?;
        Ok(())
    }

    fn root_dir(&self) -> PathBuf {
        self.dir.airootfs().join("root")
    }

    fn install_pacman_conf(&self) -> Result<(), FilesystemError> {
        let template_conf = self.dir.template_dir().join("pacman.conf");
        let rewritten = rewrite_pacman_conf(
            &filesystem::read_file(&template_conf)?,
            &self.config.repo_name,
        );
        filesystem::write_file_atomic(&template_conf, &rewritten)?;
        filesystem::write_file_atomic(&self.dir.airootfs().join("etc/pacman.conf"), &rewritten)?;
        tracing::debug!("Image pacman.conf points at [{}]", self.config.repo_name);
        Ok(())
    }

    fn stage_repository(&self) -> Result<(), FilesystemError> {
        let target = self.root_dir().join(&self.config.repo_name);
        filesystem::remove_path(&target)?;
        link_tree(&self.dir.repo_dir(), &target)?;
        tracing::info!("Embedded repository [{}]", self.config.repo_name);
        Ok(())
    }

    fn stage_resources(&self, resources: &[StagedResource]) -> Result<(), FilesystemError> {
        let target = self.root_dir().join("resources");
        filesystem::remove_path(&target)?;
        if resources.is_empty() {
            return Ok(());
        }
        for resource in resources {
            let Some(name) = resource.path.file_name() else {
                continue;
            };
            if resource.path.is_dir() {
                link_tree(&resource.path, &target.join(name))?;
            } else {
                filesystem::link_or_copy(&resource.path, &target.join(name))?;
            }
        }
        tracing::info!("Embedded {} resource(s)", resources.len());
        Ok(())
    }

    fn install_installer(&self) -> Result<(), ErrorKind> {
        let Some(installer) = &self.config.installer else {
            return Ok(());
        };
        let clone_dir = self.root_dir().join(defaults::INSTALLER_DIR);

        if clone_dir.join(".git").exists() {
            tracing::debug!("Installer already cloned at {}", clone_dir.display());
        } else {
            tracing::info!("Cloning {} ({})", installer.url, installer.branch);
            self.cloner
                .clone_repo(&installer.url, Some(&installer.branch), &clone_dir)
                .map_err(|e| ResourceFetchError::Clone {
                    resource: installer.url.clone(),
                    error: e.to_string(),
                })?;
        }

        let profile_dir = clone_dir.join(defaults::INSTALLER_PROFILE_DIR);
        for profile in &self.config.profiles {
            let Some(name) = profile.file_name().filter(|_| profile.is_file()) else {
                tracing::warn!("Profile {} does not exist, skipping", profile.display());
                continue;
            };
            filesystem::copy_file(profile, &profile_dir.join(name))?;
            tracing::info!("Added installer profile {}", profile.display());
        }
        Ok(())
    }

    fn install_customize_hook(&self) -> Result<(), FilesystemError> {
        let hook = self.dir.airootfs().join(CUSTOMIZE_HOOK);
        match &self.config.customize_script {
            Some(script) => {
                filesystem::copy_file(script, &hook)?;
                filesystem::make_executable(&hook)?;
                tracing::info!("Installed customization script {}", script.display());
            }
            None => filesystem::remove_path(&hook)?,
        }
        Ok(())
    }

    fn install_autorun(&self) -> Result<(), FilesystemError> {
        let profile = self.root_dir().join(".zprofile");
        let current = std::fs::read_to_string(&profile).unwrap_or_default();
        let updated = apply_autorun(&current, self.config.autorun.as_deref());

        if updated.is_empty() && !profile.exists() {
            return Ok(());
        }
        if updated != current {
            filesystem::write_file_atomic(&profile, &updated)?;
        }
        Ok(())
    }
}

/// Recreate a tree with hard links (copies across filesystems)
fn link_tree(from: &Path, to: &Path) -> Result<(), FilesystemError> {
    filesystem::create_dir_all(to)?;
    for entry in walkdir::WalkDir::new(from).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| FilesystemError::Copy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            error: e.to_string(),
        })?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            filesystem::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path()).map_err(|e| FilesystemError::ReadFile {
                path: entry.path().to_path_buf(),
                error: e.to_string(),
            })?;
            filesystem::remove_path(&target)?;
            std::os::unix::fs::symlink(&link, &target).map_err(|e| FilesystemError::WriteFile {
                path: target.clone(),
                error: e.to_string(),
            })?;
        } else {
            filesystem::link_or_copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
