//! Build configuration
//!
//! [`BuildConfig`] is the immutable snapshot every component reads. It is
//! produced once by layering, lowest precedence first: built-in defaults,
//! the global `config.toml`, a project `archoffline.toml`, and command-line
//! overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{defaults, urls};
use crate::core::mirror::MirrorSpec;
use crate::error::ConfigurationError;
use crate::infra::dirs::ArchofflineDirs;

/// Installer tool cloned into the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerConfig {
    /// Repository URL
    pub url: String,
    /// Branch to check out
    pub branch: String,
}

/// Resolved build parameters. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildConfig {
    /// archiso template name
    pub template: String,
    /// Directory holding archiso templates
    pub template_root: PathBuf,
    /// Name of the repository embedded in the image
    pub repo_name: String,
    /// Absolute build directory
    pub build_dir: PathBuf,
    /// Raw mirror specification
    pub mirror: Option<String>,
    /// Additional pre-built packages
    pub packages: Vec<String>,
    /// Source (AUR) packages
    pub aur_packages: Vec<String>,
    /// Resource descriptors staged into the image
    pub resources: Vec<String>,
    /// Script run inside the image before it is finalized
    pub customize_script: Option<PathBuf>,
    /// Command started on the first virtual terminal of the live system
    pub autorun: Option<String>,
    /// Account used to build source packages
    pub build_user: String,
    /// Installer tool clone, if requested
    pub installer: Option<InstallerConfig>,
    /// Installer profiles copied into the clone
    pub profiles: Vec<PathBuf>,
    /// Warn instead of failing on unresolvable package names
    pub skip_validation: bool,
    /// Recreate the build directory
    pub rebuild: bool,
    /// Stop before invoking the image builder
    pub breakpoint: bool,
    /// Stream external tool output
    pub verbose: bool,
    /// Keep the repository across a rebuild
    pub save_cache: bool,
    /// Never prompt
    pub silent: bool,
    /// Boot the image after a successful build
    pub boot: bool,
    /// System mirror list reused by the `copy` keyword
    pub system_mirrorlist: PathBuf,
    /// Main sudoers file
    pub sudoers_file: PathBuf,
    /// Sudoers drop-in directory
    pub sudoers_dir: PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            template: defaults::DEFAULT_TEMPLATE.to_string(),
            template_root: PathBuf::from(defaults::DEFAULT_TEMPLATE_ROOT),
            repo_name: defaults::DEFAULT_REPO_NAME.to_string(),
            build_dir: PathBuf::from(defaults::DEFAULT_BUILD_DIR),
            mirror: None,
            packages: Vec::new(),
            aur_packages: Vec::new(),
            resources: Vec::new(),
            customize_script: None,
            autorun: None,
            build_user: defaults::DEFAULT_BUILD_USER.to_string(),
            installer: None,
            profiles: Vec::new(),
            skip_validation: false,
            rebuild: false,
            breakpoint: false,
            verbose: false,
            save_cache: false,
            silent: false,
            boot: false,
            system_mirrorlist: PathBuf::from(defaults::SYSTEM_MIRRORLIST),
            sudoers_file: PathBuf::from(defaults::SUDOERS_FILE),
            sudoers_dir: PathBuf::from(defaults::SUDOERS_DIR),
        }
    }
}

/// A list given either as one delimited string or as an array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListValue {
    /// Delimited string
    Text(String),
    /// Array of items
    Items(Vec<String>),
}

impl ListValue {
    /// Split into items; `sep` of `None` splits on whitespace
    pub fn into_items(self, sep: Option<char>) -> Vec<String> {
        match self {
            Self::Text(text) => split_list(&text, sep),
            Self::Items(items) => items
                .into_iter()
                .map(|i| i.trim().to_string())
                .filter(|i| !i.is_empty())
                .collect(),
        }
    }
}

/// Split a delimited list, dropping empty items
pub fn split_list(text: &str, sep: Option<char>) -> Vec<String> {
    let items: Vec<&str> = match sep {
        Some(sep) => text.split(sep).collect(),
        None => text.split_whitespace().collect(),
    };
    items
        .into_iter()
        .map(str::trim)
        .filter(|i| !i.is_empty())
        .map(String::from)
        .collect()
}

/// Installer section of a config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallerFile {
    /// Clone the installer tool
    pub enabled: Option<bool>,
    /// Repository URL
    pub url: Option<String>,
    /// Branch
    pub branch: Option<String>,
    /// Profiles (`,`-separated or array)
    pub profiles: Option<ListValue>,
}

/// On-disk configuration layer (`config.toml` / `archoffline.toml`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub template: Option<String>,
    pub template_root: Option<PathBuf>,
    pub repo: Option<String>,
    pub builddir: Option<PathBuf>,
    pub mirrors: Option<String>,
    pub packages: Option<ListValue>,
    pub aur_packages: Option<ListValue>,
    pub resources: Option<ListValue>,
    pub customize: Option<PathBuf>,
    pub autorun: Option<String>,
    pub aur_user: Option<String>,
    pub skip_validation: Option<bool>,
    pub save_cache: Option<bool>,
    pub silent: Option<bool>,
    pub verbose: Option<bool>,
    pub system_mirrorlist: Option<PathBuf>,
    #[serde(default)]
    pub installer: InstallerFile,
}

impl ConfigFile {
    /// Parse from TOML string
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load a config file
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigurationError::ConfigFile {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;
        Self::from_toml(&content).map_err(|e| ConfigurationError::ConfigFile {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Overlay `other` on top of `self`
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            template: other.template.or(self.template),
            template_root: other.template_root.or(self.template_root),
            repo: other.repo.or(self.repo),
            builddir: other.builddir.or(self.builddir),
            mirrors: other.mirrors.or(self.mirrors),
            packages: other.packages.or(self.packages),
            aur_packages: other.aur_packages.or(self.aur_packages),
            resources: other.resources.or(self.resources),
            customize: other.customize.or(self.customize),
            autorun: other.autorun.or(self.autorun),
            aur_user: other.aur_user.or(self.aur_user),
            skip_validation: other.skip_validation.or(self.skip_validation),
            save_cache: other.save_cache.or(self.save_cache),
            silent: other.silent.or(self.silent),
            verbose: other.verbose.or(self.verbose),
            system_mirrorlist: other.system_mirrorlist.or(self.system_mirrorlist),
            installer: InstallerFile {
                enabled: other.installer.enabled.or(self.installer.enabled),
                url: other.installer.url.or(self.installer.url),
                branch: other.installer.branch.or(self.installer.branch),
                profiles: other.installer.profiles.or(self.installer.profiles),
            },
        }
    }
}

/// Command-line overrides (highest precedence)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub template: Option<String>,
    pub repo: Option<String>,
    pub builddir: Option<PathBuf>,
    pub mirrors: Option<String>,
    pub packages: Option<String>,
    pub aur_packages: Option<String>,
    pub resources: Option<String>,
    pub customize: Option<PathBuf>,
    pub autorun: Option<String>,
    pub aur_user: Option<String>,
    pub archinstall: bool,
    pub ai_branch: Option<String>,
    pub ai_url: Option<String>,
    pub profiles: Option<String>,
    pub skip_validation: bool,
    pub rebuild: bool,
    pub breakpoint: bool,
    pub verbose: bool,
    pub save_cache: bool,
    pub silent: bool,
    pub boot: bool,
}

/// Collect config file layers: global first, then project
pub fn load_layers(
    dirs: &ArchofflineDirs,
    explicit: Option<&Path>,
    cwd: &Path,
) -> Result<Vec<ConfigFile>, ConfigurationError> {
    let mut layers = Vec::new();

    let global = dirs.global_config_path();
    if global.is_file() {
        tracing::debug!("Loading global config {}", global.display());
        layers.push(ConfigFile::load(&global)?);
    }

    match explicit {
        Some(path) => layers.push(ConfigFile::load(path)?),
        None => {
            let project = cwd.join(defaults::PROJECT_CONFIG_FILE);
            if project.is_file() {
                tracing::debug!("Loading project config {}", project.display());
                layers.push(ConfigFile::load(&project)?);
            }
        }
    }

    Ok(layers)
}

impl BuildConfig {
    /// Merge file layers and overrides into a validated configuration
    ///
    /// Relative paths are resolved against `cwd`.
    pub fn resolve(
        layers: Vec<ConfigFile>,
        overrides: Overrides,
        cwd: &Path,
    ) -> Result<Self, ConfigurationError> {
        let file = layers
            .into_iter()
            .fold(ConfigFile::default(), ConfigFile::merge);
        let base = Self::default();
        let absolute = |p: PathBuf| if p.is_absolute() { p } else { cwd.join(p) };

        let list = |cli: Option<String>, file: Option<ListValue>, sep: Option<char>| {
            cli.map(|text| split_list(&text, sep))
                .or_else(|| file.map(|v| v.into_items(sep)))
                .unwrap_or_default()
        };

        let profiles: Vec<PathBuf> = list(overrides.profiles, file.installer.profiles, Some(','))
            .into_iter()
            .map(|p| absolute(PathBuf::from(p)))
            .collect();

        // Giving profiles implies cloning the installer
        let installer_enabled = overrides.archinstall
            || file.installer.enabled.unwrap_or(false)
            || !profiles.is_empty();
        let installer = installer_enabled.then(|| InstallerConfig {
            url: overrides
                .ai_url
                .or(file.installer.url)
                .unwrap_or_else(|| urls::ARCHINSTALL_GIT.to_string()),
            branch: overrides
                .ai_branch
                .or(file.installer.branch)
                .unwrap_or_else(|| defaults::DEFAULT_INSTALLER_BRANCH.to_string()),
        });

        let autorun = overrides
            .autorun
            .or(file.autorun)
            .filter(|a| !a.trim().is_empty())
            .or_else(|| {
                installer
                    .as_ref()
                    .map(|_| defaults::DEFAULT_INSTALLER_AUTORUN.to_string())
            });

        let config = Self {
            template: overrides.template.or(file.template).unwrap_or(base.template),
            template_root: file
                .template_root
                .map(absolute)
                .unwrap_or(base.template_root),
            repo_name: overrides.repo.or(file.repo).unwrap_or(base.repo_name),
            build_dir: absolute(
                overrides
                    .builddir
                    .or(file.builddir)
                    .unwrap_or(base.build_dir),
            ),
            mirror: overrides
                .mirrors
                .or(file.mirrors)
                .map(|m| m.trim().to_string()),
            packages: list(overrides.packages, file.packages, None),
            aur_packages: list(overrides.aur_packages, file.aur_packages, None),
            resources: list(overrides.resources, file.resources, Some(';')),
            customize_script: overrides.customize.or(file.customize).map(absolute),
            autorun,
            build_user: overrides.aur_user.or(file.aur_user).unwrap_or(base.build_user),
            installer,
            profiles,
            skip_validation: overrides.skip_validation || file.skip_validation.unwrap_or(false),
            rebuild: overrides.rebuild,
            breakpoint: overrides.breakpoint,
            verbose: overrides.verbose || file.verbose.unwrap_or(false),
            save_cache: overrides.save_cache || file.save_cache.unwrap_or(false),
            silent: overrides.silent || file.silent.unwrap_or(false),
            boot: overrides.boot,
            system_mirrorlist: file.system_mirrorlist.unwrap_or(base.system_mirrorlist),
            sudoers_file: base.sudoers_file,
            sudoers_dir: base.sudoers_dir,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject unusable or contradictory values
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |field: &str, message: String| ConfigurationError::InvalidField {
            field: field.to_string(),
            message,
        };

        MirrorSpec::parse(self.mirror.as_deref().unwrap_or_default())?;
        if !is_identifier(&self.repo_name) {
            return Err(invalid(
                "repo",
                format!(
                    "'{}' must be non-empty and contain only letters, digits, '-' or '_'",
                    self.repo_name
                ),
            ));
        }
        if !is_identifier(&self.template) {
            return Err(invalid(
                "template",
                format!("'{}' is not a template name", self.template),
            ));
        }
        if !is_identifier(&self.build_user) {
            return Err(invalid(
                "aur-user",
                format!("'{}' is not a valid user name", self.build_user),
            ));
        }
        for name in self.packages.iter().chain(&self.aur_packages) {
            if !is_package_name(name) {
                return Err(invalid("packages", format!("'{name}' is not a package name")));
            }
        }
        if let Some(script) = &self.customize_script {
            if !script.is_file() {
                return Err(invalid(
                    "customize",
                    format!("script '{}' does not exist", script.display()),
                ));
            }
        }
        if let Some(installer) = &self.installer {
            if installer.branch.trim().is_empty() || installer.branch.starts_with('-') {
                return Err(invalid(
                    "ai-branch",
                    format!("'{}' is not a branch name", installer.branch),
                ));
            }
        }
        if self.build_dir == Path::new("/") {
            return Err(invalid("builddir", "refusing to build in '/'".to_string()));
        }
        Ok(())
    }

    /// Directory of the selected template
    pub fn template_dir(&self) -> PathBuf {
        self.template_root.join(&self.template)
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Package names: never empty, never option-like, no whitespace or slashes
fn is_package_name(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@._+-".contains(c))
}
