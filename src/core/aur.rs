//! Source (AUR) package building
//!
//! Names are resolved through the AUR RPC, recipes are fetched as snapshot
//! tarballs, and each package is built with `makepkg` as the build user in
//! its own working directory. Builds run one at a time.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;

use crate::config::urls;
use crate::core::build_user::BuildUser;
use crate::core::repository::{is_package_file, BuiltArtifact};
use crate::error::{PackageBuildError, ValidationError};
use crate::infra::download::Fetch;
use crate::infra::filesystem;
use crate::infra::process::{CommandRunner, CommandSpec};

/// Working directory under the build user's home
const WORK_DIR: &str = "archoffline-build";

/// A source package to build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AurSpec {
    /// Requested package name
    pub name: String,
    /// Package base the recipe is published under
    pub base: String,
}

impl AurSpec {
    /// Spec assuming the package base equals the name
    pub fn unresolved(name: &str) -> Self {
        Self {
            name: name.to_string(),
            base: name.to_string(),
        }
    }

    /// Snapshot tarball URL
    pub fn snapshot_url(&self) -> String {
        format!("{}/{}.tar.gz", urls::AUR_SNAPSHOT, self.base)
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    results: Vec<RpcPackage>,
}

#[derive(Debug, Deserialize)]
struct RpcPackage {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "PackageBase")]
    package_base: String,
}

/// RPC info URL for a set of names
pub fn info_url(names: &[String]) -> String {
    let query: Vec<String> = names
        .iter()
        .map(|n| format!("arg[]={}", n.replace('+', "%2B").replace('@', "%40")))
        .collect();
    format!("{}?{}", urls::AUR_RPC_INFO, query.join("&"))
}

/// Resolve names to specs
///
/// Unknown names fail with [`ValidationError`] unless `skip_validation`
/// is set, in which case they are warned about and built as named.
pub async fn resolve(
    fetch: &dyn Fetch,
    names: &[String],
    skip_validation: bool,
) -> Result<Vec<AurSpec>, ValidationError> {
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let lookup = async {
        let body = fetch
            .fetch_text(&info_url(names))
            .await
            .map_err(|e| ValidationError::AurLookup {
                error: e.to_string(),
            })?;
        let response: RpcResponse =
            serde_json::from_str(&body).map_err(|e| ValidationError::AurLookup {
                error: e.to_string(),
            })?;
        if response.kind == "error" {
            return Err(ValidationError::AurLookup {
                error: response.error.unwrap_or_else(|| "unknown RPC error".to_string()),
            });
        }
        Ok(response.results)
    };

    let results = match lookup.await {
        Ok(results) => results,
        Err(e) if skip_validation => {
            tracing::warn!("Skipping AUR validation: {e}");
            return Ok(names.iter().map(|n| AurSpec::unresolved(n)).collect());
        }
        Err(e) => return Err(e),
    };

    let mut specs = Vec::new();
    let mut unknown = Vec::new();
    for name in names {
        match results.iter().find(|r| &r.name == name) {
            Some(found) => specs.push(AurSpec {
                name: name.clone(),
                base: found.package_base.clone(),
            }),
            None if skip_validation => {
                tracing::warn!("AUR package '{name}' not found, building it anyway");
                specs.push(AurSpec::unresolved(name));
            }
            None => unknown.push(name.clone()),
        }
    }

    if unknown.is_empty() {
        Ok(specs)
    } else {
        Err(ValidationError::UnknownAurPackages { names: unknown })
    }
}

/// PGP fingerprints listed in `validpgpkeys=(…)`
pub fn valid_pgp_keys(pkgbuild: &str) -> Vec<String> {
    let (Ok(array), Ok(key)) = (
        Regex::new(r"(?m)^\s*validpgpkeys\s*=\s*\(([^)]*)\)"),
        Regex::new(r"\b[0-9A-Fa-f]{16,40}\b"),
    ) else {
        return Vec::new();
    };

    let mut keys = Vec::new();
    for captures in array.captures_iter(pkgbuild) {
        for line in captures[1].lines() {
            let line = line.split('#').next().unwrap_or_default();
            for found in key.find_iter(line) {
                let k = found.as_str().to_uppercase();
                if !keys.contains(&k) {
                    keys.push(k);
                }
            }
        }
    }
    keys
}

/// Builds source packages as the build user
pub struct SourceBuilder<'a> {
    runner: &'a dyn CommandRunner,
    fetch: &'a dyn Fetch,
    user: &'a BuildUser,
}

impl<'a> SourceBuilder<'a> {
    pub fn new(runner: &'a dyn CommandRunner, fetch: &'a dyn Fetch, user: &'a BuildUser) -> Self {
        Self {
            runner,
            fetch,
            user,
        }
    }

    /// Isolated working directory of a spec
    pub fn workdir(&self, spec: &AurSpec) -> PathBuf {
        self.user.home.join(WORK_DIR).join(&spec.base)
    }

    /// Fetch, build and collect one spec
    pub async fn build(&self, spec: &AurSpec) -> Result<BuiltArtifact, PackageBuildError> {
        tracing::info!("Building AUR package {}", spec.name);
        let workdir = self.workdir(spec);
        let workspace_err = |e: &dyn std::fmt::Display| PackageBuildError::Workspace {
            package: spec.name.clone(),
            error: e.to_string(),
        };

        if workdir.exists() {
            filesystem::remove_dir_all(&workdir).map_err(|e| workspace_err(&e))?;
        }
        let pkgdest = workdir.join("pkgdest");
        filesystem::create_dir_all(&pkgdest).map_err(|e| workspace_err(&e))?;

        let tarball = workdir.join(format!("{}.tar.gz", spec.base));
        self.fetch
            .download(&spec.snapshot_url(), &tarball)
            .await
            .map_err(|e| PackageBuildError::Recipe {
                package: spec.name.clone(),
                error: e.to_string(),
            })?;

        self.step(
            spec,
            CommandSpec::new("chown")
                .arg("-R")
                .arg(format!("{}:", self.user.name))
                .arg(self.user.home.join(WORK_DIR)),
        )?;
        self.step(
            spec,
            CommandSpec::new("tar")
                .arg("-xzf")
                .arg(&tarball)
                .arg("-C")
                .arg(&workdir)
                .as_user(&self.user.name),
        )?;

        let recipe_dir = workdir.join(&spec.base);
        let pkgbuild = filesystem::read_file(&recipe_dir.join("PKGBUILD")).map_err(|e| {
            PackageBuildError::Recipe {
                package: spec.name.clone(),
                error: e.to_string(),
            }
        })?;

        for key in valid_pgp_keys(&pkgbuild) {
            tracing::info!("Importing PGP key {key} for {}", self.user.name);
            let imported = self.runner.run(
                &CommandSpec::new("gpg")
                    .args(["--recv-keys", key.as_str()])
                    .as_user(&self.user.name)
                    .capture(),
            );
            match imported {
                Ok(o) if o.success() => {}
                Ok(o) => tracing::warn!("Could not import key {key}: {}", o.combined().trim()),
                Err(e) => tracing::warn!("Could not import key {key}: {e}"),
            }
        }

        let makepkg = CommandSpec::new("makepkg")
            .args([
                "--clean",
                "--force",
                "--cleanbuild",
                "--noconfirm",
                "--needed",
                "-s",
            ])
            .current_dir(&recipe_dir)
            .env("PKGDEST", pkgdest.display().to_string())
            .as_user(&self.user.name);
        let output = self.runner.run(&makepkg).map_err(|e| PackageBuildError::Build {
            package: spec.name.clone(),
            status: "not started".to_string(),
            output: e.to_string(),
        })?;
        if !output.success() {
            return Err(PackageBuildError::Build {
                package: spec.name.clone(),
                status: output.status_text(),
                output: output.combined(),
            });
        }

        let files = collect_packages(&pkgdest);
        if files.is_empty() {
            return Err(PackageBuildError::NoArtifacts {
                package: spec.name.clone(),
            });
        }
        tracing::debug!("{} produced {} file(s)", spec.name, files.len());
        Ok(BuiltArtifact {
            package: spec.name.clone(),
            files,
        })
    }

    /// Remove a spec's working directory
    pub fn cleanup(&self, spec: &AurSpec) {
        let workdir = self.workdir(spec);
        if let Err(e) = filesystem::remove_dir_all(&workdir) {
            tracing::debug!("Could not remove {}: {e}", workdir.display());
        }
    }

    fn step(&self, spec: &AurSpec, command: CommandSpec) -> Result<(), PackageBuildError> {
        let tool = command.program.clone();
        self.runner
            .run(&command.capture())
            .and_then(|o| o.check(&tool))
            .map(|_| ())
            .map_err(|e| PackageBuildError::Workspace {
                package: spec.name.clone(),
                error: e.to_string(),
            })
    }
}

fn collect_packages(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .is_some_and(|n| is_package_file(&n.to_string_lossy()))
                })
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}
