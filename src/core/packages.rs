//! Pre-built package synchronisation
//!
//! Drives `pacman` against the build-time configuration: checks which
//! requested names exist in the official repositories and downloads every
//! pre-built package (with dependencies) into the local repository.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{FilesystemError, ToolInvocationError};
use crate::infra::filesystem;
use crate::infra::process::{CommandRunner, CommandSpec};

/// `pacman` bound to one configuration file
pub struct PackageSync<'a> {
    runner: &'a dyn CommandRunner,
    conf: PathBuf,
}

impl<'a> PackageSync<'a> {
    pub fn new(runner: &'a dyn CommandRunner, conf: PathBuf) -> Self {
        Self { runner, conf }
    }

    fn pacman(&self) -> CommandSpec {
        CommandSpec::new("pacman").arg("--config").arg(&self.conf)
    }

    /// Refresh the sync databases
    pub fn refresh(&self) -> Result<(), ToolInvocationError> {
        self.runner
            .run(&self.pacman().arg("-Sy"))?
            .check("pacman -Sy")?;
        Ok(())
    }

    /// Split names into those the repositories provide and the rest
    pub fn partition(
        &self,
        names: &[String],
    ) -> Result<(Vec<String>, Vec<String>), ToolInvocationError> {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for name in names {
            let info = self
                .runner
                .run(&self.pacman().arg("-Si").arg(name).capture())?;
            if info.success() {
                found.push(name.clone());
            } else {
                missing.push(name.clone());
            }
        }
        Ok((found, missing))
    }

    /// Download packages and their dependencies into the cache directory
    pub fn download(&self, packages: &[String]) -> Result<(), ToolInvocationError> {
        if packages.is_empty() {
            return Ok(());
        }
        tracing::info!("Downloading {} package(s) and dependencies", packages.len());
        self.runner
            .run(
                &self
                    .pacman()
                    .args(["--noconfirm", "-Syw"])
                    .args(packages.iter().map(String::as_str)),
            )?
            .check("pacman -Syw")?;
        Ok(())
    }
}

/// Package names from a `packages.x86_64` style file
pub fn parse_package_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// `base` followed by new names from `extra`, first occurrence kept
pub fn merge_package_lists(base: &[String], extra: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    base.iter()
        .chain(extra)
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect()
}

/// Merge `extra` into the package list file at `path`
pub fn update_package_list(path: &Path, extra: &[String]) -> Result<Vec<String>, FilesystemError> {
    let base = parse_package_list(&filesystem::read_file(path)?);
    let merged = merge_package_lists(&base, extra);
    if merged.len() != base.len() {
        let mut content = merged.join("\n");
        content.push('\n');
        filesystem::write_file_atomic(path, &content)?;
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fakes::{output, ScriptedRunner};
    use tempfile::TempDir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_package_list_ignores_comments() {
        let list = parse_package_list("# base\nbase\n\nlinux  # kernel\n  nano\n");
        assert_eq!(list, names(&["base", "linux", "nano"]));
    }

    #[test]
    fn test_merge_keeps_order_and_dedupes() {
        let merged = merge_package_lists(&names(&["base", "nano"]), &names(&["wget", "nano", "wget"]));
        assert_eq!(merged, names(&["base", "nano", "wget"]));
    }

    #[test]
    fn test_update_package_list_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("packages.x86_64");
        std::fs::write(&path, "base\n# comment\nlinux\n").unwrap();

        update_package_list(&path, &names(&["nano"])).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        update_package_list(&path, &names(&["nano"])).unwrap();

        assert_eq!(first, "base\nlinux\nnano\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn test_partition_by_pacman_si() {
        let runner = ScriptedRunner::new().on("pacman", |spec| {
            let args = spec.arg_strings();
            if args.contains(&"-Si".to_string()) && args.last().unwrap() == "yay" {
                output(1, "error: package 'yay' was not found")
            } else {
                output(0, "")
            }
        });
        let sync = PackageSync::new(&runner, PathBuf::from("/b/pacman.build.conf"));

        let (found, missing) = sync.partition(&names(&["nano", "yay"])).unwrap();
        assert_eq!(found, names(&["nano"]));
        assert_eq!(missing, names(&["yay"]));
        assert_eq!(
            runner.invocations("pacman")[0],
            names(&["--config", "/b/pacman.build.conf", "-Si", "nano"])
        );
    }

    #[test]
    fn test_download_failure_is_tool_error() {
        let runner = ScriptedRunner::new().on("pacman", |_| output(1, "failed to retrieve"));
        let sync = PackageSync::new(&runner, PathBuf::from("/b/pacman.build.conf"));

        assert!(matches!(
            sync.download(&names(&["nano"])),
            Err(ToolInvocationError::Failed { .. })
        ));
        assert!(sync.download(&[]).is_ok());
        assert_eq!(runner.calls().len(), 1);
    }
}
