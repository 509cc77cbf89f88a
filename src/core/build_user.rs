//! Privileged build-user management
//!
//! Source packages must not be built as root. [`BuildUserManager::acquire`]
//! reuses an existing account or creates a transient one, and grants it
//! password-less `pacman` through a sudoers drop-in when it has no sudoers
//! entry yet. The returned [`BuildUserGuard`] remembers which of the two it
//! created and undoes exactly that on [`BuildUserGuard::release`] (or on
//! drop, as a last resort).
//!
//! Created accounts are listed in a record file that outlives the process,
//! and the drop-in lives at a fixed path, so a run that was killed before
//! teardown is cleaned up by the next one.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ErrorKind, FilesystemError, TeardownError};
use crate::infra::filesystem;
use crate::infra::process::{CommandRunner, CommandSpec};

/// Command the grant allows without a password
const GRANTED_COMMAND: &str = "/usr/bin/pacman";

/// A build account and what this run owns of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildUser {
    /// Account name
    pub name: String,
    /// Home directory
    pub home: PathBuf,
    /// The account was created by this run
    pub account_created: bool,
    /// The sudoers grant was created by this run
    pub grant_created: bool,
}

/// Creates and grants build users
pub struct BuildUserManager {
    runner: Arc<dyn CommandRunner>,
    sudoers_file: PathBuf,
    sudoers_dir: PathBuf,
    record: PathBuf,
}

impl BuildUserManager {
    /// `record` lists the accounts created by this tool and not yet removed
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        sudoers_file: PathBuf,
        sudoers_dir: PathBuf,
        record: PathBuf,
    ) -> Self {
        Self {
            runner,
            sudoers_file,
            sudoers_dir,
            record,
        }
    }

    /// Path of the drop-in granting `user`
    pub fn grant_path(&self, user: &str) -> PathBuf {
        self.sudoers_dir.join(format!("archoffline-{user}"))
    }

    /// Ensure `name` exists and may run the package manager
    pub fn acquire(&self, name: &str) -> Result<BuildUserGuard, ErrorKind> {
        let exists = self
            .runner
            .run(&CommandSpec::new("id").arg(name).capture())?
            .success();

        let mut guard = BuildUserGuard {
            user: BuildUser {
                name: name.to_string(),
                home: PathBuf::new(),
                account_created: false,
                grant_created: false,
            },
            runner: Arc::clone(&self.runner),
            grant_path: self.grant_path(name),
            record: self.record.clone(),
            released: false,
        };

        if exists && recorded_users(&self.record).iter().any(|u| u == name) {
            tracing::warn!("Reclaiming build user {name} left behind by an earlier run");
            guard.user.account_created = true;
        } else if exists {
            tracing::info!("Using existing build user {name}");
        } else {
            tracing::info!("Creating temporary build user {name}");
            self.runner
                .run(&CommandSpec::new("useradd").args(["-m", "-N", "-s", "/bin/bash", name]))?
                .check("useradd")?;
            guard.user.account_created = true;

            if let Err(e) = add_record(&self.record, name) {
                return Err(Self::abandon(guard, e.into()));
            }
            if let Err(e) = self
                .runner
                .run(&CommandSpec::new("passwd").args(["-l", name]).capture())
                .and_then(|o| o.check("passwd"))
            {
                return Err(Self::abandon(guard, e.into()));
            }
        }

        guard.user.home = self.home_of(name);

        let leftover = guard.grant_path.exists();
        if !leftover && self.has_sudoers_entry(name) {
            tracing::debug!("{name} already has a sudoers entry");
        } else {
            if leftover {
                tracing::warn!("Reclaiming sudoers entry for {name} left behind by an earlier run");
            } else {
                tracing::info!("Creating temporary sudoers entry for {name}");
            }
            if let Err(e) = self.write_grant(name) {
                return Err(Self::abandon(guard, e));
            }
            guard.user.grant_created = true;
        }

        Ok(guard)
    }

    /// Undo a half-finished acquisition, keeping the original error
    fn abandon(guard: BuildUserGuard, error: ErrorKind) -> ErrorKind {
        if let Err(teardown) = guard.release() {
            tracing::error!("{teardown}");
        }
        error
    }

    fn home_of(&self, name: &str) -> PathBuf {
        self.runner
            .run(&CommandSpec::new("getent").args(["passwd", name]).capture())
            .ok()
            .filter(|o| o.success())
            .and_then(|o| o.stdout.trim().split(':').nth(5).map(PathBuf::from))
            .filter(|home| home.is_absolute())
            .unwrap_or_else(|| PathBuf::from("/home").join(name))
    }

    /// Whether any uncommented sudoers line starts with the user name
    pub fn has_sudoers_entry(&self, name: &str) -> bool {
        let mut files = vec![self.sudoers_file.clone()];
        if let Ok(entries) = fs::read_dir(&self.sudoers_dir) {
            files.extend(entries.filter_map(Result::ok).map(|e| e.path()));
        }

        files
            .iter()
            .filter_map(|f| fs::read_to_string(f).ok())
            .any(|content| {
                content.lines().any(|line| {
                    let line = line.trim_start();
                    !line.starts_with('#') && line.split_whitespace().next() == Some(name)
                })
            })
    }

    /// Validate the drop-in with `visudo` before it becomes active
    fn write_grant(&self, name: &str) -> Result<(), ErrorKind> {
        let target = self.grant_path(name);
        let staged = self.sudoers_dir.join(format!(".archoffline-{name}.new"));
        let rule = format!("{name} ALL=(root) NOPASSWD: {GRANTED_COMMAND}\n");

        filesystem::write_file(&staged, &rule)?;
        set_mode(&staged, 0o440)?;

        let checked = self
            .runner
            .run(&CommandSpec::new("visudo").arg("-cf").arg(&staged).capture())
            .and_then(|o| o.check("visudo"));
        if let Err(e) = checked {
            let _ = filesystem::remove_path(&staged);
            return Err(e.into());
        }

        filesystem::rename(&staged, &target)?;
        Ok(())
    }
}

/// Account names listed in the record file
fn recorded_users(record: &Path) -> Vec<String> {
    fs::read_to_string(record)
        .map(|content| {
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn add_record(record: &Path, name: &str) -> Result<(), FilesystemError> {
    let mut users = recorded_users(record);
    if !users.iter().any(|u| u == name) {
        users.push(name.to_string());
    }
    write_record(record, &users)
}

fn drop_record(record: &Path, name: &str) -> Result<(), FilesystemError> {
    let users: Vec<String> = recorded_users(record)
        .into_iter()
        .filter(|u| u != name)
        .collect();
    write_record(record, &users)
}

fn write_record(record: &Path, users: &[String]) -> Result<(), FilesystemError> {
    if users.is_empty() {
        if record.exists() {
            filesystem::remove_path(record)?;
        }
        return Ok(());
    }
    let mut content = users.join("\n");
    content.push('\n');
    filesystem::write_file(record, &content)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), FilesystemError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
        FilesystemError::WriteFile {
            path: path.to_path_buf(),
            error: e.to_string(),
        }
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), FilesystemError> {
    Ok(())
}

/// Scoped ownership of a build user
pub struct BuildUserGuard {
    user: BuildUser,
    runner: Arc<dyn CommandRunner>,
    grant_path: PathBuf,
    record: PathBuf,
    released: bool,
}

impl std::fmt::Debug for BuildUserGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildUserGuard")
            .field("user", &self.user)
            .field("released", &self.released)
            .finish()
    }
}

impl BuildUserGuard {
    /// The acquired account
    pub fn user(&self) -> &BuildUser {
        &self.user
    }

    /// Remove whatever this run created; pre-existing state is left alone
    pub fn release(mut self) -> Result<(), TeardownError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), TeardownError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let name = self.user.name.clone();
        let mut failed = Vec::new();

        if self.user.account_created {
            tracing::info!("Removing temporary build user {name}");
            // Lingering agents keep the home directory busy
            let _ = self.runner.run(
                &CommandSpec::new("gpgconf")
                    .args(["--kill", "all"])
                    .as_user(&name)
                    .capture(),
            );
            match self
                .runner
                .run(&CommandSpec::new("pkill").args(["-KILL", "-u", name.as_str()]).capture())
            {
                // 1: nothing to kill
                Ok(o) if matches!(o.status.code(), Some(0 | 1)) => {}
                Ok(o) => failed.push(format!("pkill ({})", o.status_text())),
                Err(e) => failed.push(e.to_string()),
            }
            match self
                .runner
                .run(&CommandSpec::new("userdel").args(["--remove", name.as_str()]).capture())
                .and_then(|o| o.check("userdel"))
            {
                Ok(_) => {
                    if let Err(e) = drop_record(&self.record, &name) {
                        failed.push(e.to_string());
                    }
                }
                Err(e) => failed.push(e.to_string()),
            }
        }

        if self.user.grant_created {
            tracing::info!("Removing temporary sudoers entry for {name}");
            if let Err(e) = filesystem::remove_path(&self.grant_path) {
                failed.push(e.to_string());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(TeardownError {
                user: name,
                steps: failed,
            })
        }
    }
}

impl Drop for BuildUserGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release_inner() {
                tracing::error!("{e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fakes::{output, ScriptedRunner};
    use tempfile::TempDir;

    struct Host {
        _temp: TempDir,
        sudoers_file: PathBuf,
        sudoers_dir: PathBuf,
        record: PathBuf,
    }

    fn host(sudoers: &str) -> Host {
        let temp = TempDir::new().unwrap();
        let sudoers_file = temp.path().join("sudoers");
        let sudoers_dir = temp.path().join("sudoers.d");
        std::fs::write(&sudoers_file, sudoers).unwrap();
        std::fs::create_dir_all(&sudoers_dir).unwrap();
        Host {
            record: temp.path().join("build").join(".build-users"),
            _temp: temp,
            sudoers_file,
            sudoers_dir,
        }
    }

    fn manager(host: &Host, runner: Arc<ScriptedRunner>) -> BuildUserManager {
        BuildUserManager::new(
            runner,
            host.sudoers_file.clone(),
            host.sudoers_dir.clone(),
            host.record.clone(),
        )
    }

    fn missing_user() -> ScriptedRunner {
        ScriptedRunner::new()
            .on("id", |_| output(1, ""))
            .on("getent", |_| output(0, "builder:x:1001:100::/var/lib/builder:/bin/bash\n"))
    }

    #[test]
    fn test_created_user_and_grant_are_removed() {
        let host = host("root ALL=(ALL) ALL\n");
        let runner = Arc::new(missing_user());
        let guard = manager(&host, runner.clone()).acquire("builder").unwrap();

        let user = guard.user().clone();
        assert!(user.account_created);
        assert!(user.grant_created);
        assert_eq!(user.home, PathBuf::from("/var/lib/builder"));

        let grant = host.sudoers_dir.join("archoffline-builder");
        assert_eq!(
            std::fs::read_to_string(&grant).unwrap(),
            "builder ALL=(root) NOPASSWD: /usr/bin/pacman\n"
        );
        assert_eq!(runner.invocations("useradd").len(), 1);
        assert_eq!(runner.invocations("visudo").len(), 1);
        assert_eq!(std::fs::read_to_string(&host.record).unwrap(), "builder\n");

        guard.release().unwrap();
        assert!(!grant.exists());
        assert!(!host.record.exists());
        assert_eq!(
            runner.invocations("userdel"),
            vec![vec!["--remove".to_string(), "builder".to_string()]]
        );
    }

    #[test]
    fn test_existing_user_and_entry_left_untouched() {
        let host = host("# builder ALL=(ALL) ALL\nbuilder ALL=(ALL) NOPASSWD: ALL\n");
        let runner = Arc::new(ScriptedRunner::new());
        let guard = manager(&host, runner.clone()).acquire("builder").unwrap();

        assert!(!guard.user().account_created);
        assert!(!guard.user().grant_created);
        guard.release().unwrap();

        assert!(runner.invocations("useradd").is_empty());
        assert!(runner.invocations("userdel").is_empty());
        assert!(std::fs::read_dir(&host.sudoers_dir).unwrap().next().is_none());
    }

    #[test]
    fn test_leftover_grant_is_reclaimed_and_removed() {
        let host = host("");
        let grant = host.sudoers_dir.join("archoffline-builder");
        std::fs::write(&grant, "builder ALL=(root) NOPASSWD: /usr/bin/pacman\n").unwrap();
        let runner = Arc::new(ScriptedRunner::new());

        let guard = manager(&host, runner.clone()).acquire("builder").unwrap();
        assert!(!guard.user().account_created);
        assert!(guard.user().grant_created);
        assert_eq!(runner.invocations("visudo").len(), 1);

        guard.release().unwrap();
        assert!(!grant.exists());
        assert!(runner.invocations("userdel").is_empty());
    }

    #[test]
    fn test_recorded_account_is_reclaimed_and_removed() {
        let host = host("");
        std::fs::create_dir_all(host.record.parent().unwrap()).unwrap();
        std::fs::write(&host.record, "builder\nother\n").unwrap();
        let runner = Arc::new(ScriptedRunner::new());

        let guard = manager(&host, runner.clone()).acquire("builder").unwrap();
        assert!(guard.user().account_created);
        assert!(runner.invocations("useradd").is_empty());

        guard.release().unwrap();
        assert_eq!(
            runner.invocations("userdel"),
            vec![vec!["--remove".to_string(), "builder".to_string()]]
        );
        assert_eq!(std::fs::read_to_string(&host.record).unwrap(), "other\n");
    }

    #[test]
    fn test_failed_userdel_keeps_record() {
        let host = host("");
        let runner = Arc::new(missing_user().on("userdel", |_| output(8, "busy")));
        let guard = manager(&host, runner).acquire("builder").unwrap();

        assert!(guard.release().is_err());
        assert_eq!(std::fs::read_to_string(&host.record).unwrap(), "builder\n");
    }

    #[test]
    fn test_existing_user_without_entry_gets_temporary_grant() {
        let host = host("#builder ALL=(ALL) ALL\n");
        let runner = Arc::new(ScriptedRunner::new());
        let guard = manager(&host, runner.clone()).acquire("builder").unwrap();

        assert!(!guard.user().account_created);
        assert!(guard.user().grant_created);
        guard.release().unwrap();

        assert!(runner.invocations("userdel").is_empty());
        assert!(!host.sudoers_dir.join("archoffline-builder").exists());
    }

    #[test]
    fn test_invalid_grant_is_never_installed_and_user_rolled_back() {
        let host = host("");
        let runner = Arc::new(missing_user().on("visudo", |_| output(1, "parse error")));

        let result = manager(&host, runner.clone()).acquire("builder");

        assert!(matches!(result, Err(ErrorKind::ToolInvocation(_))));
        assert!(std::fs::read_dir(&host.sudoers_dir).unwrap().next().is_none());
        assert_eq!(runner.invocations("userdel").len(), 1);
    }

    #[test]
    fn test_drop_releases_unreleased_guard() {
        let host = host("");
        let runner = Arc::new(missing_user());
        {
            let _guard = manager(&host, runner.clone()).acquire("builder").unwrap();
        }
        assert_eq!(runner.invocations("userdel").len(), 1);
        assert!(!host.sudoers_dir.join("archoffline-builder").exists());
    }

    #[test]
    fn test_teardown_failures_are_collected() {
        let host = host("");
        let runner = Arc::new(missing_user().on("userdel", |_| output(8, "user is logged in")));
        let guard = manager(&host, runner).acquire("builder").unwrap();

        let err = guard.release().unwrap_err();
        assert_eq!(err.user, "builder");
        assert_eq!(err.steps.len(), 1);
        assert!(err.steps[0].contains("userdel"));
        // Grant removal still happened
        assert!(!host.sudoers_dir.join("archoffline-builder").exists());
    }

    #[test]
    fn test_useradd_failure_creates_nothing() {
        let host = host("");
        let runner = Arc::new(missing_user().on("useradd", |_| output(9, "exists")));

        assert!(manager(&host, runner.clone()).acquire("builder").is_err());
        assert!(runner.invocations("userdel").is_empty());
        assert!(std::fs::read_dir(&host.sudoers_dir).unwrap().next().is_none());
    }
}
