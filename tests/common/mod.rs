//! Common test utilities and helpers
//!
//! This module provides a fake host for integration tests: a temporary
//! build environment, a command runner that imitates pacman, makepkg,
//! repo-add and mkarchiso, and canned network responses.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tempfile::TempDir;

use archoffline::config::urls;
use archoffline::core::config::BuildConfig;
use archoffline::core::pipeline::Services;
use archoffline::core::resources::SilentPolicy;
use archoffline::error::{DownloadError, ToolInvocationError};
use archoffline::infra::download::{compute_checksum, DownloadResult, Fetch};
use archoffline::infra::git::{CloneResult, GitError, RepoCloner};
use archoffline::infra::process::{CommandOutput, CommandRunner, CommandSpec};

/// Repository name used by every test build
pub const REPO: &str = "localrepo";

/// Template name installed under the fake template root
pub const TEMPLATE: &str = "releng";

/// Mirror status document with two Swedish mirrors and one elsewhere
pub const MIRROR_STATUS: &str = r#"{
  "urls": [
    {"url": "https://ftp.lysator.liu.se/pub/archlinux/", "protocol": "https", "active": true,
     "completion_pct": 1.0, "score": 1.2, "country": "Sweden", "country_code": "SE"},
    {"url": "https://mirror.accum.se/mirror/archlinux/", "protocol": "https", "active": true,
     "completion_pct": 1.0, "score": 0.8, "country": "Sweden", "country_code": "SE"},
    {"url": "https://mirror.example.de/archlinux/", "protocol": "https", "active": true,
     "completion_pct": 1.0, "score": 0.5, "country": "Germany", "country_code": "DE"}
  ]
}"#;

/// Package file name the fake tools produce for `name`
pub fn package_file(name: &str) -> String {
    format!("{name}-1.0-1-x86_64.pkg.tar.zst")
}

/// Test environment context
///
/// Holds a temporary directory with an archiso template, sudoers
/// locations and a home root for build users.
pub struct TestBuild {
    /// Temporary directory for the environment
    pub dir: TempDir,
}

impl TestBuild {
    /// Create an environment with a valid template
    pub fn new() -> Self {
        let build = Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        };
        write_template(&build.path().join("templates").join(TEMPLATE));
        std::fs::create_dir_all(build.path().join("etc/sudoers.d"))
            .expect("Failed to create sudoers directory");
        std::fs::create_dir_all(build.path().join("home")).expect("Failed to create home root");
        build
    }

    /// Get the path to the environment directory
    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Build directory used by [`TestBuild::config`]
    pub fn build_dir(&self) -> PathBuf {
        self.path().join("build")
    }

    /// Local repository inside the build directory
    pub fn repo_dir(&self) -> PathBuf {
        self.build_dir().join("repo").join(REPO)
    }

    /// Sudoers drop-in directory
    pub fn sudoers_dir(&self) -> PathBuf {
        self.path().join("etc/sudoers.d")
    }

    /// Configuration pointing every host path into the environment
    pub fn config(&self) -> BuildConfig {
        BuildConfig {
            template: TEMPLATE.to_string(),
            template_root: self.path().join("templates"),
            repo_name: REPO.to_string(),
            build_dir: self.build_dir(),
            mirror: Some("Sweden".to_string()),
            silent: true,
            system_mirrorlist: self.path().join("etc/mirrorlist"),
            sudoers_file: self.path().join("etc/sudoers"),
            sudoers_dir: self.sudoers_dir(),
            ..BuildConfig::default()
        }
    }

    /// Fake host with the given official packages
    pub fn host(&self, official: &[&str]) -> FakeHost {
        FakeHost::new(self.repo_dir(), self.path().join("home"), official)
    }

    /// Names of the package files in the local repository
    pub fn repo_packages(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.repo_dir())
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|n| n.contains(".pkg.tar"))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Write a minimal archiso template into `dir`
pub fn write_template(dir: &Path) {
    let reflector = dir.join("airootfs/etc/systemd/system/reflector.service.d");
    std::fs::create_dir_all(&reflector).expect("Failed to create template");
    std::fs::write(dir.join("profiledef.sh"), "iso_name=\"archlinux\"\n").unwrap();
    std::fs::write(dir.join("packages.x86_64"), "base\nlinux\n").unwrap();
    std::fs::write(
        dir.join("pacman.conf"),
        "[options]\nArchitecture = auto\n\n[core]\nInclude = /etc/pacman.d/mirrorlist\n\n[extra]\nInclude = /etc/pacman.d/mirrorlist\n",
    )
    .unwrap();
    std::fs::write(reflector.join("archiso.conf"), "[Service]\n").unwrap();
}

/// Exit status with the given code
pub fn exit_status(code: i32) -> ExitStatus {
    ExitStatus::from_raw(code << 8)
}

fn output(code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        status: exit_status(code),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

type Hook = Box<dyn Fn(&CommandSpec) + Send + Sync>;

/// Command runner imitating a root shell on an Arch host
///
/// - `pacman -Si` knows only the official names
/// - `pacman -Syw` writes one package file per name into the repository
/// - `tar` unpacks a PKGBUILD, `makepkg` writes a package into `PKGDEST`
/// - `repo-add` writes the database, `mkarchiso` writes an image
pub struct FakeHost {
    repo_dir: PathBuf,
    home_root: PathBuf,
    official: HashSet<String>,
    uid: String,
    failures: HashMap<String, i32>,
    hook: Option<Hook>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeHost {
    pub fn new(repo_dir: PathBuf, home_root: PathBuf, official: &[&str]) -> Self {
        Self {
            repo_dir,
            home_root,
            official: official.iter().map(|s| s.to_string()).collect(),
            uid: "0".to_string(),
            failures: HashMap::new(),
            hook: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Report a different uid from `id -u`
    #[must_use]
    pub fn with_uid(mut self, uid: &str) -> Self {
        self.uid = uid.to_string();
        self
    }

    /// Make `program` exit with `code` without doing anything
    #[must_use]
    pub fn with_failure(mut self, program: &str, code: i32) -> Self {
        self.failures.insert(program.to_string(), code);
        self
    }

    /// Run `hook` before every command
    #[must_use]
    pub fn with_hook(mut self, hook: impl Fn(&CommandSpec) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Every command run so far
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Argument lists of every run of `program`
    pub fn invocations(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .iter()
            .filter(|c| c.program == program)
            .map(CommandSpec::arg_strings)
            .collect()
    }

    /// Number of `pacman` runs that used `flag`
    pub fn pacman_runs(&self, flag: &str) -> usize {
        self.invocations("pacman")
            .iter()
            .filter(|args| args.iter().any(|a| a == flag))
            .count()
    }

    fn handle(&self, command: &CommandSpec) -> CommandOutput {
        let args = command.arg_strings();
        if let Some(code) = self.failures.get(&command.program) {
            return output(*code, "");
        }
        match command.program.as_str() {
            "id" if args == ["-u"] => output(0, &format!("{}\n", self.uid)),
            // Build users do not exist beforehand
            "id" => output(1, ""),
            "getent" => {
                let name = args.last().cloned().unwrap_or_default();
                let home = self.home_root.join(&name);
                output(
                    0,
                    &format!("{name}:x:1001:1001::{}:/bin/bash\n", home.display()),
                )
            }
            "pacman" => self.pacman(&args),
            "tar" => {
                let tarball = PathBuf::from(&args[1]);
                let target = PathBuf::from(&args[3]);
                let base = tarball
                    .file_name()
                    .map(|n| n.to_string_lossy().trim_end_matches(".tar.gz").to_string())
                    .unwrap_or_default();
                let recipe = target.join(&base);
                std::fs::create_dir_all(&recipe).unwrap();
                std::fs::write(
                    recipe.join("PKGBUILD"),
                    format!("pkgname={base}\npkgver=1.0\npkgrel=1\n"),
                )
                .unwrap();
                output(0, "")
            }
            "makepkg" => {
                let pkgdest = command
                    .env
                    .iter()
                    .find(|(k, _)| k == "PKGDEST")
                    .map(|(_, v)| PathBuf::from(v))
                    .unwrap();
                let base = command
                    .workdir
                    .as_ref()
                    .and_then(|d| d.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                std::fs::create_dir_all(&pkgdest).unwrap();
                std::fs::write(pkgdest.join(package_file(&base)), "built").unwrap();
                output(0, "")
            }
            "repo-add" => {
                let db = PathBuf::from(&args[1]);
                std::fs::write(&db, "index").unwrap();
                output(0, "")
            }
            "mkarchiso" => {
                let out = args
                    .iter()
                    .position(|a| a == "-o")
                    .map(|i| PathBuf::from(&args[i + 1]))
                    .unwrap();
                std::fs::create_dir_all(&out).unwrap();
                std::fs::write(out.join("archlinux-2026.10.16-x86_64.iso"), "iso").unwrap();
                output(0, "")
            }
            _ => output(0, ""),
        }
    }

    fn pacman(&self, args: &[String]) -> CommandOutput {
        if let Some(i) = args.iter().position(|a| a == "-Si") {
            let known = args.get(i + 1).is_some_and(|n| self.official.contains(n));
            return output(i32::from(!known), "");
        }
        if let Some(i) = args.iter().position(|a| a == "-Syw") {
            std::fs::create_dir_all(&self.repo_dir).unwrap();
            for name in &args[i + 1..] {
                std::fs::write(self.repo_dir.join(package_file(name)), name).unwrap();
            }
        }
        output(0, "")
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ToolInvocationError> {
        self.calls.lock().unwrap().push(command.clone());
        if let Some(hook) = &self.hook {
            hook(command);
        }
        Ok(self.handle(command))
    }
}

/// Canned network: mirror status, AUR RPC and snapshot downloads
pub struct FakeFetch {
    /// AUR package name to package base
    aur: HashMap<String, String>,
    rpc_queries: AtomicUsize,
    downloads: AtomicUsize,
}

impl FakeFetch {
    pub fn new(aur: &[(&str, &str)]) -> Self {
        Self {
            aur: aur
                .iter()
                .map(|(name, base)| (name.to_string(), base.to_string()))
                .collect(),
            rpc_queries: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
        }
    }

    /// Number of AUR lookups
    pub fn rpc_queries(&self) -> usize {
        self.rpc_queries.load(Ordering::SeqCst)
    }

    /// Number of file downloads
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn rpc_response(&self, url: &str) -> String {
        let results: Vec<serde_json::Value> = url
            .split(['?', '&'])
            .filter_map(|part| part.strip_prefix("arg[]="))
            .filter_map(|name| {
                self.aur.get(name).map(|base| {
                    serde_json::json!({ "Name": name, "PackageBase": base, "Version": "1.0-1" })
                })
            })
            .collect();
        serde_json::json!({
            "version": 5,
            "type": "multiinfo",
            "resultcount": results.len(),
            "results": results,
        })
        .to_string()
    }
}

impl Fetch for FakeFetch {
    fn fetch_text<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, DownloadError>> {
        async move {
            if url == urls::MIRROR_STATUS {
                Ok(MIRROR_STATUS.to_string())
            } else if url.starts_with(urls::AUR_RPC_INFO) {
                self.rpc_queries.fetch_add(1, Ordering::SeqCst);
                Ok(self.rpc_response(url))
            } else {
                Err(DownloadError::NetworkError {
                    url: url.to_string(),
                    error: "no route to host".to_string(),
                })
            }
        }
        .boxed()
    }

    fn download<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<DownloadResult, DownloadError>> {
        async move {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(dest, url).unwrap();
            Ok(DownloadResult {
                path: dest.to_path_buf(),
                size: url.len() as u64,
                checksum: compute_checksum(url.as_bytes()),
            })
        }
        .boxed()
    }
}

/// Cloner that creates an empty checkout
pub struct FakeCloner;

impl RepoCloner for FakeCloner {
    fn clone_repo(
        &self,
        _url: &str,
        _branch: Option<&str>,
        dest: &Path,
    ) -> Result<CloneResult, GitError> {
        std::fs::create_dir_all(dest.join(".git")).unwrap();
        Ok(CloneResult {
            path: dest.to_path_buf(),
            commit_sha: None,
        })
    }
}

/// Services backed by the fakes
pub fn services(host: Arc<FakeHost>, fetch: Arc<FakeFetch>) -> Services {
    Services {
        runner: host,
        fetch,
        cloner: Arc::new(FakeCloner),
        prompt: Arc::new(SilentPolicy),
    }
}

/// Run the archoffline binary in `cwd` with an isolated config directory
pub fn run_archoffline(cwd: &Path, args: &[&str]) -> std::process::Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_archoffline"));
    cmd.current_dir(cwd);
    cmd.env("ARCHOFFLINE_CONFIG_DIR", cwd.join(".config"));
    cmd.env_remove("RUST_LOG");
    cmd.args(args);
    cmd.output().expect("Failed to execute archoffline")
}
