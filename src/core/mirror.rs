//! Mirror resolution
//!
//! Turns the operator's mirror specification into a [`MirrorDescriptor`]
//! and renders the build-time pacman configuration from it.
//!
//! Accepted forms:
//! - a region (`Sweden`, `se`): ranked HTTPS mirrors from the Arch mirror status
//! - `copy`: the host's `/etc/pacman.d/mirrorlist`
//! - `http://` / `https://`: one fixed `Server =` value, used as-is
//! - `file://` or an absolute path: a local mirror directory; every
//!   `<name>.db` below it becomes a repository served from disk

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use walkdir::WalkDir;

use crate::config::{defaults, urls};
use crate::error::ConfigurationError;
use crate::infra::download::Fetch;

/// Suffix appended to mirror-status roots that carry no `$repo` placeholder
const REPO_PATH_SUFFIX: &str = "$repo/os/$arch";

/// Parsed mirror specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorSpec {
    /// Country name or ISO code
    Region(String),
    /// Reuse the system mirror list
    Copy,
    /// A single network mirror
    Url(String),
    /// A local mirror directory
    Local(PathBuf),
}

impl MirrorSpec {
    /// Classify a specification string; never silently defaults
    pub fn parse(spec: &str) -> Result<Self, ConfigurationError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ConfigurationError::MissingMirror);
        }
        if spec.eq_ignore_ascii_case("copy") {
            return Ok(Self::Copy);
        }

        let lower = spec.to_ascii_lowercase();
        if lower.starts_with("https://") || lower.starts_with("http://") {
            if spec.split_once("://").map_or(true, |(_, rest)| rest.is_empty()) {
                return Err(ConfigurationError::UnrecognizedMirror {
                    spec: spec.to_string(),
                });
            }
            return Ok(Self::Url(spec.to_string()));
        }
        if let Some(path) = spec.strip_prefix("file://") {
            if path.starts_with('/') {
                return Ok(Self::Local(PathBuf::from(path)));
            }
        } else if spec.starts_with('/') {
            return Ok(Self::Local(PathBuf::from(spec)));
        }

        if is_region_keyword(spec) {
            return Ok(Self::Region(spec.to_string()));
        }
        Err(ConfigurationError::UnrecognizedMirror {
            spec: spec.to_string(),
        })
    }
}

/// Region keywords are plain words: `Sweden`, `United States`, `SE`
fn is_region_keyword(spec: &str) -> bool {
    spec.chars().next().is_some_and(|c| c.is_alphabetic())
        && spec
            .chars()
            .all(|c| c.is_alphabetic() || c == ' ' || c == '-' || c == '.' || c == '\'')
}

/// Resolved mirror choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorDescriptor {
    /// Ranked servers for a region
    Region {
        /// Region as requested
        region: String,
        /// `Server =` values, best first
        servers: Vec<String>,
    },
    /// The host's mirror list, referenced through `Include =`
    System {
        /// Mirror list path
        mirrorlist: PathBuf,
    },
    /// A single network server
    Url {
        /// `Server =` value
        server: String,
    },
    /// A local mirror providing one or more repository databases
    Local {
        /// Databases found below the mirror root, sorted by name
        databases: Vec<LocalDatabase>,
        /// Mirror list for official repositories the mirror lacks
        mirrorlist: PathBuf,
    },
}

/// One repository database inside a local mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDatabase {
    /// Repository name (database file stem)
    pub name: String,
    /// Directory containing the database
    pub path: PathBuf,
}

impl MirrorDescriptor {
    /// Short description for logs
    pub fn summary(&self) -> String {
        match self {
            Self::Region { region, servers } => {
                format!("{} mirror(s) in {region}", servers.len())
            }
            Self::System { mirrorlist } => format!("system mirror list {}", mirrorlist.display()),
            Self::Url { server } => format!("fixed mirror {server}"),
            Self::Local { databases, .. } => {
                let names: Vec<&str> = databases.iter().map(|db| db.name.as_str()).collect();
                format!("local mirror [{}]", names.join(", "))
            }
        }
    }

    /// Render `pacman.build.conf` for the build environment
    pub fn render_pacman_conf(&self, db_path: &Path, cache_dir: &Path) -> String {
        let mut conf = String::new();
        conf.push_str("[options]\n");
        let _ = writeln!(conf, "DBPath      = {}/", db_path.display());
        let _ = writeln!(conf, "CacheDir    = {}/", cache_dir.display());
        conf.push_str("HoldPkg     = pacman glibc\n");
        conf.push_str("Architecture = auto\n\n");
        conf.push_str("CheckSpace\n\n");
        conf.push_str("SigLevel    = Required DatabaseOptional\n");
        conf.push_str("LocalFileSigLevel = Optional\n");

        let include = |list: &Path| format!("Include = {}\n", list.display());
        let body = match self {
            Self::Region { servers, .. } => servers
                .iter()
                .map(|s| format!("Server = {s}\n"))
                .collect::<String>(),
            Self::Url { server } => format!("Server = {server}\n"),
            Self::System { mirrorlist } => include(mirrorlist),
            Self::Local {
                databases,
                mirrorlist,
            } => {
                for db in databases {
                    let _ = write!(
                        conf,
                        "\n[{}]\nSigLevel = Optional TrustAll\nServer = file://{}\n",
                        db.name,
                        db.path.display()
                    );
                }
                include(mirrorlist)
            }
        };

        for repo in defaults::OFFICIAL_REPOS {
            if self.serves_locally(repo) {
                continue;
            }
            let _ = write!(conf, "\n[{repo}]\n{body}");
        }
        conf
    }

    fn serves_locally(&self, repo: &str) -> bool {
        match self {
            Self::Local { databases, .. } => databases.iter().any(|db| db.name == repo),
            _ => false,
        }
    }
}

/// One entry of the mirror status document
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorStatusEntry {
    pub url: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub completion_pct: Option<f64>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub country_code: String,
}

/// Mirror status document
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorStatus {
    pub urls: Vec<MirrorStatusEntry>,
}

/// Resolve a mirror specification
pub async fn resolve(
    spec: Option<&str>,
    fetch: &dyn Fetch,
    system_mirrorlist: &Path,
) -> Result<MirrorDescriptor, ConfigurationError> {
    let spec = MirrorSpec::parse(spec.ok_or(ConfigurationError::MissingMirror)?)?;
    tracing::debug!("Mirror specification: {spec:?}");

    match spec {
        MirrorSpec::Region(region) => {
            let body = fetch
                .fetch_text(urls::MIRROR_STATUS)
                .await
                .map_err(|e| ConfigurationError::MirrorStatus {
                    error: e.to_string(),
                })?;
            let status: MirrorStatus =
                serde_json::from_str(&body).map_err(|e| ConfigurationError::MirrorStatus {
                    error: e.to_string(),
                })?;
            let servers = rank_region(&status, &region)?;
            Ok(MirrorDescriptor::Region { region, servers })
        }
        MirrorSpec::Copy => {
            check_mirrorlist(system_mirrorlist)?;
            Ok(MirrorDescriptor::System {
                mirrorlist: system_mirrorlist.to_path_buf(),
            })
        }
        MirrorSpec::Url(server) => Ok(MirrorDescriptor::Url { server }),
        MirrorSpec::Local(path) => Ok(MirrorDescriptor::Local {
            databases: find_local_databases(&path)?,
            mirrorlist: system_mirrorlist.to_path_buf(),
        }),
    }
}

/// Select active, HTTPS, fully synced mirrors of a region, best score first
pub fn rank_region(status: &MirrorStatus, region: &str) -> Result<Vec<String>, ConfigurationError> {
    let in_region: Vec<&MirrorStatusEntry> = status
        .urls
        .iter()
        .filter(|m| {
            m.country.eq_ignore_ascii_case(region) || m.country_code.eq_ignore_ascii_case(region)
        })
        .collect();

    if in_region.is_empty() {
        return Err(ConfigurationError::UnknownRegion {
            region: region.to_string(),
        });
    }

    let mut candidates: Vec<&MirrorStatusEntry> = in_region
        .into_iter()
        .filter(|m| m.active && m.protocol.eq_ignore_ascii_case("https"))
        .filter(|m| m.completion_pct.is_some_and(|pct| pct >= 1.0))
        .collect();
    candidates.sort_by(|a, b| {
        let a = a.score.unwrap_or(f64::MAX);
        let b = b.score.unwrap_or(f64::MAX);
        a.total_cmp(&b)
    });

    let mut seen = HashSet::new();
    let servers: Vec<String> = candidates
        .into_iter()
        .map(|m| server_line(&m.url))
        .filter(|s| seen.insert(s.clone()))
        .take(defaults::MAX_REGION_MIRRORS)
        .collect();

    if servers.is_empty() {
        return Err(ConfigurationError::NoMirrors {
            region: region.to_string(),
        });
    }
    Ok(servers)
}

/// Mirror root to `Server =` value
pub fn server_line(url: &str) -> String {
    if url.contains("$repo") {
        url.to_string()
    } else {
        format!("{}/{REPO_PATH_SUFFIX}", url.trim_end_matches('/'))
    }
}

fn check_mirrorlist(path: &Path) -> Result<(), ConfigurationError> {
    let content = std::fs::read_to_string(path).map_err(|_| ConfigurationError::MirrorPathMissing {
        path: path.to_path_buf(),
    })?;
    let has_server = content.lines().any(|line| {
        line.trim_start()
            .split_once('=')
            .is_some_and(|(key, value)| key.trim() == "Server" && !value.trim().is_empty())
    });
    if has_server {
        Ok(())
    } else {
        Err(ConfigurationError::EmptyMirrorlist {
            path: path.to_path_buf(),
        })
    }
}

/// Locate every `<name>.db` below a local mirror root
fn find_local_databases(root: &Path) -> Result<Vec<LocalDatabase>, ConfigurationError> {
    if !root.is_dir() {
        return Err(ConfigurationError::MirrorPathMissing {
            path: root.to_path_buf(),
        });
    }

    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .max_depth(4)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() || entry.file_type().is_symlink())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| p.extension().is_some_and(|ext| ext == "db"))
        .collect();
    paths.sort();

    // First occurrence of a name wins; pacman rejects duplicate sections
    let mut seen = HashSet::new();
    let mut databases: Vec<LocalDatabase> = paths
        .into_iter()
        .filter_map(|db| {
            let name = db.file_stem()?.to_string_lossy().into_owned();
            let path = db.parent()?.to_path_buf();
            Some(LocalDatabase { name, path })
        })
        .filter(|db| !db.name.is_empty() && seen.insert(db.name.clone()))
        .collect();
    databases.sort_by(|a, b| a.name.cmp(&b.name));

    if databases.is_empty() {
        return Err(ConfigurationError::MirrorPathNoIndex {
            path: root.to_path_buf(),
        });
    }
    tracing::debug!("Local mirror databases: {databases:?}");
    Ok(databases)
}
