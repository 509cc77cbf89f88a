//! Platform-specific directory management
//!
//! Locates the global configuration directory. Follows the XDG Base
//! Directory Specification; `ARCHOFFLINE_CONFIG_DIR` overrides it.

use std::env;
use std::path::PathBuf;

/// Environment variable overriding the config directory
pub const ENV_CONFIG_DIR: &str = "ARCHOFFLINE_CONFIG_DIR";

/// Application name used in directory paths
const APP_NAME: &str = "archoffline";

/// Directory provider for archoffline
#[derive(Debug, Clone)]
pub struct ArchofflineDirs {
    config_dir: PathBuf,
}

impl ArchofflineDirs {
    /// Resolve directories from the environment or platform defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            config_dir: Self::resolve_config_dir(),
        }
    }

    /// Use an explicit config directory
    #[must_use]
    pub fn with_config_dir(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    /// Get the config directory path
    ///
    /// - Linux: `$XDG_CONFIG_HOME/archoffline` or `~/.config/archoffline`
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone()
    }

    /// Path of the global `config.toml`
    #[must_use]
    pub fn global_config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    fn resolve_config_dir() -> PathBuf {
        if let Ok(path) = env::var(ENV_CONFIG_DIR) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .map(|p| p.join(APP_NAME))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".config").join(APP_NAME))
                    .unwrap_or_else(|| PathBuf::from(".").join(".config").join(APP_NAME))
            })
    }
}

impl Default for ArchofflineDirs {
    fn default() -> Self {
        Self::new()
    }
}
