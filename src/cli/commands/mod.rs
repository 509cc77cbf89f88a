//! CLI command implementations
//!
//! Each command is implemented in its own submodule.

pub mod boot;
pub mod build;
pub mod clean;
pub mod doctor;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::defaults;

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an offline installation image
    Build(Box<build::BuildArgs>),

    /// Boot the most recent image under QEMU
    Boot(BuildDirArgs),

    /// Remove the build directory
    Clean {
        #[command(flatten)]
        target: BuildDirArgs,

        /// Keep the package repository for the next build
        #[arg(long)]
        keep_cache: bool,
    },

    /// Check host tools
    Doctor,
}

/// Selects an existing build directory
#[derive(Args, Debug, Clone)]
pub struct BuildDirArgs {
    /// Build directory
    #[arg(long, default_value = defaults::DEFAULT_BUILD_DIR)]
    pub builddir: PathBuf,

    /// Repository name used in the build
    #[arg(long, default_value = defaults::DEFAULT_REPO_NAME)]
    pub repo: String,
}

impl Commands {
    /// Execute the command
    pub async fn run(self, verbosity: u8, quiet: bool) -> Result<()> {
        match self {
            Self::Build(args) => {
                let current_dir = std::env::current_dir()?;
                build::execute(&current_dir, *args, verbosity > 0 && !quiet).await
            }
            Self::Boot(target) => boot::execute(&target, verbosity > 0),
            Self::Clean { target, keep_cache } => clean::execute(&target, keep_cache),
            Self::Doctor => doctor::execute(),
        }
    }
}
