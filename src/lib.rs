//! archoffline - Build Arch Linux ISOs that install without network access
//!
//! Adapts an archiso template so the produced image carries a complete
//! local package repository, optional AUR builds, resources and an
//! installer, and can install a system with no network at all.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface parsing and output formatting
//! - [`core`] - Pipeline components and the build orchestrator
//! - [`infra`] - Infrastructure layer (network, filesystem, processes, git)
//! - [`config`] - Built-in defaults and upstream URLs
//! - [`error`] - Error taxonomy and exit codes

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod infra;

#[cfg(test)]
pub mod test_utils;
