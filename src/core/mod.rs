//! Build pipeline components
//!
//! - [`config`] - Layered build configuration
//! - [`builddir`] - Build directory layout, classification and stamps
//! - [`mirror`] - Mirror specification resolution
//! - [`resources`] - Resource staging
//! - [`packages`] - Pre-built package synchronisation
//! - [`build_user`] - Transient build user and sudoers grant
//! - [`aur`] - AUR resolution and source builds
//! - [`repository`] - Local repository assembly
//! - [`customize`] - Image tree customization
//! - [`pipeline`] - Build orchestration
//! - [`boot`] - QEMU boot test
//! - [`clean`] - Build directory removal
//! - [`doctor`] - Host tool checks

pub mod aur;
pub mod boot;
pub mod build_user;
pub mod builddir;
pub mod clean;
pub mod config;
pub mod customize;
pub mod doctor;
pub mod mirror;
pub mod packages;
pub mod pipeline;
pub mod repository;
pub mod resources;
