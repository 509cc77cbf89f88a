//! Configuration constants
//!
//! Built-in defaults and well-known upstream URLs. Runtime configuration
//! (files and command-line overrides) lives in [`crate::core::config`].

pub mod defaults;
pub mod urls;
