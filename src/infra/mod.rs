//! Infrastructure layer
//!
//! Handles all I/O operations: network, filesystem, locking, and external
//! processes. This module is the only place where side effects occur.

pub mod dirs;
pub mod download;
pub mod filesystem;
pub mod git;
pub mod lock;
pub mod process;
