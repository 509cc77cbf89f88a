//! Output formatting and progress indicators
//!
//! Status lines, the stage spinner and the terminal error message.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::error::PipelineError;

static QUIET: AtomicBool = AtomicBool::new(false);
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Global output settings
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    pub quiet: bool,
    pub verbose: bool,
}

impl OutputConfig {
    pub fn new(quiet: bool, verbosity: u8) -> Self {
        Self {
            quiet,
            verbose: verbosity > 0 && !quiet,
        }
    }

    /// Make these settings visible to [`is_quiet`] and [`is_verbose`]
    pub fn apply_global(self) {
        QUIET.store(self.quiet, Ordering::Relaxed);
        VERBOSE.store(self.verbose, Ordering::Relaxed);
    }
}

pub fn is_quiet() -> bool {
    QUIET.load(Ordering::Relaxed)
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Tracing filter for a verbosity level; `RUST_LOG` is applied on top
pub fn log_directive(verbosity: u8, quiet: bool) -> &'static str {
    match (quiet, verbosity) {
        (true, _) => "archoffline=warn",
        (false, 0) => "archoffline=info",
        (false, 1) => "archoffline=debug",
        (false, _) => "archoffline=trace",
    }
}

/// Status message prefixes
pub mod status {
    pub const SUCCESS: &str = "✓";
    pub const ERROR: &str = "✗";
    pub const WARNING: &str = "⚠";
    pub const INFO: &str = "ℹ";
}

pub fn print_success(message: &str) {
    if !is_quiet() {
        println!("{} {message}", status::SUCCESS);
    }
}

pub fn print_info(message: &str) {
    if !is_quiet() {
        println!("{} {message}", status::INFO);
    }
}

pub fn print_warning(message: &str) {
    eprintln!("{} {message}", status::WARNING);
}

/// Indented follow-up line
pub fn print_detail(message: &str) {
    if !is_quiet() {
        println!("  {message}");
    }
}

/// Create a spinner for operations with unknown duration
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.blue} {msg} [{elapsed}]")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Spinner for pipeline stages, only on an interactive, non-verbose terminal
pub fn stage_spinner() -> Option<ProgressBar> {
    (std::io::stderr().is_terminal() && !is_quiet() && !is_verbose())
        .then(|| create_spinner("Starting"))
}

/// Print the single terminal error message
pub fn display_error(error: &anyhow::Error) {
    match error.downcast_ref::<PipelineError>() {
        Some(pipeline) => eprintln!("{} {pipeline}", status::ERROR),
        None => {
            eprintln!("{} {error}", status::ERROR);
            for cause in error.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
        }
    }
}
