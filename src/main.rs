//! archoffline - Build Arch Linux ISOs that install without network access
//!
//! Entry point for the archoffline command-line application.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use archoffline::cli::output::{display_error, log_directive, OutputConfig};
use archoffline::cli::Cli;
use archoffline::error::{exit_codes, PipelineError};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::builder()
        .parse_lossy(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            log_directive(cli.verbose, cli.quiet).to_string()
        }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let output_config = OutputConfig::new(cli.quiet, cli.verbose);
    output_config.apply_global();

    if let Err(e) = cli.run().await {
        display_error(&e);
        let code = e
            .downcast_ref::<PipelineError>()
            .map_or(exit_codes::GENERIC, PipelineError::exit_code);
        std::process::exit(code);
    }
}
