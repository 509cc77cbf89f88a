//! CLI command for `archoffline boot`

use anyhow::{bail, Result};

use crate::cli::commands::BuildDirArgs;
use crate::core::boot::BootPlan;
use crate::core::builddir::BuildDirectory;
use crate::infra::process::SystemRunner;

/// Execute the boot command
pub fn execute(target: &BuildDirArgs, verbose: bool) -> Result<()> {
    let dir = BuildDirectory::new(std::env::current_dir()?.join(&target.builddir), &target.repo);
    let Some(plan) = BootPlan::for_build_dir(&dir) else {
        bail!(
            "No image found in {}. Run 'archoffline build' first.",
            dir.out_dir().display()
        );
    };
    plan.run(&SystemRunner::new(verbose))?;
    Ok(())
}
