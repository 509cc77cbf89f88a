//! CLI command for `archoffline clean`

use anyhow::{Context, Result};

use crate::cli::commands::BuildDirArgs;
use crate::cli::output::{print_detail, print_success};
use crate::core::builddir::BuildDirectory;
use crate::core::clean::clean;

/// Execute the clean command
pub fn execute(target: &BuildDirArgs, keep_cache: bool) -> Result<()> {
    let dir = BuildDirectory::new(std::env::current_dir()?.join(&target.builddir), &target.repo);
    let result = clean(&dir, keep_cache)
        .with_context(|| format!("Failed to clean {}", dir.root().display()))?;

    if !result.removed {
        print_success("Nothing to clean");
    } else if result.kept_cache {
        print_success(&format!("Cleaned {}", dir.root().display()));
        print_detail(&format!(
            "Repository kept in {}",
            dir.saved_repo_dir().display()
        ));
    } else {
        print_success(&format!("Removed {}", dir.root().display()));
    }
    Ok(())
}
