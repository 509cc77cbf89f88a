//! Build command implementation
//!
//! Implements `archoffline build`: resolves the layered configuration and
//! runs the pipeline with the real process, network and git backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use crate::cli::output::{print_detail, print_success, stage_spinner};
use crate::core::boot::BootPlan;
use crate::core::config::{load_layers, BuildConfig, Overrides};
use crate::core::pipeline::{Interrupt, Outcome, Pipeline, Services, Stage};
use crate::core::resources::{Prompt, SilentPolicy, TerminalPrompt};
use crate::error::PipelineError;
use crate::infra::dirs::ArchofflineDirs;
use crate::infra::download::DownloadManager;
use crate::infra::git::GitOperations;
use crate::infra::process::SystemRunner;

/// Options of `archoffline build`
#[derive(Args, Debug, Default)]
pub struct BuildArgs {
    /// Project config file (default: ./archoffline.toml when present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// archiso template under /usr/share/archiso/configs
    #[arg(long)]
    pub template: Option<String>,

    /// Name of the embedded repository
    #[arg(long)]
    pub repo: Option<String>,

    /// Build directory
    #[arg(long)]
    pub builddir: Option<PathBuf>,

    /// Mirror region, 'copy', a literal https://... Server line, or file://... mirror root
    #[arg(long, value_name = "SPEC")]
    pub mirrors: Option<String>,

    /// Extra packages, space separated
    #[arg(long)]
    pub packages: Option<String>,

    /// AUR packages, space separated
    #[arg(long)]
    pub aur_packages: Option<String>,

    /// Resources to embed under /root/resources, ';' separated
    #[arg(long)]
    pub resources: Option<String>,

    /// Script run inside the image before it is packed
    #[arg(long, value_name = "PATH")]
    pub customize: Option<PathBuf>,

    /// Command started on the first console at login
    #[arg(long)]
    pub autorun: Option<String>,

    /// Account used to build AUR packages
    #[arg(long)]
    pub aur_user: Option<String>,

    /// Clone archinstall into the image
    #[arg(long)]
    pub archinstall: bool,

    /// archinstall branch
    #[arg(long)]
    pub ai_branch: Option<String>,

    /// archinstall repository URL
    #[arg(long)]
    pub ai_url: Option<String>,

    /// archinstall profiles to add, ',' separated (implies --archinstall)
    #[arg(long)]
    pub profiles: Option<String>,

    /// Build AUR packages even when the AUR does not know them
    #[arg(long)]
    pub skip_validation: bool,

    /// Recreate the build directory
    #[arg(long)]
    pub rebuild: bool,

    /// Stop before mkarchiso for manual changes
    #[arg(long)]
    pub breakpoint: bool,

    /// Keep the package repository across --rebuild
    #[arg(long)]
    pub save_cache: bool,

    /// Never prompt; skip resources that fail
    #[arg(long)]
    pub silent: bool,

    /// Boot the image under QEMU afterwards
    #[arg(long)]
    pub boot: bool,
}

impl BuildArgs {
    fn overrides(self, verbose: bool) -> (Option<PathBuf>, Overrides) {
        let overrides = Overrides {
            template: self.template,
            repo: self.repo,
            builddir: self.builddir,
            mirrors: self.mirrors,
            packages: self.packages,
            aur_packages: self.aur_packages,
            resources: self.resources,
            customize: self.customize,
            autorun: self.autorun,
            aur_user: self.aur_user,
            archinstall: self.archinstall,
            ai_branch: self.ai_branch,
            ai_url: self.ai_url,
            profiles: self.profiles,
            skip_validation: self.skip_validation,
            rebuild: self.rebuild,
            breakpoint: self.breakpoint,
            verbose,
            save_cache: self.save_cache,
            silent: self.silent,
            boot: self.boot,
        };
        (self.config, overrides)
    }
}

/// Resolve the configuration from files and arguments
pub fn resolve_config(cwd: &Path, args: BuildArgs, verbose: bool) -> Result<BuildConfig> {
    let (explicit, overrides) = args.overrides(verbose);
    let explicit = explicit.map(|p| if p.is_absolute() { p } else { cwd.join(p) });
    let config = load_layers(&ArchofflineDirs::new(), explicit.as_deref(), cwd)
        .and_then(|layers| BuildConfig::resolve(layers, overrides, cwd))
        .map_err(|e| PipelineError::new(Stage::Init, e))?;
    Ok(config)
}

/// Execute the build command
pub async fn execute(cwd: &Path, args: BuildArgs, verbose: bool) -> Result<()> {
    let config = resolve_config(cwd, args, verbose)?;
    tracing::debug!("Resolved configuration: {config:?}");

    let runner = Arc::new(SystemRunner::new(config.verbose));
    let prompt: Arc<dyn Prompt> = if config.silent {
        Arc::new(SilentPolicy)
    } else {
        Arc::new(TerminalPrompt)
    };
    let services = Services {
        runner: runner.clone(),
        fetch: Arc::new(DownloadManager::new()),
        cloner: Arc::new(GitOperations::new()),
        prompt,
    };

    let interrupt = Interrupt::new();
    interrupt.listen_for_ctrl_c();

    let boot = config.boot;
    let mut pipeline = Pipeline::new(config, services, interrupt);
    let spinner = stage_spinner();
    if let Some(pb) = spinner.clone() {
        pipeline = pipeline.on_stage(move |stage| pb.set_message(stage.to_string()));
    }
    let dir = pipeline.build_directory().clone();

    let outcome = pipeline.run().await;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    match outcome? {
        Outcome::Breakpoint { tree } => {
            print_success("Stopped at breakpoint");
            print_detail(&format!("Customized tree: {}", tree.display()));
            print_detail("Re-run without --breakpoint to build the image");
        }
        Outcome::Built { iso } => {
            print_success("Build complete!");
            if let Some(iso) = &iso {
                print_detail(&format!("Image: {}", iso.display()));
            }
            if boot {
                match BootPlan::for_build_dir(&dir) {
                    Some(plan) => plan.run(runner.as_ref())?,
                    None => anyhow::bail!("No image found in {}", dir.out_dir().display()),
                }
            }
        }
    }
    Ok(())
}
