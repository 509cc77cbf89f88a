//! Build orchestration
//!
//! Drives one build through its stages:
//!
//! ```text
//! Init → Preparing → ResolvingInputs → BuildingPackages → AssemblingRepository
//!      → CustomizingTree → [Breakpoint] → Invoking → Done
//! ```
//!
//! Components raise their own errors; this module alone decides what is
//! fatal, tears down the build user and attaches the failing [`Stage`].

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::aur::{self, AurSpec, SourceBuilder};
use crate::core::build_user::{BuildUser, BuildUserManager};
use crate::core::builddir::{self, BuildDirectory, DirState};
use crate::core::config::BuildConfig;
use crate::core::customize::Customizer;
use crate::core::mirror::{self, MirrorDescriptor};
use crate::core::packages::{self, PackageSync};
use crate::core::repository::{BuiltArtifact, IndexState, LocalRepository};
use crate::core::resources::{Prompt, ResourceFetcher, StagedResource};
use crate::error::{ConfigurationError, ErrorKind, PipelineError, TeardownError};
use crate::infra::download::{compute_checksum, Fetch};
use crate::infra::filesystem;
use crate::infra::git::RepoCloner;
use crate::infra::lock::BuildLock;
use crate::infra::process::{CommandRunner, CommandSpec};

const PACKAGES_STAMP: &str = "packages";

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Init,
    Preparing,
    ResolvingInputs,
    BuildingPackages,
    AssemblingRepository,
    CustomizingTree,
    Breakpoint,
    Invoking,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "Initialization",
            Self::Preparing => "Preparing build directory",
            Self::ResolvingInputs => "Resolving inputs",
            Self::BuildingPackages => "Building packages",
            Self::AssemblingRepository => "Assembling repository",
            Self::CustomizingTree => "Customizing image tree",
            Self::Breakpoint => "Breakpoint",
            Self::Invoking => "Building image",
            Self::Done => "Done",
        };
        f.write_str(name)
    }
}

/// How a successful run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The image builder succeeded
    Built {
        /// Newest image in the output directory
        iso: Option<PathBuf>,
    },
    /// Stopped before the image builder for manual inspection
    Breakpoint {
        /// Customized tree to inspect
        tree: PathBuf,
    },
}

/// Operator interrupt, shared with a signal listener
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Trigger on Ctrl-C
    ///
    /// Child processes receive the signal themselves; the pipeline notices
    /// the flag at the next step boundary or when the child fails.
    pub fn listen_for_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping after the current step");
                flag.trigger();
            }
        });
    }
}

/// External capabilities the pipeline drives
#[derive(Clone)]
pub struct Services {
    pub runner: Arc<dyn CommandRunner>,
    pub fetch: Arc<dyn Fetch>,
    pub cloner: Arc<dyn RepoCloner>,
    pub prompt: Arc<dyn Prompt>,
}

/// Package-set record that lets a resumed run skip synchronisation
#[derive(Debug, Serialize, Deserialize)]
struct PackageStamp {
    digest: String,
    promoted: Vec<String>,
}

struct PackagePlan {
    digest: String,
    prebuilt: Vec<String>,
    promoted: Vec<String>,
    synced: bool,
}

struct Inputs {
    resources: Vec<StagedResource>,
    plan: PackagePlan,
    aur: Vec<AurSpec>,
}

type StageObserver = Box<dyn Fn(Stage) + Send + Sync>;

/// One build run
pub struct Pipeline {
    config: BuildConfig,
    services: Services,
    dir: BuildDirectory,
    interrupt: Interrupt,
    observer: Option<StageObserver>,
    stage: Stage,
    lock: Option<BuildLock>,
    teardown: Option<TeardownError>,
}

impl Pipeline {
    pub fn new(config: BuildConfig, services: Services, interrupt: Interrupt) -> Self {
        let dir = BuildDirectory::new(config.build_dir.clone(), &config.repo_name);
        Self {
            config,
            services,
            dir,
            interrupt,
            observer: None,
            stage: Stage::Init,
            lock: None,
            teardown: None,
        }
    }

    /// Call `observer` on every stage transition
    #[must_use]
    pub fn on_stage(mut self, observer: impl Fn(Stage) + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn build_directory(&self) -> &BuildDirectory {
        &self.dir
    }

    /// Run to completion, the breakpoint, or the first fatal error
    pub async fn run(mut self) -> Result<Outcome, PipelineError> {
        let result = self.execute().await;
        let stage = self.stage;
        let teardown = self.teardown.take();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(kind) => {
                let kind = if self.interrupt.is_triggered() {
                    tracing::debug!("Failure after interrupt: {kind}");
                    ErrorKind::Interrupted
                } else {
                    kind
                };
                if matches!(kind, ErrorKind::Interrupted) && stage >= Stage::BuildingPackages {
                    let reason = format!("interrupted during '{stage}'");
                    if let Err(e) = self.dir.mark_needs_rebuild(&reason) {
                        tracing::warn!("Could not mark build directory for rebuild: {e}");
                    }
                }
                return Err(PipelineError::new(stage, kind).with_teardown(teardown));
            }
        };

        // The image is usable, but leftover privileges still fail the run
        match teardown {
            Some(teardown) => Err(PipelineError::new(Stage::BuildingPackages, teardown)),
            None => Ok(outcome),
        }
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        tracing::debug!("Entering stage: {stage}");
        if let Some(observer) = &self.observer {
            observer(stage);
        }
    }

    fn checkpoint(&self) -> Result<(), ErrorKind> {
        if self.interrupt.is_triggered() {
            return Err(ErrorKind::Interrupted);
        }
        Ok(())
    }

    async fn execute(&mut self) -> Result<Outcome, ErrorKind> {
        self.enter(Stage::Init);
        check_root(self.services.runner.as_ref())?;

        self.enter(Stage::Preparing);
        self.prepare()?;
        self.checkpoint()?;

        self.enter(Stage::ResolvingInputs);
        let inputs = self.resolve_inputs().await?;
        self.checkpoint()?;

        self.enter(Stage::BuildingPackages);
        let built = self.build_packages(&inputs).await?;
        self.checkpoint()?;

        self.enter(Stage::AssemblingRepository);
        self.assemble(&built)?;
        self.checkpoint()?;

        self.enter(Stage::CustomizingTree);
        Customizer::new(&self.config, &self.dir, self.services.cloner.as_ref())
            .apply(&inputs.resources)?;
        self.checkpoint()?;

        if self.config.breakpoint {
            self.enter(Stage::Breakpoint);
            let tree = self.dir.template_dir();
            tracing::info!(
                "Breakpoint reached. Inspect or edit {} and re-run without --breakpoint to build the image",
                tree.display()
            );
            return Ok(Outcome::Breakpoint { tree });
        }

        self.enter(Stage::Invoking);
        let iso = self.invoke()?;

        self.enter(Stage::Done);
        Ok(Outcome::Built { iso })
    }

    fn prepare(&mut self) -> Result<(), ErrorKind> {
        let command = std::env::args().collect::<Vec<_>>().join(" ");
        let lock = BuildLock::acquire(self.dir.root(), &command).map_err(ConfigurationError::from)?;
        self.lock = Some(lock);

        let template_source = self.config.template_dir();
        let state = self.dir.classify();
        tracing::debug!("Build directory state: {state:?}");

        let fresh = if self.config.rebuild {
            if self.config.save_cache {
                LocalRepository::save(&self.dir.repo_dir(), &self.dir.saved_repo_dir())?;
            }
            builddir::validate_template(&template_source)?;
            self.dir.wipe()?;
            true
        } else {
            match state {
                DirState::Fresh => {
                    builddir::validate_template(&template_source)?;
                    true
                }
                DirState::Resumed => {
                    tracing::info!("Resuming build in {}", self.dir.root().display());
                    false
                }
                DirState::Invalid { reason } => {
                    return Err(ConfigurationError::NeedsRebuild {
                        path: self.dir.root().to_path_buf(),
                        reason,
                    }
                    .into());
                }
            }
        };

        self.dir.create_layout()?;
        if fresh {
            self.dir.install_template(&template_source)?;
        }
        LocalRepository::restore(&self.dir.saved_repo_dir(), &self.dir.repo_dir())?;
        Ok(())
    }

    async fn resolve_inputs(&self) -> Result<Inputs, ErrorKind> {
        let fetch = self.services.fetch.as_ref();
        let fetcher = ResourceFetcher::new(
            fetch,
            Arc::clone(&self.services.cloner),
            self.dir.resources_dir(),
        );

        let (mirror, report) = tokio::join!(
            mirror::resolve(
                self.config.mirror.as_deref(),
                fetch,
                &self.config.system_mirrorlist
            ),
            fetcher.fetch_all(&self.config.resources, self.services.prompt.as_ref()),
        );
        let mirror = mirror?;
        let report = report?;
        tracing::info!("Using {}", mirror.summary());

        let plan = self.plan_packages(&mirror)?;
        self.checkpoint()?;

        let pending: Vec<String> =
            packages::merge_package_lists(&self.config.aur_packages, &plan.promoted)
                .into_iter()
                .filter(|name| {
                    let done = self.aur_complete(name);
                    if done {
                        tracing::info!("AUR package {name} already built, skipping");
                    }
                    !done
                })
                .collect();
        let aur = aur::resolve(fetch, &pending, self.config.skip_validation).await?;

        Ok(Inputs {
            resources: report.staged,
            plan,
            aur,
        })
    }

    /// Render the build-time pacman.conf and split requested packages
    fn plan_packages(&self, mirror: &MirrorDescriptor) -> Result<PackagePlan, ErrorKind> {
        let conf = mirror.render_pacman_conf(&self.dir.pacdb_dir(), &self.dir.repo_dir());
        filesystem::write_file_atomic(&self.dir.pacman_conf(), &conf)?;

        let digest = compute_checksum(format!("{}\n{conf}", self.config.packages.join(" ")).as_bytes());
        let recorded = self
            .dir
            .stamp(PACKAGES_STAMP)
            .and_then(|s| serde_json::from_str::<PackageStamp>(&s).ok());
        if let Some(stamp) = recorded.filter(|s| s.digest == digest) {
            tracing::info!("Package set unchanged, skipping synchronisation");
            return Ok(PackagePlan {
                digest,
                prebuilt: Vec::new(),
                promoted: stamp.promoted,
                synced: true,
            });
        }

        let sync = PackageSync::new(self.services.runner.as_ref(), self.dir.pacman_conf());
        sync.refresh()?;
        let (prebuilt, promoted) = sync.partition(&self.config.packages)?;
        for name in &promoted {
            tracing::warn!("'{name}' is not in the official repositories, building it from the AUR");
        }
        Ok(PackagePlan {
            digest,
            prebuilt,
            promoted,
            synced: false,
        })
    }

    fn aur_complete(&self, name: &str) -> bool {
        let Some(files) = self.dir.stamp(&aur_stamp(name)) else {
            return false;
        };
        let files: Vec<&str> = files.lines().filter(|l| !l.trim().is_empty()).collect();
        !files.is_empty() && files.iter().all(|f| self.dir.repo_dir().join(f).is_file())
    }

    async fn build_packages(&mut self, inputs: &Inputs) -> Result<Vec<BuiltArtifact>, ErrorKind> {
        let plan = &inputs.plan;
        if !plan.synced {
            let list = packages::update_package_list(
                &self.dir.template_dir().join("packages.x86_64"),
                &plan.prebuilt,
            )?;
            PackageSync::new(self.services.runner.as_ref(), self.dir.pacman_conf()).download(&list)?;

            let stamp = PackageStamp {
                digest: plan.digest.clone(),
                promoted: plan.promoted.clone(),
            };
            self.dir.write_json_stamp(PACKAGES_STAMP, &stamp)?;
        }

        if inputs.aur.is_empty() {
            return Ok(Vec::new());
        }

        let manager = BuildUserManager::new(
            Arc::clone(&self.services.runner),
            self.config.sudoers_file.clone(),
            self.config.sudoers_dir.clone(),
            self.dir.build_user_record(),
        );
        let guard = manager.acquire(&self.config.build_user)?;
        let result = self.build_aur(guard.user(), &inputs.aur).await;
        if let Err(e) = guard.release() {
            tracing::error!("{e}");
            self.teardown = Some(e);
        }
        result
    }

    async fn build_aur(
        &self,
        user: &BuildUser,
        specs: &[AurSpec],
    ) -> Result<Vec<BuiltArtifact>, ErrorKind> {
        let builder = SourceBuilder::new(
            self.services.runner.as_ref(),
            self.services.fetch.as_ref(),
            user,
        );
        let mut built = Vec::new();
        for spec in specs {
            self.checkpoint()?;
            let artifact = builder.build(spec).await?;

            // The build user's home may be removed on release
            let target = self.dir.artifacts_dir().join(&spec.name);
            let mut files = Vec::new();
            for file in &artifact.files {
                let Some(name) = file.file_name() else {
                    continue;
                };
                filesystem::move_path(file, &target.join(name))?;
                files.push(target.join(name));
            }
            builder.cleanup(spec);
            built.push(BuiltArtifact {
                package: artifact.package,
                files,
            });
        }
        Ok(built)
    }

    fn assemble(&self, built: &[BuiltArtifact]) -> Result<(), ErrorKind> {
        let mut repo = LocalRepository::open(
            &self.config.repo_name,
            self.dir.repo_dir(),
            self.dir.index_stamp(),
            Arc::clone(&self.services.runner),
        )?;

        for artifact in built {
            repo.add(artifact)?;
            let names: Vec<String> = artifact
                .files
                .iter()
                .filter_map(|f| f.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect();
            self.dir
                .write_stamp(&aur_stamp(&artifact.package), &names.join("\n"))?;
        }
        filesystem::remove_path(&self.dir.artifacts_dir())?;

        match repo.finalize()? {
            IndexState::Regenerated => tracing::info!("Repository [{}] indexed", repo.name()),
            IndexState::UpToDate => tracing::info!("Repository [{}] unchanged", repo.name()),
        }
        Ok(())
    }

    fn invoke(&self) -> Result<Option<PathBuf>, ErrorKind> {
        // mkarchiso resumes from its own stamps in work/, which would ignore tree changes
        filesystem::remove_path(&self.dir.work_dir())?;

        let mkarchiso = CommandSpec::new("mkarchiso")
            .arg("-C")
            .arg(self.dir.pacman_conf())
            .arg("-v")
            .arg("-w")
            .arg(self.dir.work_dir())
            .arg("-o")
            .arg(self.dir.out_dir())
            .arg(self.dir.template_dir())
            .current_dir(self.dir.root());
        tracing::info!("Running mkarchiso (this takes a while)");
        self.services.runner.run(&mkarchiso)?.check("mkarchiso")?;

        let iso = self.dir.latest_iso();
        match &iso {
            Some(path) => tracing::info!("Image written to {}", path.display()),
            None => tracing::warn!("mkarchiso succeeded but no image was found in {}", self.dir.out_dir().display()),
        }
        Ok(iso)
    }
}

fn aur_stamp(name: &str) -> String {
    format!("aur-{name}")
}

/// Fail unless running with uid 0
pub fn check_root(runner: &dyn CommandRunner) -> Result<(), ConfigurationError> {
    let uid = runner
        .run(&CommandSpec::new("id").arg("-u").capture())
        .map(|o| o.stdout.trim().to_string())
        .unwrap_or_default();
    if uid == "0" {
        Ok(())
    } else {
        Err(ConfigurationError::NotRoot {
            uid: if uid.is_empty() { "unknown".to_string() } else { uid },
        })
    }
}
