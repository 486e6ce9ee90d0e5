//! The build state machine.
//!
//! A [`Variant`] supplies an ordered list of [`Step`]s. The machine runs a
//! contiguous slice of that list against a shared [`Build`], persisting
//! [`ResumeMetadata`] after every completed step so a later `--resume` can
//! pick up where the run stopped.
//!
//! ```text
//! setup      validate flags, pick workspace, load resume metadata
//! run        steps[start..end], metadata saved after each one
//! teardown   unmount strays, unwind releases, drop implicit workspace
//! ```

pub mod options;
pub mod release;
pub mod resume;
pub mod step;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub use options::CommonOptions;
pub use release::{Release, ReleaseStack};
pub use resume::ResumeMetadata;
pub use step::Step;

use crate::config::Config;
use crate::gadget::GadgetInfo;
use crate::sysops::SystemOps;
use crate::timing::Timer;
use crate::variant::Variant;

/// Log target for step banners.
pub const STEP_TARGET: &str = "recimg::step";

/// Directory tree a build works in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub root: PathBuf,
    /// Assembled root filesystem.
    pub rootfs: PathBuf,
    /// Gadget tree and variant inputs.
    pub unpack: PathBuf,
    /// Per-volume staging directories and partition images.
    pub volumes: PathBuf,
    /// Mount points and other throwaway paths.
    pub scratch: PathBuf,
    /// Given with `--workdir`; never deleted at teardown.
    pub explicit: bool,
}

impl Workspace {
    pub fn new(root: PathBuf, explicit: bool) -> Self {
        Self {
            rootfs: root.join("root"),
            unpack: root.join("unpack"),
            volumes: root.join("volumes"),
            scratch: root.join("scratch"),
            root,
            explicit,
        }
    }

    /// Throwaway workspace under the system temp directory.
    pub fn implicit() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let root = std::env::temp_dir().join(format!("recimg-{}-{}", std::process::id(), nanos));
        Self::new(root, false)
    }

    pub fn all(&self) -> [&Path; 5] {
        [
            &self.root,
            &self.rootfs,
            &self.unpack,
            &self.volumes,
            &self.scratch,
        ]
    }
}

/// Everything steps read and write. Persisted between resumed runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildState {
    pub workspace: Workspace,
    pub gadget_dir: Option<PathBuf>,
    /// Directory copied into the workspace rootfs.
    pub rootfs_source: Option<PathBuf>,
    pub gadget: Option<GadgetInfo>,
    pub seeded: bool,
    /// Resolved size of the primary structure.
    pub rootfs_size: u64,
    /// `--image-size` floors keyed by volume name.
    pub image_sizes: BTreeMap<String, u64>,
    pub sector_size: u64,
    /// Output file name per volume.
    pub volume_names: BTreeMap<String, String>,
    pub output_dir: Option<PathBuf>,
    pub series: Option<String>,
    pub architecture: Option<String>,
    /// MBR disk signatures already issued in this build.
    pub used_disk_ids: Vec<u32>,
}

impl BuildState {
    pub fn new(workspace: Workspace, sector_size: u64) -> Self {
        Self {
            workspace,
            gadget_dir: None,
            rootfs_source: None,
            gadget: None,
            seeded: false,
            rootfs_size: 0,
            image_sizes: BTreeMap::new(),
            sector_size,
            volume_names: BTreeMap::new(),
            output_dir: None,
            series: None,
            architecture: None,
            used_disk_ids: Vec::new(),
        }
    }

    /// The loaded gadget; an error before `load_gadget` has run.
    pub fn gadget(&self) -> Result<&GadgetInfo> {
        self.gadget
            .as_ref()
            .ok_or_else(|| anyhow!("gadget has not been loaded (load_gadget must run first)"))
    }

    pub fn gadget_dir(&self) -> PathBuf {
        self.gadget_dir
            .clone()
            .unwrap_or_else(|| self.workspace.unpack.join("gadget"))
    }

    pub fn volume_dir(&self, volume: &str) -> PathBuf {
        self.workspace.volumes.join(volume)
    }

    /// The image's `boot/` directory, after the rootfs has been populated.
    pub fn boot_dir(&self) -> PathBuf {
        self.workspace.rootfs.join("boot")
    }

    pub fn image_name(&self, volume: &str) -> String {
        self.volume_names
            .get(volume)
            .cloned()
            .unwrap_or_else(|| format!("{volume}.img"))
    }
}

/// What a step gets to work with.
pub struct Build<'a> {
    pub state: BuildState,
    pub options: CommonOptions,
    pub config: Config,
    pub ops: &'a dyn SystemOps,
    pub releases: ReleaseStack,
}

pub struct StateMachine<'a> {
    variant: &'a dyn Variant,
    steps: Vec<Step<'a>>,
    build: Build<'a>,
    /// Mounts under the workspace that predate this run.
    baseline_mounts: Vec<PathBuf>,
    start: usize,
    end: usize,
}

impl<'a> StateMachine<'a> {
    /// Validate options and prepare the workspace.
    ///
    /// Configuration and resume errors surface here, before anything on
    /// disk changes.
    pub fn setup(
        variant: &'a dyn Variant,
        options: CommonOptions,
        config: Config,
        ops: &'a dyn SystemOps,
    ) -> Result<Self> {
        let steps = variant.steps();
        let names: Vec<&str> = steps.iter().map(|s| s.name).collect();
        options.validate(&names)?;

        let workspace = match &options.workdir {
            Some(dir) => Workspace::new(dir.clone(), true),
            None => Workspace::implicit(),
        };

        let (state, start) = if options.resume {
            let metadata = ResumeMetadata::load(&workspace.root, variant.name(), &names)?;
            tracing::info!(
                "Resuming {} build in {} at step {}",
                variant.name(),
                workspace.root.display(),
                names.get(metadata.next_step).copied().unwrap_or("(done)")
            );
            (metadata.state, metadata.next_step)
        } else {
            (BuildState::new(workspace, options.sector_size), 0)
        };

        let end = match (&options.until, &options.thru) {
            (Some(name), _) => step::position(&steps, name).unwrap_or(steps.len()),
            (_, Some(name)) => step::position(&steps, name).map_or(steps.len(), |i| i + 1),
            _ => steps.len(),
        };

        let root = state.workspace.root.clone();
        let baseline_mounts = match ops.mount_table() {
            Ok(table) => release::mounts_under(&table, &root),
            Err(e) => {
                tracing::warn!("Could not read mount table: {}", e);
                Vec::new()
            }
        };

        if !options.dry_run {
            ops.create_dir_all(&root)
                .with_context(|| format!("Failed to create workdir {}", root.display()))?;
        }
        tracing::debug!("workdir: {}", root.display());

        Ok(Self {
            variant,
            steps,
            build: Build {
                state,
                options,
                config,
                ops,
                releases: ReleaseStack::new(),
            },
            baseline_mounts,
            start,
            end,
        })
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }

    pub fn state(&self) -> &BuildState {
        &self.build.state
    }

    /// Run the selected slice of steps.
    pub fn run(&mut self) -> Result<()> {
        let total = self.steps.len();
        if self.start >= self.end {
            tracing::info!("Nothing to do: all selected steps have completed");
            return Ok(());
        }

        for index in self.start..self.end {
            let step = &self.steps[index];
            tracing::info!(target: STEP_TARGET, "[{}/{}] {}", index + 1, total, step.name);
            if self.build.options.dry_run {
                continue;
            }

            let timer = Timer::start(step.name);
            step.run(&mut self.build)
                .with_context(|| format!("step '{}' failed", step.name))?;
            timer.finish();

            self.persist(index + 1)?;
        }

        if self.end < total {
            tracing::info!(
                "Stopped before '{}'; continue with --resume --workdir {}",
                self.steps[self.end].name,
                self.build.state.workspace.root.display()
            );
        }
        Ok(())
    }

    fn persist(&self, next_step: usize) -> Result<()> {
        let names = self.step_names();
        ResumeMetadata::new(self.variant.name(), &names, next_step, self.build.state.clone())
            .save(self.build.ops, &self.build.state.workspace.root)
    }

    /// Release everything the run acquired and fold cleanup failures into
    /// `outcome`.
    pub fn teardown(mut self, outcome: Result<()>) -> Result<()> {
        let ops = self.build.ops;
        let workspace = self.build.state.workspace.clone();
        let mut cleanup = Vec::new();

        match ops.mount_table() {
            Ok(table) => {
                let tracked: Vec<PathBuf> = self
                    .build
                    .releases
                    .tracked_mounts()
                    .map(Path::to_path_buf)
                    .collect();
                for mount in release::mounts_under(&table, &workspace.root) {
                    if self.baseline_mounts.contains(&mount) || tracked.contains(&mount) {
                        continue;
                    }
                    tracing::warn!("Unmounting leftover mount {}", mount.display());
                    if let Err(e) = Release::Unmount(mount).run(ops) {
                        cleanup.push(e);
                    }
                }
            }
            Err(e) => tracing::warn!("Could not read mount table: {}", e),
        }

        cleanup.extend(self.build.releases.unwind_all(ops));

        if !workspace.explicit && workspace.root.exists() {
            if let Err(e) = ops.remove_dir_all(&workspace.root) {
                cleanup.push(anyhow!(
                    "Failed to remove workdir {}: {}",
                    workspace.root.display(),
                    e
                ));
            }
        }

        release::join_errors(outcome, cleanup)
    }
}

/// Setup, run and teardown in one call.
pub fn execute(
    variant: &dyn Variant,
    options: CommonOptions,
    config: Config,
    ops: &dyn SystemOps,
) -> Result<()> {
    let mut machine = StateMachine::setup(variant, options, config, ops)?;
    let outcome = machine.run();
    machine.teardown(outcome)
}

/// Fail unless `path` is an existing directory.
pub fn require_dir(path: &Path, what: &str) -> Result<()> {
    if !path.is_dir() {
        bail!("{} {} does not exist or is not a directory", what, path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Cmd, CommandResult};
    use crate::sysops::HostOps;
    use std::cell::{Cell, RefCell};
    use std::fs;

    struct Recording {
        log: RefCell<Vec<String>>,
        mounts: RefCell<String>,
    }

    impl SystemOps for Recording {
        fn run(&self, cmd: Cmd) -> Result<CommandResult> {
            self.log.borrow_mut().push(cmd.command_line());
            HostOps.run(Cmd::new("true"))
        }

        fn mount_table(&self) -> std::io::Result<String> {
            Ok(self.mounts.borrow().clone())
        }
    }

    fn recording() -> Recording {
        Recording {
            log: RefCell::new(Vec::new()),
            mounts: RefCell::new(String::new()),
        }
    }

    struct Counter {
        fail_at: Option<&'static str>,
        ran: RefCell<Vec<&'static str>>,
        calls: Cell<usize>,
    }

    impl Counter {
        fn new(fail_at: Option<&'static str>) -> Self {
            Self {
                fail_at,
                ran: RefCell::new(Vec::new()),
                calls: Cell::new(0),
            }
        }

        fn touch(&self, name: &'static str, build: &mut Build<'_>) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.fail_at == Some(name) {
                bail!("{name} exploded");
            }
            self.ran.borrow_mut().push(name);
            build.state.rootfs_size += 1;
            Ok(())
        }
    }

    impl Variant for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn steps(&self) -> Vec<Step<'_>> {
            ["one", "two", "three"]
                .into_iter()
                .map(|name| Step::new(name, move |b| self.touch(name, b)))
                .collect()
        }
    }

    fn options(workdir: &Path) -> CommonOptions {
        CommonOptions {
            workdir: Some(workdir.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_until_stops_before_and_resume_finishes() {
        let temp = tempfile::tempdir().unwrap();
        let work = temp.path().join("work");
        let ops = recording();

        let first = Counter::new(None);
        execute(
            &first,
            CommonOptions {
                until: Some("three".into()),
                ..options(&work)
            },
            Config::default(),
            &ops,
        )
        .unwrap();
        assert_eq!(*first.ran.borrow(), vec!["one", "two"]);

        let second = Counter::new(None);
        let mut machine = StateMachine::setup(
            &second,
            CommonOptions {
                resume: true,
                ..options(&work)
            },
            Config::default(),
            &ops,
        )
        .unwrap();
        machine.run().unwrap();
        assert_eq!(machine.state().rootfs_size, 3);
        machine.teardown(Ok(())).unwrap();
        assert_eq!(*second.ran.borrow(), vec!["three"]);
        assert!(work.exists());
    }

    #[test]
    fn test_thru_is_inclusive() {
        let temp = tempfile::tempdir().unwrap();
        let counter = Counter::new(None);
        execute(
            &counter,
            CommonOptions {
                thru: Some("two".into()),
                ..options(temp.path())
            },
            Config::default(),
            &recording(),
        )
        .unwrap();
        assert_eq!(*counter.ran.borrow(), vec!["one", "two"]);
    }

    #[test]
    fn test_failed_step_keeps_metadata_for_retry() {
        let temp = tempfile::tempdir().unwrap();
        let failing = Counter::new(Some("two"));
        let err = execute(&failing, options(temp.path()), Config::default(), &recording())
            .unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("step 'two' failed"), "{chain}");
        assert!(chain.contains("two exploded"), "{chain}");

        let metadata =
            ResumeMetadata::load(temp.path(), "counter", &["one", "two", "three"]).unwrap();
        assert_eq!(metadata.next_step, 1);
    }

    #[test]
    fn test_resume_without_prior_run() {
        let temp = tempfile::tempdir().unwrap();
        let counter = Counter::new(None);
        let err = StateMachine::setup(
            &counter,
            CommonOptions {
                resume: true,
                ..options(temp.path())
            },
            Config::default(),
            &recording(),
        )
        .err().unwrap();
        assert!(err.downcast_ref::<crate::error::ResumeError>().is_some());
        assert_eq!(counter.calls.get(), 0);
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let work = temp.path().join("work");
        let counter = Counter::new(None);
        execute(
            &counter,
            CommonOptions {
                dry_run: true,
                ..options(&work)
            },
            Config::default(),
            &recording(),
        )
        .unwrap();
        assert_eq!(counter.calls.get(), 0);
        assert!(!work.exists());
    }

    #[test]
    fn test_teardown_unmounts_new_mounts_then_releases() {
        let temp = tempfile::tempdir().unwrap();
        let work = temp.path().to_path_buf();
        let ops = recording();
        let counter = Counter::new(None);

        let mut machine =
            StateMachine::setup(&counter, options(&work), Config::default(), &ops).unwrap();
        let w = work.display();
        *ops.mounts.borrow_mut() = format!(
            "/dev/loop9p2 {w}/scratch/loopback ext4 rw 0 0\nproc {w}/scratch/loopback/proc proc rw 0 0\n"
        );
        machine.build.releases.push(Release::DetachLoop("/dev/loop9".into()));
        machine
            .build
            .releases
            .push(Release::Unmount(work.join("scratch/loopback")));

        machine.teardown(Ok(())).unwrap();

        assert_eq!(
            *ops.log.borrow(),
            vec![
                format!("umount {w}/scratch/loopback/proc"),
                format!("umount {w}/scratch/loopback"),
                "losetup --detach /dev/loop9".to_string(),
            ]
        );
    }

    #[test]
    fn test_implicit_workspace_is_removed() {
        let counter = Counter::new(None);
        let ops = recording();
        let mut machine =
            StateMachine::setup(&counter, CommonOptions::default(), Config::default(), &ops)
                .unwrap();
        let root = machine.state().workspace.root.clone();
        assert!(root.is_dir());
        fs::write(root.join("marker"), "x").unwrap();

        machine.run().unwrap();
        machine.teardown(Ok(())).unwrap();
        assert!(!root.exists());
    }
}
