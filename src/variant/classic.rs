//! Classic images: a gadget tree plus a prebuilt root filesystem.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use super::Variant;
use crate::state::{require_dir, Build, Step};
use crate::steps::{self, DEFAULT_ARCHITECTURE};
use crate::sysops::copy_tree;

#[derive(Args, Debug, Clone)]
pub struct ClassicArgs {
    /// Gadget tree containing meta/gadget.toml or meta/gadget.json
    #[arg(long, value_name = "DIR")]
    pub gadget_tree: PathBuf,

    /// Prebuilt root filesystem
    #[arg(long, value_name = "DIR")]
    pub rootfs: PathBuf,

    /// Release series, used to pick a matching mke2fs.conf
    #[arg(long)]
    pub series: Option<String>,

    /// Target architecture
    #[arg(long, default_value = DEFAULT_ARCHITECTURE)]
    pub arch: String,
}

pub struct Classic {
    args: ClassicArgs,
}

impl Classic {
    pub fn new(args: ClassicArgs) -> Self {
        Self { args }
    }

    fn prepare_gadget_tree(&self, build: &mut Build<'_>) -> Result<()> {
        require_dir(&self.args.gadget_tree, "gadget tree")?;
        let dest = build.state.workspace.unpack.join("gadget");
        copy_tree(build.ops, &self.args.gadget_tree, &dest)?;
        build.state.gadget_dir = Some(dest);
        Ok(())
    }

    fn prepare_classic_rootfs(&self, build: &mut Build<'_>) -> Result<()> {
        require_dir(&self.args.rootfs, "rootfs")?;
        build.state.rootfs_source = Some(self.args.rootfs.clone());
        build.state.series = self.args.series.clone();
        build.state.architecture = Some(self.args.arch.clone());
        Ok(())
    }
}

impl Variant for Classic {
    fn name(&self) -> &'static str {
        "classic"
    }

    fn steps(&self) -> Vec<Step<'_>> {
        vec![
            Step::new("make_temporary_directories", steps::make_temporary_directories),
            Step::new("prepare_gadget_tree", move |b| self.prepare_gadget_tree(b)),
            Step::new("prepare_classic_rootfs", move |b| self.prepare_classic_rootfs(b)),
            Step::new("load_gadget", steps::load_gadget),
            Step::new("set_artifact_names", steps::set_artifact_names),
            Step::new("populate_rootfs_contents", steps::populate_rootfs_contents),
            Step::new("generate_disk_info", steps::generate_disk_info),
            Step::new("calculate_rootfs_size", steps::calculate_rootfs_size),
            Step::new("populate_bootfs_contents", steps::populate_bootfs_contents),
            Step::new("populate_prepare_partitions", steps::populate_prepare_partitions),
            Step::new("make_disk", steps::make_disk),
            Step::new("update_bootloader", steps::update_bootloader),
        ]
    }

    fn host_tools(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("losetup", "util-linux"),
            ("mount", "util-linux"),
            ("chroot", "coreutils"),
        ]
    }
}
