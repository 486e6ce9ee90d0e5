//! Pack images: an already prepared gadget directory and rootfs.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use super::Variant;
use crate::state::{require_dir, Build, Step};
use crate::steps;
use crate::sysops::copy_tree;

#[derive(Args, Debug, Clone)]
pub struct PackArgs {
    /// Prepared gadget directory
    #[arg(long, value_name = "DIR")]
    pub gadget_dir: PathBuf,

    /// Prepared root filesystem
    #[arg(long, value_name = "DIR")]
    pub rootfs_dir: PathBuf,
}

pub struct Pack {
    args: PackArgs,
}

impl Pack {
    pub fn new(args: PackArgs) -> Self {
        Self { args }
    }

    fn prepare_pack(&self, build: &mut Build<'_>) -> Result<()> {
        require_dir(&self.args.gadget_dir, "gadget directory")?;
        require_dir(&self.args.rootfs_dir, "rootfs directory")?;

        let dest = build.state.workspace.unpack.join("gadget");
        copy_tree(build.ops, &self.args.gadget_dir, &dest)?;
        build.state.gadget_dir = Some(dest);
        build.state.rootfs_source = Some(self.args.rootfs_dir.clone());
        Ok(())
    }
}

impl Variant for Pack {
    fn name(&self) -> &'static str {
        "pack"
    }

    fn steps(&self) -> Vec<Step<'_>> {
        vec![
            Step::new("make_temporary_directories", steps::make_temporary_directories),
            Step::new("prepare_pack", move |b| self.prepare_pack(b)),
            Step::new("load_gadget", steps::load_gadget),
            Step::new("set_artifact_names", steps::set_artifact_names),
            Step::new("populate_rootfs_contents", steps::populate_rootfs_contents),
            Step::new("calculate_rootfs_size", steps::calculate_rootfs_size),
            Step::new("populate_bootfs_contents", steps::populate_bootfs_contents),
            Step::new("populate_prepare_partitions", steps::populate_prepare_partitions),
            Step::new("make_disk", steps::make_disk),
        ]
    }
}
