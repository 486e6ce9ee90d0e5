//! Snap-based images, seeded by `snap prepare-image`.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use super::Variant;
use crate::process::Cmd;
use crate::state::{Build, Step};
use crate::steps::{self, DEFAULT_ARCHITECTURE};

#[derive(Args, Debug, Clone)]
pub struct SnapArgs {
    /// Model assertion
    #[arg(value_name = "MODEL")]
    pub model: PathBuf,

    /// Extra snap to include (repeatable)
    #[arg(long = "snap", value_name = "SNAP")]
    pub snaps: Vec<String>,

    /// Channel to install snaps from
    #[arg(long)]
    pub channel: Option<String>,

    /// Target architecture
    #[arg(long, default_value = DEFAULT_ARCHITECTURE)]
    pub arch: String,
}

pub struct Snap {
    args: SnapArgs,
}

impl Snap {
    pub fn new(args: SnapArgs) -> Self {
        Self { args }
    }

    fn prepare_image_cmd(&self, unpack: &std::path::Path) -> Cmd {
        let mut cmd = Cmd::new("snap")
            .args(["prepare-image", "--arch", self.args.arch.as_str()]);
        if let Some(channel) = &self.args.channel {
            cmd = cmd.args(["--channel", channel.as_str()]);
        }
        for snap in &self.args.snaps {
            cmd = cmd.args(["--snap", snap.as_str()]);
        }
        cmd.arg_path(&self.args.model)
            .arg_path(unpack)
            .error_msg("snap prepare-image failed")
    }

    fn prepare_image(&self, build: &mut Build<'_>) -> Result<()> {
        let unpack = build.state.workspace.unpack.clone();
        build.ops.run(self.prepare_image_cmd(&unpack))?;

        build.state.gadget_dir = Some(unpack.join("gadget"));
        build.state.rootfs_source = Some(unpack.join("image"));
        build.state.architecture = Some(self.args.arch.clone());
        Ok(())
    }
}

impl Variant for Snap {
    fn name(&self) -> &'static str {
        "snap"
    }

    fn steps(&self) -> Vec<Step<'_>> {
        vec![
            Step::new("make_temporary_directories", steps::make_temporary_directories),
            Step::new("prepare_image", move |b| self.prepare_image(b)),
            Step::new("load_gadget", steps::load_gadget),
            Step::new("set_artifact_names", steps::set_artifact_names),
            Step::new("populate_rootfs_contents", steps::populate_rootfs_contents),
            Step::new("generate_disk_info", steps::generate_disk_info),
            Step::new("calculate_rootfs_size", steps::calculate_rootfs_size),
            Step::new("populate_bootfs_contents", steps::populate_bootfs_contents),
            Step::new("populate_prepare_partitions", steps::populate_prepare_partitions),
            Step::new("make_disk", steps::make_disk),
        ]
    }

    fn host_tools(&self) -> &'static [(&'static str, &'static str)] {
        &[("snap", "snapd")]
    }
}
