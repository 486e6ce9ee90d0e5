//! recimg - build bootable disk images from a gadget description.

use anyhow::Result;
use clap::{Parser, Subcommand};

use recimg::artifact::image::check_host_tools;
use recimg::config::Config;
use recimg::logging;
use recimg::state::{CommonOptions, StateMachine};
use recimg::sysops::HostOps;
use recimg::variant::{Classic, ClassicArgs, Pack, PackArgs, Snap, SnapArgs, Variant};

#[derive(Parser)]
#[command(name = "recimg")]
#[command(about = "Build bootable disk images from a gadget description")]
#[command(
    after_help = "EXAMPLES:\n  recimg classic --gadget-tree gadget/ --rootfs rootfs/ --series noble\n  recimg snap pi.model --snap hello\n  recimg pack --gadget-dir gadget/ --rootfs-dir rootfs/ -O out/\n\nPARTIAL RUNS:\n  recimg -w work/ --until make_disk pack ...\n  recimg -w work/ --resume pack ..."
)]
struct Cli {
    #[command(flatten)]
    common: CommonOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classic image from a gadget tree and a prebuilt rootfs (installs grub)
    Classic(ClassicArgs),
    /// Snap-based image prepared with `snap prepare-image`
    Snap(SnapArgs),
    /// Image from an already prepared gadget and rootfs
    Pack(PackArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();
    logging::init(cli.common.log_level()?);

    let config = Config::load();
    config.log();

    let variant: Box<dyn Variant> = match cli.command {
        Commands::Classic(args) => Box::new(Classic::new(args)),
        Commands::Snap(args) => Box::new(Snap::new(args)),
        Commands::Pack(args) => Box::new(Pack::new(args)),
    };

    let dry_run = cli.common.dry_run;
    let ops = HostOps;
    let mut machine = StateMachine::setup(variant.as_ref(), cli.common, config, &ops)?;

    let outcome = if dry_run {
        machine.run()
    } else {
        check_host_tools(variant.host_tools()).and_then(|()| machine.run())
    };
    machine.teardown(outcome)
}
