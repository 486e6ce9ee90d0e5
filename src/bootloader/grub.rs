//! grub installation into a finished classic disk image.
//!
//! The image is attached to a loop device, its rootfs and ESP are mounted
//! under the scratch directory, and the host's pseudo filesystems are bind
//! mounted so `grub-install` and `update-grub` can run in a chroot.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::error::BootloaderError;
use crate::gadget::{Role, Volume};
use crate::process::Cmd;
use crate::state::release::{join_errors, Release, ReleaseStack};
use crate::sysops::SystemOps;

/// Hook that would scan the build host's other OSes.
pub const OS_PROBER: &str = "/etc/grub.d/30_os-prober";

/// Bind mounts made inside the chroot, in mount order.
const BIND_MOUNTS: &[&str] = &["/dev", "/proc", "/sys", "/dev/pts"];

/// grub platform target for a Debian architecture name.
pub fn grub_target(arch: &str) -> Result<&'static str, BootloaderError> {
    match arch {
        "amd64" => Ok("x86_64-efi"),
        "arm64" => Ok("arm64-efi"),
        "armhf" => Ok("arm-efi"),
        "riscv64" => Ok("riscv64-efi"),
        other => Err(BootloaderError::UnsupportedArch(other.to_string())),
    }
}

/// 1-based partition number of the first structure with `role`, counting
/// only structures that get a table entry.
fn partition_number(volume: &Volume, role: Role, seeded: bool) -> Option<usize> {
    volume
        .structures
        .iter()
        .filter(|s| !s.skipped_when(seeded))
        .filter(|s| s.is_partition())
        .position(|s| s.role == role)
        .map(|i| i + 1)
}

pub struct GrubInstall<'a> {
    pub volume: &'a Volume,
    pub image: &'a Path,
    pub scratch: &'a Path,
    pub architecture: &'a str,
    pub seeded: bool,
}

/// Install grub into `req.image`.
///
/// Every resource acquired here is released before returning, whether or
/// not installation succeeded.
pub fn install_grub(
    ops: &dyn SystemOps,
    releases: &mut ReleaseStack,
    req: &GrubInstall<'_>,
) -> Result<()> {
    let target = grub_target(req.architecture)?;
    let missing = |what| BootloaderError::MissingPartition {
        volume: req.volume.name.clone(),
        what,
    };
    let root_part = partition_number(req.volume, Role::RootfsData, req.seeded)
        .ok_or_else(|| missing("rootfs-data"))?;
    let esp_part =
        partition_number(req.volume, Role::Boot, req.seeded).ok_or_else(|| missing("boot"))?;

    let mark = releases.mark();
    let outcome = install_inner(ops, releases, req, target, root_part, esp_part);
    let cleanup = releases.unwind_to(ops, mark);
    join_errors(outcome, cleanup)
}

fn install_inner(
    ops: &dyn SystemOps,
    releases: &mut ReleaseStack,
    req: &GrubInstall<'_>,
    target: &str,
    root_part: usize,
    esp_part: usize,
) -> Result<()> {
    let loop_dev = ops
        .run(
            Cmd::new("losetup")
                .args(["--find", "--show", "--partscan"])
                .arg_path(req.image)
                .error_msg("Failed to attach disk image to a loop device"),
        )?
        .stdout_trimmed()
        .to_string();
    releases.push(Release::DetachLoop(loop_dev.clone()));

    let mountpoint = req.scratch.join("loopback");
    ops.create_dir_all(&mountpoint)
        .with_context(|| format!("Failed to create {}", mountpoint.display()))?;
    mount(ops, releases, &format!("{loop_dev}p{root_part}"), &mountpoint, false)?;

    let esp = mountpoint.join("boot/efi");
    ops.create_dir_all(&esp)
        .with_context(|| format!("Failed to create {}", esp.display()))?;
    mount(ops, releases, &format!("{loop_dev}p{esp_part}"), &esp, false)?;

    for source in BIND_MOUNTS {
        let dest = chroot_path(&mountpoint, source);
        ops.create_dir_all(&dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        mount(ops, releases, source, &dest, true)?;
    }

    ops.run(
        chroot(&mountpoint)
            .args(["dpkg-divert", "--local", "--rename", "--add", OS_PROBER])
            .error_msg("Failed to divert os-prober"),
    )?;
    releases.push(Release::UndoDivert {
        root: mountpoint.clone(),
        path: OS_PROBER.to_string(),
    });

    ops.run(
        chroot(&mountpoint)
            .arg("grub-install")
            .arg(&loop_dev)
            .args([
                "--boot-directory=/boot",
                "--efi-directory=/boot/efi",
                format!("--target={target}").as_str(),
                "--uefi-secure-boot",
                "--no-nvram",
            ])
            .error_msg("grub-install failed"),
    )?;
    ops.run(
        chroot(&mountpoint)
            .arg("update-grub")
            .error_msg("update-grub failed"),
    )?;

    tracing::info!("Installed grub ({}) into {}", target, req.image.display());
    Ok(())
}

fn chroot(root: &Path) -> Cmd {
    Cmd::new("chroot").arg_path(root)
}

fn chroot_path(root: &Path, absolute: &str) -> PathBuf {
    root.join(absolute.trim_start_matches('/'))
}

fn mount(
    ops: &dyn SystemOps,
    releases: &mut ReleaseStack,
    source: &str,
    dest: &Path,
    bind: bool,
) -> Result<()> {
    let mut cmd = Cmd::new("mount");
    if bind {
        cmd = cmd.arg("--bind");
    }
    ops.run(
        cmd.arg(source)
            .arg_path(dest)
            .error_msg(format!("Failed to mount {} on {}", source, dest.display())),
    )?;
    releases.push(Release::Unmount(dest.to_path_buf()));
    Ok(())
}
