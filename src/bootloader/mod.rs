//! Bootloader-specific content handling.
//!
//! Dispatches on a volume's declared bootloader:
//! - `u-boot` / `piboot`: move the vendor boot directory, when present, into
//!   the boot structure's staging directory
//! - `lk`: copy the lk boot directory into the gadget tree so its files can
//!   be referenced as structure content; the directory is mandatory
//! - `grub`: nothing to relocate; see [`grub::install_grub`]

pub mod grub;

use std::fs;
use std::path::Path;

use crate::artifact::image::part_dir;
use crate::error::BootloaderError;
use crate::gadget::{Bootloader, Role, Volume};
use crate::sysops::SystemOps;

/// Relocate boot content for `volume`.
///
/// `boot_dir` is the image's `boot/` directory; `volume_dir` holds the
/// per-structure staging directories.
pub fn relocate_boot_content(
    ops: &dyn SystemOps,
    volume: &Volume,
    boot_dir: &Path,
    gadget_dir: &Path,
    volume_dir: &Path,
    seeded: bool,
) -> Result<(), BootloaderError> {
    match volume.bootloader {
        Some(Bootloader::UBoot) => {
            move_vendor_dir(ops, volume, &boot_dir.join("uboot"), volume_dir, seeded)
        }
        Some(Bootloader::Piboot) => {
            move_vendor_dir(ops, volume, &boot_dir.join("piboot"), volume_dir, seeded)
        }
        Some(Bootloader::Lk) => copy_lk_dir(ops, &boot_dir.join("lk"), gadget_dir),
        Some(Bootloader::Grub) | None => Ok(()),
    }
}

fn move_vendor_dir(
    ops: &dyn SystemOps,
    volume: &Volume,
    source: &Path,
    volume_dir: &Path,
    seeded: bool,
) -> Result<(), BootloaderError> {
    if !source.is_dir() {
        tracing::debug!("no {} to relocate", source.display());
        return Ok(());
    }

    let boot_role = if seeded { Role::Seed } else { Role::Boot };
    let index = volume
        .structures
        .iter()
        .position(|s| s.role == boot_role)
        .ok_or(BootloaderError::MissingPartition {
            volume: volume.name.clone(),
            what: boot_role.as_str(),
        })?;

    let target = part_dir(volume_dir, index);
    ops.create_dir_all(&target)
        .map_err(|source| BootloaderError::CreateDir {
            path: target.clone(),
            source,
        })?;

    for entry in read_sorted(source)? {
        let to = target.join(entry.file_name());
        ops.rename(&entry.path(), &to)
            .map_err(|e| BootloaderError::Move {
                from: entry.path(),
                to: to.clone(),
                source: e,
            })?;
    }

    tracing::debug!("moved {} into {}", source.display(), target.display());
    Ok(())
}

fn copy_lk_dir(ops: &dyn SystemOps, lk_dir: &Path, gadget_dir: &Path) -> Result<(), BootloaderError> {
    if !lk_dir.is_dir() {
        return Err(BootloaderError::MissingBootDir(lk_dir.to_path_buf()));
    }

    for entry in read_sorted(lk_dir)? {
        let from = entry.path();
        if !from.is_file() {
            continue;
        }
        let to = gadget_dir.join(entry.file_name());
        ops.copy_file(&from, &to)
            .map_err(|source| BootloaderError::Copy {
                from: from.clone(),
                to,
                source,
            })?;
    }
    Ok(())
}

fn read_sorted(dir: &Path) -> Result<Vec<fs::DirEntry>, BootloaderError> {
    let read_err = |source| BootloaderError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(dir)
        .map_err(read_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::GadgetInfo;
    use crate::sysops::HostOps;

    fn volume(bootloader: &str) -> Volume {
        let gadget: GadgetInfo = toml::from_str(&format!(
            r#"
            [[volumes]]
            name = "rpi"
            schema = "mbr"
            bootloader = "{bootloader}"

            [[volumes.structure]]
            name = "system-boot"
            role = "boot"
            type = "0C"
            size = "256M"
            filesystem = "vfat"

            [[volumes.structure]]
            name = "writable"
            role = "rootfs-data"
            type = "83"
            size = "1G"
            filesystem = "ext4"
            "#
        ))
        .unwrap();
        gadget.volumes.into_iter().next().unwrap()
    }

    #[test]
    fn test_uboot_content_moves_into_boot_partition() {
        let temp = tempfile::tempdir().unwrap();
        let boot = temp.path().join("image/boot");
        fs::create_dir_all(boot.join("uboot")).unwrap();
        fs::write(boot.join("uboot/boot.sel"), "snap_kernel=pi-kernel\n").unwrap();
        let volume_dir = temp.path().join("volumes/rpi");

        relocate_boot_content(
            &HostOps,
            &volume("u-boot"),
            &boot,
            temp.path(),
            &volume_dir,
            false,
        )
        .unwrap();

        assert!(volume_dir.join("part0/boot.sel").is_file());
        assert!(!boot.join("uboot/boot.sel").exists());
    }

    #[test]
    fn test_missing_vendor_dir_is_skipped() {
        let temp = tempfile::tempdir().unwrap();
        relocate_boot_content(
            &HostOps,
            &volume("piboot"),
            &temp.path().join("boot"),
            temp.path(),
            &temp.path().join("volumes/rpi"),
            false,
        )
        .unwrap();
        assert!(!temp.path().join("volumes").exists());
    }

    #[test]
    fn test_lk_requires_boot_dir() {
        let temp = tempfile::tempdir().unwrap();
        let err = relocate_boot_content(
            &HostOps,
            &volume("lk"),
            &temp.path().join("image/boot"),
            temp.path(),
            temp.path(),
            false,
        )
        .unwrap_err();

        assert!(matches!(err, BootloaderError::MissingBootDir(_)));
        let msg = err.to_string();
        assert!(msg.contains("bootloader directory"), "{msg}");
        assert!(msg.contains("does not exist"), "{msg}");
    }

    #[test]
    fn test_lk_files_land_in_gadget_tree() {
        let temp = tempfile::tempdir().unwrap();
        let boot = temp.path().join("image/boot");
        fs::create_dir_all(boot.join("lk")).unwrap();
        fs::write(boot.join("lk/snapbootsel.bin"), [1, 2, 3]).unwrap();
        let gadget_dir = temp.path().join("gadget");
        fs::create_dir_all(&gadget_dir).unwrap();

        relocate_boot_content(&HostOps, &volume("lk"), &boot, &gadget_dir, temp.path(), false)
            .unwrap();

        assert_eq!(fs::read(gadget_dir.join("snapbootsel.bin")).unwrap(), vec![1, 2, 3]);
    }
}
