//! Disk image assembly from prepared partition images.
//!
//! Order per volume: create the sparse image, write the partition table, copy
//! each structure's `part<N>.img` to its offset, then patch offset-write
//! references.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::helpers::{create_sparse, sparse_copy, write_at};
use super::partitions::part_image;
use super::tables::{table_entries, write_partition_table};
use crate::error::DiskError;
use crate::gadget::layout::trailing_overhead;
use crate::gadget::{Volume, VolumeLayout};
use crate::size::{self, align_up};
use crate::sysops::SystemOps;

/// Where finished disk images go.
///
/// An explicit `output_dir` wins and is created if missing. Otherwise images
/// land in an explicit workdir, or the current directory when the workspace
/// is temporary.
pub fn determine_output_directory(
    ops: &dyn SystemOps,
    output_dir: Option<&Path>,
    workdir: &Path,
    workdir_explicit: bool,
) -> Result<PathBuf> {
    match output_dir {
        Some(dir) => {
            ops.create_dir_all(dir)
                .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
            Ok(dir.to_path_buf())
        }
        None if workdir_explicit => Ok(workdir.to_path_buf()),
        None => std::env::current_dir().context("Failed to determine current directory"),
    }
}

/// Final image size: the larger of the layout minimum and `floor`, plus the
/// schema's trailing overhead, rounded up to a whole sector.
pub fn disk_image_size(layout: &VolumeLayout, floor: Option<u64>) -> u64 {
    let body = layout.min_size.max(floor.unwrap_or(0));
    align_up(
        body + trailing_overhead(layout.schema, layout.sector_size),
        layout.sector_size,
    )
}

pub fn create_disk_image(path: &Path, size: u64) -> Result<(), DiskError> {
    create_sparse(path, size).map_err(|source| DiskError::CreateImage {
        path: path.to_path_buf(),
        source,
    })
}

/// Copy every prepared structure image into the disk at its offset.
pub fn copy_data_to_image(
    volume: &Volume,
    layout: &VolumeLayout,
    volume_dir: &Path,
    image: &Path,
    seeded: bool,
) -> Result<(), DiskError> {
    for (structure, placed) in volume.structures.iter().zip(&layout.structures) {
        if structure.skipped_when(seeded) {
            continue;
        }
        let part = part_image(volume_dir, placed.index);
        sparse_copy(&part, image, placed.offset, Some(placed.size)).map_err(|source| {
            DiskError::CopyData {
                structure: structure.name.clone(),
                image: part.clone(),
                source,
            }
        })?;
        tracing::debug!(
            "copied '{}' to byte {} (sector {})",
            structure.name,
            placed.offset,
            placed.offset / layout.sector_size
        );
    }
    Ok(())
}

/// Patch each offset-write reference with the structure's sector offset as
/// a little-endian u32.
pub fn write_offset_values(
    volume: &Volume,
    layout: &VolumeLayout,
    image: &Path,
    image_size: u64,
) -> Result<(), DiskError> {
    for (structure, placed) in volume.structures.iter().zip(&layout.structures) {
        let Some(write) = &structure.offset_write else {
            continue;
        };

        let base = write
            .relative_to
            .as_deref()
            .and_then(|name| layout.structure(name))
            .map_or(0, |s| s.offset);
        let out_of_range = |location| DiskError::OffsetOutOfRange {
            structure: structure.name.clone(),
            location,
            image_size,
        };
        let location = base
            .checked_add(write.offset)
            .ok_or_else(|| out_of_range(write.offset))?;
        if location.checked_add(4).map_or(true, |end| end > image_size) {
            return Err(out_of_range(location));
        }

        let sector = placed.offset / layout.sector_size;
        let value = u32::try_from(sector).map_err(|_| DiskError::OffsetValueTooLarge {
            structure: structure.name.clone(),
            sector,
        })?;
        write_at(image, location, &value.to_le_bytes()).map_err(|source| {
            DiskError::OffsetWrite {
                structure: structure.name.clone(),
                location,
                source,
            }
        })?;
        tracing::debug!("wrote offset {} of '{}' at byte {}", value, structure.name, location);
    }
    Ok(())
}

/// Inputs for writing one volume's disk image.
pub struct VolumeImage<'a> {
    pub volume: &'a Volume,
    pub layout: &'a VolumeLayout,
    /// Directory holding the prepared `part<N>.img` files.
    pub volume_dir: &'a Path,
    pub output: &'a Path,
    /// Caller-requested minimum size.
    pub floor: Option<u64>,
    pub seeded: bool,
}

/// Assemble a complete disk image. Returns its size in bytes.
pub fn write_volume(
    ops: &dyn SystemOps,
    target: &VolumeImage<'_>,
    used_disk_ids: &mut Vec<u32>,
) -> Result<u64> {
    let layout = target.layout;
    let image_size = disk_image_size(layout, target.floor);

    create_disk_image(target.output, image_size)?;

    let entries = table_entries(target.volume, layout, target.seeded);
    write_partition_table(
        ops,
        target.output,
        layout.schema,
        &entries,
        layout.sector_size,
        used_disk_ids,
    )?;

    copy_data_to_image(
        target.volume,
        layout,
        target.volume_dir,
        target.output,
        target.seeded,
    )?;
    write_offset_values(target.volume, layout, target.output, image_size)?;

    tracing::info!(
        "Wrote {} ({}, {} table)",
        target.output.display(),
        size::human(image_size),
        layout.schema.as_str()
    );
    Ok(image_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::{compute_offsets, GadgetInfo, Schema};
    use crate::sysops::HostOps;
    use std::fs;

    fn gadget(src: &str) -> GadgetInfo {
        toml::from_str(src).unwrap()
    }

    const LOADER: &str = r#"
        [[volumes]]
        name = "board"
        schema = "mbr"

        [[volumes.structure]]
        name = "spl"
        type = "bare"
        offset = 1024
        size = 4096
        offset-write = { offset = 8, relative-to = "spl" }

        [[volumes.structure]]
        name = "writable"
        role = "rootfs-data"
        type = "83"
        size = "1M"
        filesystem = "ext4"
        offset-write = { offset = 600 }
    "#;

    #[test]
    fn test_image_size_includes_trailing_overhead() {
        let g = gadget(LOADER);
        let layout = compute_offsets(&g.volumes[0], 512).unwrap();
        assert_eq!(layout.min_size, 2 * size::MIB);
        assert_eq!(disk_image_size(&layout, None), 2 * size::MIB);
        assert_eq!(disk_image_size(&layout, Some(size::GIB)), size::GIB);

        let mut gpt = layout.clone();
        gpt.schema = Schema::Gpt;
        assert_eq!(
            disk_image_size(&gpt, Some(4 * size::GIB)),
            4 * size::GIB + 33 * 512
        );
        assert_eq!(disk_image_size(&gpt, Some(4 * size::GIB)) % 512, 0);
    }

    #[test]
    fn test_offset_values_are_patched() {
        let temp = tempfile::tempdir().unwrap();
        let g = gadget(LOADER);
        let layout = compute_offsets(&g.volumes[0], 512).unwrap();
        let image = temp.path().join("board.img");
        create_disk_image(&image, 2 * size::MIB).unwrap();

        write_offset_values(&g.volumes[0], &layout, &image, 2 * size::MIB).unwrap();

        let data = fs::read(&image).unwrap();
        // spl at byte 1024 = sector 2, written at 1024 + 8
        assert_eq!(&data[1032..1036], &2u32.to_le_bytes());
        // writable at 1 MiB = sector 2048, written at 600
        assert_eq!(&data[600..604], &2048u32.to_le_bytes());
    }

    #[test]
    fn test_offset_write_out_of_range() {
        let temp = tempfile::tempdir().unwrap();
        let mut g = gadget(LOADER);
        g.volumes[0].structures[1]
            .offset_write
            .as_mut()
            .unwrap()
            .offset = 2 * size::MIB - 2;
        let layout = compute_offsets(&g.volumes[0], 512).unwrap();
        let image = temp.path().join("board.img");
        create_disk_image(&image, 2 * size::MIB).unwrap();

        let err = write_offset_values(&g.volumes[0], &layout, &image, 2 * size::MIB).unwrap_err();
        assert!(matches!(err, DiskError::OffsetOutOfRange { .. }));

        // relative offsets that overflow are out of range too
        g.volumes[0].structures[0]
            .offset_write
            .as_mut()
            .unwrap()
            .offset = u64::MAX - 100;
        let err = write_offset_values(&g.volumes[0], &layout, &image, 2 * size::MIB).unwrap_err();
        assert!(matches!(err, DiskError::OffsetOutOfRange { .. }));
    }

    #[test]
    fn test_missing_partition_image_is_a_copy_error() {
        let temp = tempfile::tempdir().unwrap();
        let g = gadget(LOADER);
        let layout = compute_offsets(&g.volumes[0], 512).unwrap();
        let image = temp.path().join("board.img");
        create_disk_image(&image, 2 * size::MIB).unwrap();

        let err = copy_data_to_image(&g.volumes[0], &layout, temp.path(), &image, false)
            .unwrap_err();
        assert!(matches!(err, DiskError::CopyData { ref structure, .. } if structure == "spl"));
    }

    #[test]
    fn test_output_directory_selection() {
        let temp = tempfile::tempdir().unwrap();
        let out = temp.path().join("out/images");

        let dir = determine_output_directory(&HostOps, Some(&out), temp.path(), false).unwrap();
        assert_eq!(dir, out);
        assert!(out.is_dir());

        let dir = determine_output_directory(&HostOps, None, temp.path(), true).unwrap();
        assert_eq!(dir, temp.path());

        let dir = determine_output_directory(&HostOps, None, temp.path(), false).unwrap();
        assert_eq!(dir, std::env::current_dir().unwrap());
    }
}
