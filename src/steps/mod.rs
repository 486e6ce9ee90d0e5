//! Steps shared by every variant.
//!
//! Each function here is a complete step: it reads what earlier steps left
//! in [`BuildState`](crate::state::BuildState), does its work through
//! `build.ops`, and records its results back into the state.

use anyhow::{bail, Context, Result};

use crate::artifact::image::{
    content_size, determine_output_directory, part_dir, stage_file_content, write_volume,
    Placement, VolumeImage,
};
use crate::bootloader::grub::{install_grub, GrubInstall};
use crate::bootloader::relocate_boot_content;
use crate::gadget::layout::{apply_image_size, resolve_rootfs_size};
use crate::gadget::{self, compute_offsets, Bootloader};
use crate::size;
use crate::state::Build;
use crate::sysops::copy_tree;

/// Architecture assumed when a variant does not record one.
pub const DEFAULT_ARCHITECTURE: &str = "amd64";

pub fn make_temporary_directories(build: &mut Build<'_>) -> Result<()> {
    for dir in build.state.workspace.all() {
        build
            .ops
            .create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(())
}

/// Parse and validate the gadget, then resolve `--image-size` against it.
pub fn load_gadget(build: &mut Build<'_>) -> Result<()> {
    let gadget_dir = build.state.gadget_dir();
    let gadget = gadget::load(&gadget_dir)?;

    if let Some(dest) = &build.config.preserve_unpack {
        gadget::mirror_unpack(build.ops, &build.state.workspace.unpack, dest);
    }

    if let Some(request) = &build.options.image_size {
        build.state.image_sizes = request.resolve(&gadget)?;
    }

    build.state.seeded = gadget.is_seeded();
    tracing::info!(
        "Gadget has {} volume(s){}",
        gadget.volumes.len(),
        if build.state.seeded { ", seeded" } else { "" }
    );
    build.state.gadget_dir = Some(gadget_dir);
    build.state.gadget = Some(gadget);
    Ok(())
}

pub fn set_artifact_names(build: &mut Build<'_>) -> Result<()> {
    let names = build
        .state
        .gadget()?
        .volumes
        .iter()
        .map(|v| (v.name.clone(), format!("{}.img", v.name)))
        .collect();
    build.state.volume_names = names;
    Ok(())
}

pub fn populate_rootfs_contents(build: &mut Build<'_>) -> Result<()> {
    let Some(source) = &build.state.rootfs_source else {
        bail!("no rootfs source has been prepared");
    };
    let rootfs = &build.state.workspace.rootfs;
    copy_tree(build.ops, source, rootfs)?;
    tracing::info!("Copied {} into the image rootfs", source.display());
    Ok(())
}

/// Copy `--disk-info` to `.disk/info` in the rootfs.
pub fn generate_disk_info(build: &mut Build<'_>) -> Result<()> {
    let Some(info) = &build.options.disk_info else {
        tracing::debug!("no --disk-info given");
        return Ok(());
    };
    let dir = build.state.workspace.rootfs.join(".disk");
    build
        .ops
        .create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    build
        .ops
        .copy_file(info, &dir.join("info"))
        .with_context(|| format!("Failed to copy disk info {}", info.display()))?;
    Ok(())
}

/// Size the primary structure for the rootfs, then apply `--image-size`.
pub fn calculate_rootfs_size(build: &mut Build<'_>) -> Result<()> {
    let content = content_size(&build.state.workspace.rootfs)?;
    let sector_size = build.state.sector_size;
    let Some(gadget) = build.state.gadget.as_mut() else {
        bail!("gadget has not been loaded (load_gadget must run first)");
    };

    let resolved = resolve_rootfs_size(gadget, content, sector_size)?;
    for (volume, requested) in &build.state.image_sizes {
        apply_image_size(gadget, volume, *requested, sector_size)?;
    }

    tracing::info!(
        "Rootfs content {}, partition {}",
        size::human(content),
        size::human(resolved)
    );
    build.state.rootfs_size = resolved;
    Ok(())
}

/// Relocate bootloader content and stage gadget files for every
/// non-primary filesystem structure.
pub fn populate_bootfs_contents(build: &mut Build<'_>) -> Result<()> {
    let state = &build.state;
    let gadget = state.gadget()?;
    let gadget_dir = state.gadget_dir();
    let boot_dir = state.boot_dir();
    let primary = gadget.primary_role();

    for volume in &gadget.volumes {
        let volume_dir = state.volume_dir(&volume.name);
        relocate_boot_content(
            build.ops,
            volume,
            &boot_dir,
            &gadget_dir,
            &volume_dir,
            state.seeded,
        )
        .with_context(|| format!("volume '{}'", volume.name))?;

        for (index, structure) in volume.structures.iter().enumerate() {
            if structure.filesystem.is_none()
                || structure.role == primary
                || structure.skipped_when(state.seeded)
            {
                continue;
            }
            stage_file_content(
                build.ops,
                &gadget_dir,
                structure,
                &part_dir(&volume_dir, index),
            )
            .with_context(|| {
                format!(
                    "Failed to stage content of '{}' in volume '{}'",
                    structure.name, volume.name
                )
            })?;
        }
    }
    Ok(())
}

/// Write `part<N>.img` for every structure that lands on disk.
pub fn populate_prepare_partitions(build: &mut Build<'_>) -> Result<()> {
    let state = &build.state;
    let gadget = state.gadget()?;
    let gadget_dir = state.gadget_dir();
    let primary = gadget.primary_role();
    let mke2fs_config = build.config.mke2fs_config(state.series.as_deref());
    if mke2fs_config.is_none() {
        tracing::debug!("no series-specific mke2fs.conf; using mkfs.ext4 defaults");
    }

    for volume in &gadget.volumes {
        let layout = compute_offsets(volume, state.sector_size)?;
        let volume_dir = state.volume_dir(&volume.name);
        build
            .ops
            .create_dir_all(&volume_dir)
            .with_context(|| format!("Failed to create {}", volume_dir.display()))?;

        let placement = Placement {
            ops: build.ops,
            gadget_dir: &gadget_dir,
            rootfs: &state.workspace.rootfs,
            volume_dir: &volume_dir,
            mke2fs_config: mke2fs_config.as_deref(),
            sector_size: state.sector_size,
        };
        for (structure, placed) in volume.structures.iter().zip(&layout.structures) {
            if structure.skipped_when(state.seeded) {
                continue;
            }
            placement
                .prepare(structure, placed, structure.role == primary)
                .with_context(|| format!("volume '{}'", volume.name))?;
        }
    }
    Ok(())
}

/// Assemble one disk image per volume.
pub fn make_disk(build: &mut Build<'_>) -> Result<()> {
    let state = &mut build.state;
    let output_dir = determine_output_directory(
        build.ops,
        build.options.output_dir.as_deref(),
        &state.workspace.root,
        state.workspace.explicit,
    )?;

    let Some(gadget) = &state.gadget else {
        bail!("gadget has not been loaded (load_gadget must run first)");
    };
    for volume in &gadget.volumes {
        let layout = compute_offsets(volume, state.sector_size)?;
        let output = output_dir.join(state.image_name(&volume.name));
        let volume_dir = state.workspace.volumes.join(&volume.name);
        let target = VolumeImage {
            volume,
            layout: &layout,
            volume_dir: &volume_dir,
            output: &output,
            floor: state.image_sizes.get(&volume.name).copied(),
            seeded: state.seeded,
        };
        write_volume(build.ops, &target, &mut state.used_disk_ids)
            .with_context(|| format!("Failed to write disk image for volume '{}'", volume.name))?;
    }

    state.output_dir = Some(output_dir);
    Ok(())
}

/// Install grub into every image whose volume declares it.
pub fn update_bootloader(build: &mut Build<'_>) -> Result<()> {
    let state = &build.state;
    let gadget = state.gadget()?;
    let Some(output_dir) = &state.output_dir else {
        bail!("no disk images have been written (make_disk must run first)");
    };
    let architecture = state
        .architecture
        .as_deref()
        .unwrap_or(DEFAULT_ARCHITECTURE);

    for volume in &gadget.volumes {
        if volume.bootloader != Some(Bootloader::Grub) {
            continue;
        }
        let image = output_dir.join(state.image_name(&volume.name));
        install_grub(
            build.ops,
            &mut build.releases,
            &GrubInstall {
                volume,
                image: &image,
                scratch: &state.workspace.scratch,
                architecture,
                seeded: state.seeded,
            },
        )
        .with_context(|| format!("volume '{}'", volume.name))?;
    }
    Ok(())
}
