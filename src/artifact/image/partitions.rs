//! Per-structure partition image preparation.
//!
//! Every structure that lands on disk gets a `part<N>.img` in its volume
//! directory, where `N` is the structure's declaration index. Raw structures
//! are zero-filled and receive their blobs; filesystem structures are
//! formatted with their content in a single pass where the tool allows it.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::helpers::{create_sparse, sparse_copy};
use super::mtools;
use crate::error::PlacementError;
use crate::gadget::{Filesystem, Structure, StructureLayout};
use crate::process::Cmd;
use crate::sysops::{copy_tree, SystemOps};

/// Staging directory for a structure's filesystem content.
pub fn part_dir(volume_dir: &Path, index: usize) -> PathBuf {
    volume_dir.join(format!("part{index}"))
}

/// Prepared partition image for a structure.
pub fn part_image(volume_dir: &Path, index: usize) -> PathBuf {
    volume_dir.join(format!("part{index}.img"))
}

/// Copy a structure's `source -> target` file mappings into its staging
/// directory. Sources are resolved against the gadget tree.
pub fn stage_file_content(
    ops: &dyn SystemOps,
    gadget_dir: &Path,
    structure: &Structure,
    staging: &Path,
) -> Result<()> {
    ops.create_dir_all(staging)
        .with_context(|| format!("Failed to create {}", staging.display()))?;

    for file in structure.files() {
        let source = gadget_dir.join(&file.source);
        let target = staging.join(file.target.trim_start_matches('/'));

        if source.is_dir() {
            copy_tree(ops, &source, &target)?;
            continue;
        }

        let target = if file.target.ends_with('/') {
            let name = source
                .file_name()
                .ok_or_else(|| anyhow!("content source '{}' has no file name", file.source))?;
            target.join(name)
        } else {
            target
        };
        if let Some(parent) = target.parent() {
            ops.create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        ops.copy_file(&source, &target).with_context(|| {
            format!(
                "Failed to copy gadget content {} to {}",
                source.display(),
                target.display()
            )
        })?;
    }
    Ok(())
}

/// Inputs shared by every structure of one volume.
pub struct Placement<'a> {
    pub ops: &'a dyn SystemOps,
    pub gadget_dir: &'a Path,
    /// Content of the primary structure.
    pub rootfs: &'a Path,
    pub volume_dir: &'a Path,
    /// Series-specific `mke2fs.conf`, if shipped.
    pub mke2fs_config: Option<&'a Path>,
    pub sector_size: u64,
}

impl Placement<'_> {
    /// Write `part<N>.img` for one structure and return its path.
    pub fn prepare(
        &self,
        structure: &Structure,
        layout: &StructureLayout,
        primary: bool,
    ) -> Result<PathBuf, PlacementError> {
        let image = part_image(self.volume_dir, layout.index);

        create_sparse(&image, layout.size).map_err(|source| PlacementError::ZeroFill {
            structure: structure.name.clone(),
            path: image.clone(),
            source,
        })?;

        match structure.filesystem {
            None => self.place_blobs(structure, layout, &image)?,
            Some(fs) => {
                let content = if primary {
                    self.rootfs.to_path_buf()
                } else {
                    part_dir(self.volume_dir, layout.index)
                };
                self.format(structure, fs, &image, &content)?;
            }
        }

        tracing::debug!(
            "prepared {} for structure '{}' ({} bytes)",
            image.display(),
            structure.name,
            layout.size
        );
        Ok(image)
    }

    fn place_blobs(
        &self,
        structure: &Structure,
        layout: &StructureLayout,
        image: &Path,
    ) -> Result<(), PlacementError> {
        let copy_err = |source: anyhow::Error| PlacementError::Copy {
            structure: structure.name.clone(),
            source,
        };

        let mut cursor = 0u64;
        for blob in structure.images() {
            let source = self.gadget_dir.join(&blob.image);
            let offset = blob.offset.unwrap_or(cursor);
            let len = source
                .metadata()
                .with_context(|| format!("Failed to stat {}", source.display()))
                .map_err(copy_err)?
                .len();
            let len = blob.size.map_or(len, |limit| limit.min(len));

            if offset.checked_add(len).map_or(true, |end| end > layout.size) {
                return Err(copy_err(anyhow!(
                    "{} ({} bytes at offset {}) does not fit in {} bytes",
                    blob.image,
                    len,
                    offset,
                    layout.size
                )));
            }

            let copied = sparse_copy(&source, image, offset, Some(len))
                .with_context(|| format!("Failed to copy {}", source.display()))
                .map_err(copy_err)?;
            cursor = offset + copied;
        }
        Ok(())
    }

    fn format(
        &self,
        structure: &Structure,
        fs: Filesystem,
        image: &Path,
        content: &Path,
    ) -> Result<(), PlacementError> {
        let has_content = content
            .read_dir()
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        let label = structure.filesystem_label();

        let format_err = |source: anyhow::Error| PlacementError::Format {
            structure: structure.name.clone(),
            fs: fs.as_str().to_string(),
            source,
        };

        match fs {
            Filesystem::Ext4 => {
                let mut cmd = Cmd::new("mkfs.ext4").args(["-q", "-L", label]);
                match self.mke2fs_config {
                    Some(config) => {
                        cmd = cmd.env("MKE2FS_CONFIG", config.to_string_lossy());
                    }
                    None => tracing::warn!(
                        "No series-specific mke2fs.conf found; using mkfs.ext4 defaults for '{}'",
                        structure.name
                    ),
                }
                if has_content {
                    cmd = cmd.arg("-d").arg_path(content);
                }
                let cmd = cmd
                    .arg_path(image)
                    .error_msg(format!("mkfs.ext4 failed for '{}'", structure.name));
                self.ops.run(cmd).map_err(format_err)?;
            }
            Filesystem::Vfat => {
                let cmd = Cmd::new("mkfs.vfat")
                    .args(["-S", self.sector_size.to_string().as_str(), "-n", label])
                    .arg_path(image)
                    .error_msg(format!("mkfs.vfat failed for '{}'", structure.name));
                self.ops.run(cmd).map_err(format_err)?;

                if has_content {
                    mtools::mtools_copy_tree(self.ops, image, content).map_err(|source| {
                        PlacementError::Copy {
                            structure: structure.name.clone(),
                            source,
                        }
                    })?;
                }
            }
        }
        Ok(())
    }
}
