//! Gadget description loading and validation.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::{GadgetInfo, PartitionType, Role, Schema};
use crate::error::LayoutError;
use crate::sysops::{copy_tree, SystemOps};

/// Bytes of boot code that fit before the MBR disk signature.
pub const MBR_BOOT_CODE_SIZE: u64 = 440;

/// Primary partitions an MBR table can hold.
pub const MBR_MAX_PARTITIONS: usize = 4;

/// Mirrored partitions a hybrid MBR can hold next to its 0xEE entry.
pub const HYBRID_MAX_MIRRORED: usize = 3;

/// Locate the description file inside a gadget tree.
pub fn description_path(gadget_dir: &Path) -> Option<PathBuf> {
    ["gadget.toml", "gadget.json"]
        .iter()
        .map(|name| gadget_dir.join("meta").join(name))
        .find(|p| p.is_file())
}

/// Parse and validate `<gadget_dir>/meta/gadget.{toml,json}`.
pub fn load(gadget_dir: &Path) -> Result<GadgetInfo> {
    let Some(path) = description_path(gadget_dir) else {
        bail!(
            "no gadget description found in {} (expected meta/gadget.toml or meta/gadget.json)",
            gadget_dir.display()
        );
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let gadget: GadgetInfo = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?
    };

    validate(&gadget)?;

    tracing::debug!(
        "loaded {} volume(s) from {}",
        gadget.volumes.len(),
        path.display()
    );
    Ok(gadget)
}

/// Check the model for consistency.
pub fn validate(gadget: &GadgetInfo) -> Result<(), LayoutError> {
    if gadget.volumes.is_empty() {
        return Err(LayoutError::NoVolumes);
    }

    let mut volume_names = HashSet::new();
    for volume in &gadget.volumes {
        if !volume_names.insert(volume.name.as_str()) {
            return Err(LayoutError::DuplicateVolume(volume.name.clone()));
        }
        validate_volume(volume)?;
    }

    let primary = gadget.primary_role();
    let mut owner: Option<&str> = None;
    for volume in &gadget.volumes {
        let count = volume.structures.iter().filter(|s| s.role == primary).count();
        if count > 1 {
            return Err(LayoutError::DuplicateRole {
                volume: volume.name.clone(),
                role: primary.as_str(),
            });
        }
        if count == 1 {
            if let Some(first) = owner {
                return Err(LayoutError::PrimaryInMultipleVolumes {
                    role: primary.as_str(),
                    first: first.to_string(),
                    second: volume.name.clone(),
                });
            }
            owner = Some(&volume.name);
        }
    }
    if owner.is_none() {
        return Err(LayoutError::MissingRole(primary.as_str()));
    }

    Ok(())
}

fn validate_volume(volume: &super::Volume) -> Result<(), LayoutError> {
    let vol = || volume.name.clone();
    let mut names = HashSet::new();
    let mut mbr_entries = 0;

    for s in &volume.structures {
        if !names.insert(s.name.as_str()) {
            return Err(LayoutError::DuplicateStructure {
                volume: vol(),
                structure: s.name.clone(),
            });
        }

        let invalid_type = |reason: String| LayoutError::InvalidType {
            volume: vol(),
            structure: s.name.clone(),
            ty: s.type_id.clone(),
            reason,
        };

        let ty = s.partition_type().map_err(invalid_type)?;
        match ty {
            PartitionType::Mbr if s.role != Role::RawMbr => {
                return Err(invalid_type(
                    "type 'mbr' is reserved for the raw-mbr role".to_string(),
                ));
            }
            PartitionType::Id { mbr, gpt } => {
                match volume.schema {
                    Schema::Mbr if mbr.is_none() => {
                        return Err(invalid_type("an MBR volume needs an MBR id".to_string()));
                    }
                    Schema::Gpt | Schema::Hybrid if gpt.is_none() => {
                        return Err(invalid_type(format!(
                            "a {} volume needs a GPT type GUID",
                            volume.schema.as_str()
                        )));
                    }
                    _ => {}
                }
                if mbr.is_some() && volume.schema != Schema::Gpt {
                    mbr_entries += 1;
                }
            }
            _ => {}
        }

        if s.role == Role::RawMbr {
            let mbr_err = |reason: &str| LayoutError::InvalidMbrStructure {
                volume: vol(),
                structure: s.name.clone(),
                reason: reason.to_string(),
            };
            if ty != PartitionType::Mbr {
                return Err(mbr_err("must have type 'mbr'"));
            }
            if s.offset.is_some_and(|o| o != 0) {
                return Err(mbr_err("must be at offset 0"));
            }
            if s.declared_size().is_some_and(|size| size > MBR_BOOT_CODE_SIZE) {
                return Err(mbr_err("must not be larger than 440 bytes"));
            }
            if s.filesystem.is_some() {
                return Err(mbr_err("cannot carry a filesystem"));
            }
        }

        match (s.min_size, s.size) {
            (None, None) => {
                return Err(LayoutError::MissingSize {
                    volume: vol(),
                    structure: s.name.clone(),
                });
            }
            (Some(min_size), Some(size)) if min_size > size => {
                return Err(LayoutError::MinSizeExceedsSize {
                    volume: vol(),
                    structure: s.name.clone(),
                    min_size,
                    size,
                });
            }
            _ => {}
        }
        // rootfs-data and seed are raised to fit their content later
        if s.declared_size() == Some(0) && !matches!(s.role, Role::RootfsData | Role::Seed) {
            return Err(LayoutError::ZeroSize {
                volume: vol(),
                structure: s.name.clone(),
            });
        }

        if s.filesystem.is_some() && s.images().next().is_some() {
            return Err(LayoutError::MixedContent {
                volume: vol(),
                structure: s.name.clone(),
            });
        }
        if s.filesystem.is_none() && s.files().next().is_some() {
            return Err(LayoutError::FilesNeedFilesystem {
                volume: vol(),
                structure: s.name.clone(),
            });
        }

        if let Some(target) = s.offset_write.as_ref().and_then(|w| w.relative_to.as_ref()) {
            if volume.structure(target).is_none() {
                return Err(LayoutError::UnknownReference {
                    volume: vol(),
                    structure: s.name.clone(),
                    target: target.clone(),
                });
            }
        }
    }

    let limit = match volume.schema {
        Schema::Mbr => MBR_MAX_PARTITIONS,
        Schema::Hybrid => HYBRID_MAX_MIRRORED,
        Schema::Gpt => usize::MAX,
    };
    if mbr_entries > limit {
        return Err(LayoutError::TooManyMbrPartitions {
            volume: vol(),
            count: mbr_entries,
            limit,
        });
    }

    Ok(())
}

/// Copy the unpack tree to `dest` for debugging.
///
/// Failures are logged and otherwise ignored.
pub fn mirror_unpack(ops: &dyn SystemOps, unpack: &Path, dest: &Path) {
    match copy_tree(ops, unpack, dest) {
        Ok(()) => tracing::info!("Preserved unpack directory at {}", dest.display()),
        Err(e) => tracing::warn!(
            "Could not preserve unpack directory at {}: {:#}",
            dest.display(),
            e
        ),
    }
}
