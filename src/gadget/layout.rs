//! Partition layout engine.
//!
//! [`compute_offsets`] is a pure function of a volume and the sector size:
//! calling it twice on the same model yields the same layout. Size
//! resolution ([`resolve_rootfs_size`], [`apply_image_size`]) only ever
//! raises declared sizes and is followed by a fresh layout computation.

use std::collections::BTreeMap;
use std::str::FromStr;

use super::{GadgetInfo, PartitionType, Role, Schema, Volume};
use crate::error::{ConfigError, LayoutError};
use crate::size::{self, align_up, checked_align_up, is_aligned, MIB};

/// Partitions without an explicit offset never start below this.
pub const PARTITION_ALIGNMENT: u64 = MIB;

/// Bytes in a GPT partition entry array (128 entries of 128 bytes).
pub const GPT_ENTRY_ARRAY_BYTES: u64 = 128 * 128;

/// Filesystem metadata headroom added to the measured rootfs.
pub const ROOTFS_PADDING: u64 = 8 * MIB;

/// Sectors occupied by one copy of the GPT entry array.
pub fn gpt_entry_sectors(sector_size: u64) -> u64 {
    GPT_ENTRY_ARRAY_BYTES.div_ceil(sector_size)
}

/// First byte past the partition table at the start of the disk.
pub fn table_end(schema: Schema, sector_size: u64) -> u64 {
    match schema {
        Schema::Mbr => sector_size,
        // protective MBR + header + entry array
        Schema::Gpt | Schema::Hybrid => (2 + gpt_entry_sectors(sector_size)) * sector_size,
    }
}

/// Bytes the schema needs after the last structure (backup GPT).
pub fn trailing_overhead(schema: Schema, sector_size: u64) -> u64 {
    match schema {
        Schema::Mbr => 0,
        Schema::Gpt | Schema::Hybrid => (1 + gpt_entry_sectors(sector_size)) * sector_size,
    }
}

/// Placement of one structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureLayout {
    pub name: String,
    /// Position in the volume's declaration order.
    pub index: usize,
    pub role: Role,
    pub offset: u64,
    pub size: u64,
    /// Gets a partition table entry.
    pub partition: bool,
}

impl StructureLayout {
    /// First byte past the structure. [`compute_offsets`] rejects layouts
    /// where this would not fit in a `u64`.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

/// Computed layout of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLayout {
    pub volume: String,
    pub schema: Schema,
    pub sector_size: u64,
    pub structures: Vec<StructureLayout>,
    /// Farthest structure end; the volume's minimum size.
    pub min_size: u64,
}

impl VolumeLayout {
    pub fn structure(&self, name: &str) -> Option<&StructureLayout> {
        self.structures.iter().find(|s| s.name == name)
    }
}

/// Compute offsets and sizes for every structure of `volume`.
pub fn compute_offsets(volume: &Volume, sector_size: u64) -> Result<VolumeLayout, LayoutError> {
    let table_end = table_end(volume.schema, sector_size);
    let mut structures: Vec<StructureLayout> = Vec::with_capacity(volume.structures.len());
    let mut farthest = 0u64;

    for (index, s) in volume.structures.iter().enumerate() {
        let declared = s.declared_size().ok_or_else(|| LayoutError::MissingSize {
            volume: volume.name.clone(),
            structure: s.name.clone(),
        })?;
        let ty = s.partition_type().map_err(|reason| LayoutError::InvalidType {
            volume: volume.name.clone(),
            structure: s.name.clone(),
            ty: s.type_id.clone(),
            reason,
        })?;
        let partition = matches!(ty, PartitionType::Id { .. });
        let raw_mbr = ty == PartitionType::Mbr;
        let out_of_range = |offset: u64, size: u64| LayoutError::OutOfRange {
            volume: volume.name.clone(),
            structure: s.name.clone(),
            offset,
            size,
        };

        let size = if partition {
            checked_align_up(declared, sector_size).ok_or_else(|| out_of_range(0, declared))?
        } else {
            declared
        };

        let previous_end = structures.last().map(StructureLayout::end).unwrap_or(0);
        let offset = match s.offset {
            Some(offset) => offset,
            None if raw_mbr => 0,
            None if partition => {
                checked_align_up(previous_end.max(PARTITION_ALIGNMENT), sector_size)
                    .ok_or_else(|| out_of_range(previous_end, size))?
            }
            None => previous_end.max(table_end),
        };
        let end = offset
            .checked_add(size)
            .ok_or_else(|| out_of_range(offset, size))?;

        if partition && !is_aligned(offset, sector_size) {
            return Err(LayoutError::Unaligned {
                volume: volume.name.clone(),
                structure: s.name.clone(),
                offset,
                sector_size,
            });
        }
        if !raw_mbr && offset < table_end {
            return Err(LayoutError::OverlapsTable {
                volume: volume.name.clone(),
                structure: s.name.clone(),
                offset,
                table_end,
            });
        }
        if let Some(previous) = structures.last() {
            if offset < previous.end() {
                return Err(LayoutError::Overlap {
                    volume: volume.name.clone(),
                    structure: s.name.clone(),
                    offset,
                    previous: previous.name.clone(),
                    previous_end: previous.end(),
                });
            }
        }

        farthest = farthest.max(end);
        structures.push(StructureLayout {
            name: s.name.clone(),
            index,
            role: s.role,
            offset,
            size,
            partition,
        });
    }

    Ok(VolumeLayout {
        volume: volume.name.clone(),
        schema: volume.schema,
        sector_size,
        structures,
        min_size: farthest,
    })
}

/// Size the primary structure needs for `content_bytes` of rootfs:
/// 1.5 times the content plus [`ROOTFS_PADDING`].
pub fn rootfs_size_for(content_bytes: u64) -> u64 {
    content_bytes + content_bytes.div_ceil(2) + ROOTFS_PADDING
}

/// Raise the primary structure to fit `content_bytes` of rootfs.
///
/// Returns the resolved size of the primary structure.
pub fn resolve_rootfs_size(
    gadget: &mut GadgetInfo,
    content_bytes: u64,
    sector_size: u64,
) -> Result<u64, LayoutError> {
    let role = gadget.primary_role();
    let (vi, si) = gadget
        .primary()
        .ok_or(LayoutError::MissingRole(role.as_str()))?;

    let needed = align_up(rootfs_size_for(content_bytes), sector_size);
    let structure = &mut gadget.volumes[vi].structures[si];
    let declared = structure.declared_size().unwrap_or(0);

    if needed > declared {
        tracing::debug!(
            "raising {} '{}' from {} to {}",
            role.as_str(),
            structure.name,
            size::human(declared),
            size::human(needed)
        );
        structure.size = Some(needed);
        Ok(needed)
    } else {
        Ok(align_up(declared, sector_size))
    }
}

/// Grow the primary structure so its volume reaches `requested` bytes.
///
/// A request below the computed minimum is ignored with a warning. The
/// primary is only grown when no later structure in the volume is pinned
/// to an explicit offset; otherwise the model is left alone and the request
/// acts purely as an image size floor.
pub fn apply_image_size(
    gadget: &mut GadgetInfo,
    volume: &str,
    requested: u64,
    sector_size: u64,
) -> Result<(), LayoutError> {
    let Some(vi) = gadget.volumes.iter().position(|v| v.name == volume) else {
        return Ok(());
    };
    let layout = compute_offsets(&gadget.volumes[vi], sector_size)?;

    if requested < layout.min_size {
        tracing::warn!(
            "Requested image size {} for volume '{}' is smaller than the minimum {}; using the minimum",
            size::human(requested),
            volume,
            size::human(layout.min_size)
        );
        return Ok(());
    }

    let role = gadget.primary_role();
    let growth = align_up(requested - layout.min_size, sector_size);
    if growth == 0 {
        return Ok(());
    }
    let structures = &mut gadget.volumes[vi].structures;
    let Some(si) = structures.iter().position(|s| s.role == role) else {
        return Ok(());
    };
    if let Some(pinned) = structures[si + 1..].iter().find(|s| s.offset.is_some()) {
        tracing::debug!(
            "'{}' is pinned at an explicit offset after '{}'; image size {} for volume '{}' applies as a floor only",
            pinned.name,
            structures[si].name,
            size::human(requested),
            volume
        );
        return Ok(());
    }

    let current = layout.structures[si].size;
    let grown = current
        .checked_add(growth)
        .ok_or_else(|| LayoutError::OutOfRange {
            volume: volume.to_string(),
            structure: structures[si].name.clone(),
            offset: layout.structures[si].offset,
            size: current,
        })?;
    structures[si].size = Some(grown);
    Ok(())
}

/// Which volume an `--image-size` entry targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeRef {
    Name(String),
    Index(usize),
}

/// Parsed `--image-size` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSizeRequest {
    /// One size for every volume.
    All(u64),
    /// `VOL:SIZE[,VOL:SIZE...]`.
    PerVolume(Vec<(VolumeRef, u64)>),
}

impl FromStr for ImageSizeRequest {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.contains(':') {
            return Ok(ImageSizeRequest::All(size::parse_size(s)?));
        }

        let mut entries = Vec::new();
        for part in s.split(',') {
            let (vol, value) = part
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidSize(part.to_string()))?;
            let vol = vol.trim();
            if vol.is_empty() {
                return Err(ConfigError::InvalidSize(part.to_string()));
            }
            let target = match vol.parse::<usize>() {
                Ok(index) => VolumeRef::Index(index),
                Err(_) => VolumeRef::Name(vol.to_string()),
            };
            entries.push((target, size::parse_size(value)?));
        }
        Ok(ImageSizeRequest::PerVolume(entries))
    }
}

impl ImageSizeRequest {
    /// Map the request onto volume names, in declaration order.
    pub fn resolve(&self, gadget: &GadgetInfo) -> Result<BTreeMap<String, u64>, ConfigError> {
        let mut sizes = BTreeMap::new();
        match self {
            ImageSizeRequest::All(bytes) => {
                for volume in &gadget.volumes {
                    sizes.insert(volume.name.clone(), *bytes);
                }
            }
            ImageSizeRequest::PerVolume(entries) => {
                for (target, bytes) in entries {
                    let name = match target {
                        VolumeRef::Index(i) => gadget
                            .volumes
                            .get(*i)
                            .map(|v| v.name.clone())
                            .ok_or_else(|| ConfigError::UnknownVolume(i.to_string()))?,
                        VolumeRef::Name(name) => gadget
                            .volume(name)
                            .map(|v| v.name.clone())
                            .ok_or_else(|| ConfigError::UnknownVolume(name.clone()))?,
                    };
                    sizes.insert(name, *bytes);
                }
            }
        }
        Ok(sizes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gadget(src: &str) -> GadgetInfo {
        toml::from_str(src).unwrap()
    }

    const PC: &str = r#"
        [[volumes]]
        name = "pc"

        [[volumes.structure]]
        name = "mbr"
        role = "raw-mbr"
        type = "mbr"
        size = 440

        [[volumes.structure]]
        name = "esp"
        role = "boot"
        type = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"
        size = "50M"
        filesystem = "vfat"

        [[volumes.structure]]
        name = "writable"
        role = "rootfs-data"
        type = "0FC63DAF-8483-4772-8E79-3D69D8477DE4"
        size = 1000
        filesystem = "ext4"
    "#;

    #[test]
    fn test_default_offsets() {
        let g = gadget(PC);
        let layout = compute_offsets(&g.volumes[0], 512).unwrap();

        assert_eq!(layout.structures[0].offset, 0);
        assert_eq!(layout.structures[0].size, 440);
        assert!(!layout.structures[0].partition);

        assert_eq!(layout.structures[1].offset, MIB);
        assert_eq!(layout.structures[2].offset, 51 * MIB);
        // rounded to a whole sector
        assert_eq!(layout.structures[2].size, 1024);
        assert_eq!(layout.min_size, 51 * MIB + 1024);
    }

    #[test]
    fn test_layout_is_idempotent() {
        let g = gadget(PC);
        let first = compute_offsets(&g.volumes[0], 4096).unwrap();
        let second = compute_offsets(&g.volumes[0], 4096).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.structures[2].size, 4096);
    }

    #[test]
    fn test_overlap_is_rejected() {
        let mut g = gadget(PC);
        g.volumes[0].structures[2].offset = Some(2 * MIB);
        assert!(matches!(
            compute_offsets(&g.volumes[0], 512),
            Err(LayoutError::Overlap { ref previous, .. }) if previous == "esp"
        ));
    }

    #[test]
    fn test_partition_table_region_is_reserved() {
        let mut g = gadget(PC);
        g.volumes[0].structures[1].offset = Some(2048);
        assert_eq!(
            compute_offsets(&g.volumes[0], 512),
            Err(LayoutError::OverlapsTable {
                volume: "pc".to_string(),
                structure: "esp".to_string(),
                offset: 2048,
                table_end: 34 * 512,
            })
        );
    }

    #[test]
    fn test_unaligned_partition() {
        let mut g = gadget(PC);
        g.volumes[0].structures[1].offset = Some(MIB + 100);
        assert!(matches!(
            compute_offsets(&g.volumes[0], 512),
            Err(LayoutError::Unaligned { .. })
        ));
    }

    #[test]
    fn test_huge_offset_is_out_of_range() {
        let mut g = gadget(PC);
        g.volumes[0].structures[2].offset = Some(u64::MAX - 511);
        assert!(matches!(
            compute_offsets(&g.volumes[0], 512),
            Err(LayoutError::OutOfRange { ref structure, .. }) if structure == "writable"
        ));

        g.volumes[0].structures[2].offset = None;
        g.volumes[0].structures[2].size = Some(u64::MAX - 10);
        assert!(matches!(
            compute_offsets(&g.volumes[0], 512),
            Err(LayoutError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_table_geometry() {
        assert_eq!(table_end(Schema::Mbr, 512), 512);
        assert_eq!(table_end(Schema::Gpt, 512), 34 * 512);
        assert_eq!(table_end(Schema::Gpt, 4096), 6 * 4096);
        assert_eq!(trailing_overhead(Schema::Gpt, 512), 33 * 512);
        assert_eq!(trailing_overhead(Schema::Mbr, 512), 0);
    }

    #[test]
    fn test_rootfs_size_heuristic() {
        assert_eq!(rootfs_size_for(0), ROOTFS_PADDING);
        assert_eq!(rootfs_size_for(8 * MIB), 12 * MIB + ROOTFS_PADDING);
        assert_eq!(rootfs_size_for(3), 5 + ROOTFS_PADDING);
    }

    #[test]
    fn test_resolve_only_raises() {
        let mut g = gadget(PC);
        let resolved = resolve_rootfs_size(&mut g, 8 * MIB, 512).unwrap();
        assert_eq!(resolved, 20 * MIB);
        assert_eq!(g.volumes[0].structures[2].size, Some(20 * MIB));

        g.volumes[0].structures[2].size = Some(100 * MIB);
        let resolved = resolve_rootfs_size(&mut g, MIB, 512).unwrap();
        assert_eq!(resolved, 100 * MIB);
        assert_eq!(g.volumes[0].structures[2].size, Some(100 * MIB));
    }

    #[test]
    fn test_image_size_grows_primary() {
        let mut g = gadget(PC);
        resolve_rootfs_size(&mut g, 8 * MIB, 512).unwrap();
        apply_image_size(&mut g, "pc", 4 * size::GIB, 512).unwrap();

        let layout = compute_offsets(&g.volumes[0], 512).unwrap();
        assert_eq!(layout.min_size, 4 * size::GIB);
    }

    #[test]
    fn test_image_size_below_minimum_is_ignored() {
        let mut g = gadget(PC);
        apply_image_size(&mut g, "pc", MIB, 512).unwrap();
        assert_eq!(g.volumes[0].structures[2].size, Some(1000));
    }

    #[test]
    fn test_image_size_request_parsing() {
        assert_eq!(
            "4G".parse::<ImageSizeRequest>().unwrap(),
            ImageSizeRequest::All(4 * size::GIB)
        );
        assert_eq!(
            "pc:1G,1:2G".parse::<ImageSizeRequest>().unwrap(),
            ImageSizeRequest::PerVolume(vec![
                (VolumeRef::Name("pc".to_string()), size::GIB),
                (VolumeRef::Index(1), 2 * size::GIB),
            ])
        );
        assert!(":1G".parse::<ImageSizeRequest>().is_err());
        assert!("pc:lots".parse::<ImageSizeRequest>().is_err());
    }

    #[test]
    fn test_image_size_request_resolution() {
        let g = gadget(PC);
        let sizes = ImageSizeRequest::PerVolume(vec![(VolumeRef::Index(0), MIB)])
            .resolve(&g)
            .unwrap();
        assert_eq!(sizes.get("pc"), Some(&MIB));

        let err = ImageSizeRequest::PerVolume(vec![(VolumeRef::Name("dragon".into()), MIB)])
            .resolve(&g)
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownVolume("dragon".to_string()));

        let err = ImageSizeRequest::PerVolume(vec![(VolumeRef::Index(3), MIB)])
            .resolve(&g)
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownVolume("3".to_string()));
    }
}
