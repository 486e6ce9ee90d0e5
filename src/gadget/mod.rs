//! Gadget volume model.
//!
//! A gadget describes one or more volumes (target disk images), each an
//! ordered list of structures (partitions or raw regions). The model is
//! loaded once by [`load`], resized by [`layout::resolve_rootfs_size`], and
//! read-only afterwards.

pub mod layout;
pub mod load;

pub use layout::{compute_offsets, StructureLayout, VolumeLayout};
pub use load::{load, mirror_unpack, validate};

use serde::{Deserialize, Serialize};
use uguid::Guid;

use crate::size;

/// Parsed gadget description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GadgetInfo {
    /// Volumes in declaration order.
    pub volumes: Vec<Volume>,
}

impl GadgetInfo {
    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.name == name)
    }

    /// A seeded gadget carries its OS in a `seed` structure instead of
    /// `rootfs-data`.
    pub fn is_seeded(&self) -> bool {
        self.volumes
            .iter()
            .flat_map(|v| &v.structures)
            .any(|s| s.role == Role::Seed)
    }

    /// Role of the structure that receives the rootfs.
    pub fn primary_role(&self) -> Role {
        if self.is_seeded() {
            Role::Seed
        } else {
            Role::RootfsData
        }
    }

    /// Volume index and structure index of the primary structure.
    pub fn primary(&self) -> Option<(usize, usize)> {
        let role = self.primary_role();
        self.volumes.iter().enumerate().find_map(|(vi, v)| {
            v.structures
                .iter()
                .position(|s| s.role == role)
                .map(|si| (vi, si))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Volume {
    pub name: String,
    #[serde(default)]
    pub schema: Schema,
    #[serde(default)]
    pub bootloader: Option<Bootloader>,
    #[serde(default, rename = "structure")]
    pub structures: Vec<Structure>,
}

impl Volume {
    pub fn structure(&self, name: &str) -> Option<&Structure> {
        self.structures.iter().find(|s| s.name == name)
    }
}

/// Partition table flavour written to the disk image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schema {
    Mbr,
    #[default]
    Gpt,
    Hybrid,
}

impl Schema {
    pub fn as_str(self) -> &'static str {
        match self {
            Schema::Mbr => "mbr",
            Schema::Gpt => "gpt",
            Schema::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bootloader {
    Grub,
    UBoot,
    Piboot,
    Lk,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "rootfs-data")]
    RootfsData,
    #[serde(rename = "seed")]
    Seed,
    #[serde(rename = "boot")]
    Boot,
    #[serde(rename = "raw-mbr", alias = "mbr")]
    RawMbr,
    #[default]
    #[serde(rename = "none")]
    Other,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::RootfsData => "rootfs-data",
            Role::Seed => "seed",
            Role::Boot => "boot",
            Role::RawMbr => "raw-mbr",
            Role::Other => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    Ext4,
    Vfat,
}

impl Filesystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Filesystem::Ext4 => "ext4",
            Filesystem::Vfat => "vfat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Structure {
    pub name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(rename = "type")]
    pub type_id: String,
    #[serde(default, deserialize_with = "size::deserialize_opt")]
    pub offset: Option<u64>,
    #[serde(default, deserialize_with = "size::deserialize_opt")]
    pub min_size: Option<u64>,
    #[serde(default, deserialize_with = "size::deserialize_opt")]
    pub size: Option<u64>,
    #[serde(default)]
    pub filesystem: Option<Filesystem>,
    #[serde(default, rename = "filesystem-label")]
    pub label: Option<String>,
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub offset_write: Option<OffsetWrite>,
}

impl Structure {
    /// Declared size, falling back to `min-size`.
    pub fn declared_size(&self) -> Option<u64> {
        self.size.or(self.min_size)
    }

    pub fn partition_type(&self) -> Result<PartitionType, String> {
        PartitionType::parse(&self.type_id)
    }

    /// Whether this structure gets an entry in the partition table.
    pub fn is_partition(&self) -> bool {
        matches!(self.partition_type(), Ok(PartitionType::Id { .. }))
    }

    pub fn filesystem_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    /// Seeded images carry their boot and data content inside the seed, so
    /// the classic boot/data structures are left out entirely.
    pub fn skipped_when(&self, seeded: bool) -> bool {
        seeded && matches!(self.role, Role::Boot | Role::RootfsData)
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageContent> {
        self.content.iter().filter_map(|c| match c {
            Content::Image(image) => Some(image),
            Content::File(_) => None,
        })
    }

    pub fn files(&self) -> impl Iterator<Item = &FileContent> {
        self.content.iter().filter_map(|c| match c {
            Content::File(file) => Some(file),
            Content::Image(_) => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Image(ImageContent),
    File(FileContent),
}

/// A raw blob copied into a structure without a filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageContent {
    pub image: String,
    #[serde(default, deserialize_with = "size::deserialize_opt")]
    pub offset: Option<u64>,
    #[serde(default, deserialize_with = "size::deserialize_opt")]
    pub size: Option<u64>,
}

/// A gadget file or directory copied into a structure's filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileContent {
    pub source: String,
    pub target: String,
}

/// Patch this structure's sector offset into the image at `offset`
/// (relative to the named structure when `relative-to` is set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OffsetWrite {
    #[serde(deserialize_with = "size::deserialize_required")]
    pub offset: u64,
    #[serde(default)]
    pub relative_to: Option<String>,
}

/// Decoded structure type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    /// The raw MBR boot code region.
    Mbr,
    /// Raw region with no partition table entry.
    Bare,
    /// A table entry: MBR id, GPT type GUID, or both (hybrid).
    Id { mbr: Option<u8>, gpt: Option<Guid> },
}

impl PartitionType {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        match raw.to_ascii_lowercase().as_str() {
            "mbr" => return Ok(PartitionType::Mbr),
            "bare" => return Ok(PartitionType::Bare),
            _ => {}
        }

        if let Some((mbr, gpt)) = raw.split_once(',') {
            return Ok(PartitionType::Id {
                mbr: Some(parse_mbr_id(mbr)?),
                gpt: Some(parse_guid(gpt)?),
            });
        }

        if raw.len() == 2 {
            Ok(PartitionType::Id {
                mbr: Some(parse_mbr_id(raw)?),
                gpt: None,
            })
        } else {
            Ok(PartitionType::Id {
                mbr: None,
                gpt: Some(parse_guid(raw)?),
            })
        }
    }
}

fn parse_mbr_id(raw: &str) -> Result<u8, String> {
    let raw = raw.trim();
    if raw.len() != 2 {
        return Err(format!("MBR id '{raw}' must be two hex digits"));
    }
    u8::from_str_radix(raw, 16).map_err(|_| format!("MBR id '{raw}' is not hexadecimal"))
}

fn parse_guid(raw: &str) -> Result<Guid, String> {
    raw.trim()
        .parse::<Guid>()
        .map_err(|_| format!("'{}' is not a GUID", raw.trim()))
}
