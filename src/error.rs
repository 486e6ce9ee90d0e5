//! Typed errors for the image builder.
//!
//! Components return these through `anyhow::Error`; callers that need to
//! distinguish a category (tests, the CLI exit path) downcast.
//!
//! ```text
//! ConfigError      conflicting flags, unknown steps, bad sizes
//! ResumeError      missing or incompatible resume metadata
//! LayoutError      gadget model and partition layout violations
//! PlacementError   partition image zero-fill / format / copy
//! BootloaderError  boot content relocation and grub installation
//! DiskError        disk image creation, tables, data copy, offset patches
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Fatal before any filesystem mutation; never retried.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--{0} and --{1} cannot be used together")]
    ConflictingFlags(&'static str, &'static str),

    #[error("only one of --debug, --verbose or --quiet may be given")]
    MultipleLogLevels,

    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("--{0} requires an explicit --workdir")]
    WorkdirRequired(&'static str),

    #[error("invalid sector size {0}: must be 512 or 4096")]
    InvalidSectorSize(u64),

    #[error("invalid size '{0}'")]
    InvalidSize(String),

    #[error("--image-size names unknown volume '{0}'")]
    UnknownVolume(String),
}

#[derive(Error, Debug)]
pub enum ResumeError {
    #[error("no prior run to resume: metadata file {0} does not exist")]
    NoPriorRun(PathBuf),

    #[error("resume metadata in {path} was written by a different step list ({found}); expected {expected}")]
    Incompatible {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("failed to read resume metadata {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse resume metadata {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LayoutError {
    #[error("gadget declares no volumes")]
    NoVolumes,

    #[error("volume '{0}' is declared more than once")]
    DuplicateVolume(String),

    #[error("volume '{volume}': structure '{structure}' is declared more than once")]
    DuplicateStructure { volume: String, structure: String },

    #[error("volume '{volume}': structure '{structure}' at offset {offset} overlaps '{previous}' which ends at {previous_end}")]
    Overlap {
        volume: String,
        structure: String,
        offset: u64,
        previous: String,
        previous_end: u64,
    },

    #[error("volume '{volume}': structure '{structure}' at offset {offset} overlaps the partition table which ends at {table_end}")]
    OverlapsTable {
        volume: String,
        structure: String,
        offset: u64,
        table_end: u64,
    },

    #[error("volume '{volume}': structure '{structure}' offset {offset} is not aligned to {sector_size}-byte sectors")]
    Unaligned {
        volume: String,
        structure: String,
        offset: u64,
        sector_size: u64,
    },

    #[error("volume '{volume}': structure '{structure}' has neither size nor min-size")]
    MissingSize { volume: String, structure: String },

    #[error("volume '{volume}': structure '{structure}' has zero size")]
    ZeroSize { volume: String, structure: String },

    #[error("volume '{volume}': structure '{structure}' of {size} bytes at offset {offset} runs past the largest possible image")]
    OutOfRange {
        volume: String,
        structure: String,
        offset: u64,
        size: u64,
    },

    #[error("volume '{volume}': structure '{structure}' min-size {min_size} exceeds size {size}")]
    MinSizeExceedsSize {
        volume: String,
        structure: String,
        min_size: u64,
        size: u64,
    },

    #[error("volume '{volume}': structure '{structure}' has invalid type '{ty}': {reason}")]
    InvalidType {
        volume: String,
        structure: String,
        ty: String,
        reason: String,
    },

    #[error("volume '{volume}': mbr structure '{structure}' {reason}")]
    InvalidMbrStructure {
        volume: String,
        structure: String,
        reason: String,
    },

    #[error("volume '{volume}': structure '{structure}' has a filesystem and raw image content")]
    MixedContent { volume: String, structure: String },

    #[error("volume '{volume}': structure '{structure}' maps files but declares no filesystem")]
    FilesNeedFilesystem { volume: String, structure: String },

    #[error("gadget has no structure with role '{0}'")]
    MissingRole(&'static str),

    #[error("volume '{volume}' has more than one structure with role '{role}'")]
    DuplicateRole { volume: String, role: &'static str },

    #[error("gadget has '{role}' structures in more than one volume ({first} and {second})")]
    PrimaryInMultipleVolumes {
        role: &'static str,
        first: String,
        second: String,
    },

    #[error("volume '{volume}': structure '{structure}' offset-write refers to unknown structure '{target}'")]
    UnknownReference {
        volume: String,
        structure: String,
        target: String,
    },

    #[error("volume '{volume}' has {count} MBR partitions but the table holds at most {limit}")]
    TooManyMbrPartitions {
        volume: String,
        count: usize,
        limit: usize,
    },
}

/// Partition image preparation; one variant per failure mode.
#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("failed to zero-fill partition image for structure '{structure}' at {path}")]
    ZeroFill {
        structure: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create {fs} filesystem for structure '{structure}'")]
    Format {
        structure: String,
        fs: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to copy content into structure '{structure}'")]
    Copy {
        structure: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Error, Debug)]
pub enum BootloaderError {
    #[error("got lk bootloader but bootloader directory {0} does not exist")]
    MissingBootDir(PathBuf),

    #[error("failed to create directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read boot directory {path}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to copy {from} to {to}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to move {from} to {to}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no grub target for architecture '{0}'")]
    UnsupportedArch(String),

    #[error("volume '{volume}' has no {what} partition for grub")]
    MissingPartition { volume: String, what: &'static str },
}

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("failed to create disk image {path}")]
    CreateImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {schema} partition table to {path}: {reason}")]
    PartitionTable {
        path: PathBuf,
        schema: String,
        reason: String,
    },

    #[error("failed to generate a unique disk ID after {attempts} attempts; random generator failure?")]
    DiskIdExhausted { attempts: usize },

    #[error("failed to write disk signature to {path}")]
    DiskSignature {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to copy partition image {image} for structure '{structure}' into disk")]
    CopyData {
        structure: String,
        image: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("offset-write for structure '{structure}' at byte {location} is outside the {image_size}-byte image")]
    OffsetOutOfRange {
        structure: String,
        location: u64,
        image_size: u64,
    },

    #[error("offset of structure '{structure}' is {sector} sectors, beyond a 32-bit offset-write")]
    OffsetValueTooLarge { structure: String, sector: u64 },

    #[error("failed to write offset value for structure '{structure}' at byte {location}")]
    OffsetWrite {
        structure: String,
        location: u64,
        #[source]
        source: std::io::Error,
    },
}
