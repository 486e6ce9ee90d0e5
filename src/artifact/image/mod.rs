//! Raw disk image builder.
//!
//! Build process per volume:
//! 1. Stage filesystem content into `volumes/<vol>/part<N>/` (gadget file
//!    mappings, bootloader relocations)
//! 2. Prepare `part<N>.img` for every structure: raw blobs at their offsets,
//!    or a filesystem formatted with its content (`mkfs.ext4 -d`,
//!    `mkfs.vfat` + mtools)
//! 3. Create a sparse disk image sized to the layout
//! 4. Write the MBR, GPT or hybrid partition table
//! 5. Splice partition images into the disk at their offsets
//! 6. Patch offset-write references

mod disk;
mod helpers;
mod mtools;
mod partitions;
mod tables;

pub use disk::{
    copy_data_to_image, create_disk_image, determine_output_directory, disk_image_size,
    write_offset_values, write_volume, VolumeImage,
};
pub use helpers::{check_host_tools, content_size, sparse_copy};
pub use partitions::{part_dir, part_image, stage_file_content, Placement};
pub use tables::{generate_disk_id, table_entries, write_partition_table, TableEntry};
