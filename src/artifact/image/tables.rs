//! Partition table writers.
//!
//! MBR tables are encoded directly; GPT tables go through `gpt_disk_io` with a
//! file-backed [`BlockIo`]. A hybrid table is a GPT whose protective MBR is
//! replaced by a 0xEE entry followed by up to three mirrored partitions.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use gpt_disk_io::{BlockIo, Disk};
use gpt_disk_types::{
    BlockSize, GptHeader, GptPartitionEntryArray, GptPartitionName, GptPartitionType, Lba, LbaLe,
    U32Le,
};
use uguid::Guid;

use crate::error::DiskError;
use crate::gadget::layout::{gpt_entry_sectors, GPT_ENTRY_ARRAY_BYTES};
use crate::gadget::{PartitionType, Schema, Volume, VolumeLayout};
use crate::sysops::SystemOps;

/// Byte offset of the MBR disk signature.
pub const DISK_SIGNATURE_OFFSET: u64 = 440;

const MBR_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const GPT_PROTECTIVE_TYPE: u8 = 0xEE;

/// Attempts at drawing a fresh disk id before giving up.
pub const DISK_ID_ATTEMPTS: usize = 10;

/// One partition table entry, in sectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub name: String,
    pub mbr_type: Option<u8>,
    pub gpt_type: Option<Guid>,
    pub first_lba: u64,
    pub sectors: u64,
}

/// Table entries for the structures of `volume` that are written to disk.
pub fn table_entries(volume: &Volume, layout: &VolumeLayout, seeded: bool) -> Vec<TableEntry> {
    volume
        .structures
        .iter()
        .zip(&layout.structures)
        .filter(|(s, _)| !s.skipped_when(seeded))
        .filter_map(|(s, l)| match s.partition_type() {
            Ok(PartitionType::Id { mbr, gpt }) => Some(TableEntry {
                name: s.name.clone(),
                mbr_type: mbr,
                gpt_type: gpt,
                first_lba: l.offset / layout.sector_size,
                sectors: l.size / layout.sector_size,
            }),
            _ => None,
        })
        .collect()
}

/// Draw a random non-zero disk id not in `used`, recording it there.
pub fn generate_disk_id(ops: &dyn SystemOps, used: &mut Vec<u32>) -> Result<u32, DiskError> {
    for attempt in 1..=DISK_ID_ATTEMPTS {
        let mut bytes = [0u8; 4];
        if let Err(e) = ops.random_bytes(&mut bytes) {
            tracing::debug!("disk id attempt {attempt}: random source failed: {e}");
            continue;
        }
        let id = u32::from_le_bytes(bytes);
        if id == 0 || used.contains(&id) {
            tracing::debug!("disk id attempt {attempt}: {id:#010x} rejected");
            continue;
        }
        used.push(id);
        return Ok(id);
    }
    Err(DiskError::DiskIdExhausted {
        attempts: DISK_ID_ATTEMPTS,
    })
}

/// Write the table declared by `schema` into the image at `path`.
pub fn write_partition_table(
    ops: &dyn SystemOps,
    path: &Path,
    schema: Schema,
    entries: &[TableEntry],
    sector_size: u64,
    used_disk_ids: &mut Vec<u32>,
) -> Result<(), DiskError> {
    let table_err = |reason: String| DiskError::PartitionTable {
        path: path.to_path_buf(),
        schema: schema.as_str().to_string(),
        reason,
    };

    match schema {
        Schema::Mbr => {
            let mbr: Vec<_> = entries
                .iter()
                .map(|e| (e.mbr_type.unwrap_or(0x83), e.first_lba, e.sectors))
                .collect();
            write_mbr_entries(path, &mbr).map_err(|e| table_err(e.to_string()))?;
            write_disk_signature(ops, path, used_disk_ids)
        }
        Schema::Gpt => write_gpt(ops, path, entries, sector_size).map_err(table_err),
        Schema::Hybrid => {
            write_gpt(ops, path, entries, sector_size).map_err(table_err)?;

            let mut mbr = vec![(
                GPT_PROTECTIVE_TYPE,
                1,
                1 + gpt_entry_sectors(sector_size),
            )];
            mbr.extend(
                entries
                    .iter()
                    .filter_map(|e| e.mbr_type.map(|t| (t, e.first_lba, e.sectors)))
                    .take(3),
            );
            write_mbr_entries(path, &mbr).map_err(|e| table_err(e.to_string()))?;
            write_disk_signature(ops, path, used_disk_ids)
        }
    }
}

fn write_disk_signature(
    ops: &dyn SystemOps,
    path: &Path,
    used_disk_ids: &mut Vec<u32>,
) -> Result<(), DiskError> {
    let id = generate_disk_id(ops, used_disk_ids)?;
    super::helpers::write_at(path, DISK_SIGNATURE_OFFSET, &id.to_le_bytes()).map_err(|source| {
        DiskError::DiskSignature {
            path: path.to_path_buf(),
            source,
        }
    })?;
    tracing::debug!("disk signature {id:#010x} written to {}", path.display());
    Ok(())
}

/// Encode `(type, first_lba, sectors)` entries into the MBR partition table
/// and set the boot signature. Unused slots are cleared.
fn write_mbr_entries(path: &Path, entries: &[(u8, u64, u64)]) -> io::Result<()> {
    if entries.len() > 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} entries do not fit in an MBR", entries.len()),
        ));
    }

    let mut table = [0u8; 4 * MBR_ENTRY_SIZE + 2];
    for (slot, &(ty, first, sectors)) in entries.iter().enumerate() {
        let first = u32::try_from(first).map_err(|_| lba_overflow(first))?;
        let sectors = u32::try_from(sectors).map_err(|_| lba_overflow(sectors))?;

        let entry = &mut table[slot * MBR_ENTRY_SIZE..(slot + 1) * MBR_ENTRY_SIZE];
        entry[0] = 0x00;
        // CHS fields are unused; LBA-aware firmware expects the maximum.
        entry[1..4].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
        entry[4] = ty;
        entry[5..8].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
        entry[8..12].copy_from_slice(&first.to_le_bytes());
        entry[12..16].copy_from_slice(&sectors.to_le_bytes());
    }
    table[64] = 0x55;
    table[65] = 0xAA;

    super::helpers::write_at(path, MBR_TABLE_OFFSET as u64, &table)
}

fn lba_overflow(value: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{value} does not fit in a 32-bit MBR field"),
    )
}

fn random_guid(ops: &dyn SystemOps) -> Result<Guid, String> {
    let mut bytes = [0u8; 16];
    ops.random_bytes(&mut bytes)
        .map_err(|e| format!("random source failed: {e}"))?;
    Ok(Guid::from_random_bytes(bytes))
}

fn write_gpt(
    ops: &dyn SystemOps,
    path: &Path,
    entries: &[TableEntry],
    sector_size: u64,
) -> Result<(), String> {
    let block_size = u32::try_from(sector_size)
        .ok()
        .and_then(BlockSize::new)
        .ok_or_else(|| format!("unsupported sector size {sector_size}"))?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| e.to_string())?;
    let num_blocks = file.metadata().map_err(|e| e.to_string())?.len() / sector_size;

    let entry_blocks = gpt_entry_sectors(sector_size);
    if num_blocks < 3 + 2 * entry_blocks {
        return Err(format!("{num_blocks} sectors is too small for a GPT"));
    }

    let mut disk = Disk::new(FileBlockIo {
        file,
        block_size,
        sector_size,
        num_blocks,
    })
    .map_err(|e| format!("{e:?}"))?;
    let mut block_buf = vec![0u8; sector_size as usize];

    disk.write_protective_mbr(&mut block_buf)
        .map_err(|e| format!("{e:?}"))?;

    let mut header = GptHeader {
        my_lba: LbaLe::from_u64(1),
        alternate_lba: LbaLe::from_u64(num_blocks - 1),
        first_usable_lba: LbaLe::from_u64(2 + entry_blocks),
        last_usable_lba: LbaLe::from_u64(num_blocks - 2 - entry_blocks),
        disk_guid: random_guid(ops)?,
        partition_entry_lba: LbaLe::from_u64(2),
        number_of_partition_entries: U32Le::from_u32(128),
        ..Default::default()
    };

    let layout = header
        .get_partition_entry_array_layout()
        .map_err(|e| format!("{e:?}"))?;
    let mut storage = vec![0u8; GPT_ENTRY_ARRAY_BYTES as usize];
    let mut array = GptPartitionEntryArray::new(layout, block_size, &mut storage)
        .map_err(|e| format!("{e:?}"))?;

    for (i, e) in entries.iter().enumerate() {
        let gpt_type = e
            .gpt_type
            .ok_or_else(|| format!("structure '{}' has no GPT type", e.name))?;
        let unique = random_guid(ops)?;
        let name: GptPartitionName = e
            .name
            .parse()
            .map_err(|err| format!("partition name '{}': {err:?}", e.name))?;

        let index = i
            .try_into()
            .map_err(|_| format!("partition index {i} out of range"))?;
        let slot = array
            .get_partition_entry_mut(index)
            .ok_or_else(|| format!("no GPT slot for partition {i}"))?;
        slot.partition_type_guid = GptPartitionType(gpt_type);
        slot.unique_partition_guid = unique;
        slot.starting_lba = LbaLe::from_u64(e.first_lba);
        slot.ending_lba = LbaLe::from_u64(e.first_lba + e.sectors - 1);
        slot.name = name;
    }

    header.partition_entry_array_crc32 = array.calculate_crc32();
    header.update_header_crc32();

    disk.write_primary_gpt_header(&header, &mut block_buf)
        .map_err(|e| format!("{e:?}"))?;
    disk.write_gpt_partition_entry_array(&array)
        .map_err(|e| format!("{e:?}"))?;

    let mut secondary = header.clone();
    secondary.my_lba = header.alternate_lba;
    secondary.alternate_lba = header.my_lba;
    secondary.partition_entry_lba = LbaLe::from_u64(num_blocks - 1 - entry_blocks);
    secondary.update_header_crc32();

    let secondary_layout = secondary
        .get_partition_entry_array_layout()
        .map_err(|e| format!("{e:?}"))?;
    let mut secondary_storage = array.storage().to_vec();
    let secondary_array =
        GptPartitionEntryArray::new(secondary_layout, block_size, &mut secondary_storage)
            .map_err(|e| format!("{e:?}"))?;

    disk.write_gpt_partition_entry_array(&secondary_array)
        .map_err(|e| format!("{e:?}"))?;
    disk.write_secondary_gpt_header(&secondary, &mut block_buf)
        .map_err(|e| format!("{e:?}"))?;
    disk.flush().map_err(|e| format!("{e:?}"))?;
    Ok(())
}

/// `gpt_disk_io` block device over a disk image file.
struct FileBlockIo {
    file: File,
    block_size: BlockSize,
    sector_size: u64,
    num_blocks: u64,
}

impl FileBlockIo {
    fn seek_to(&mut self, lba: Lba) -> io::Result<()> {
        let offset = lba.0 * self.sector_size;
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

impl BlockIo for FileBlockIo {
    type Error = io::Error;

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn num_blocks(&mut self) -> Result<u64, Self::Error> {
        Ok(self.num_blocks)
    }

    fn read_blocks(&mut self, start_lba: Lba, dst: &mut [u8]) -> Result<(), Self::Error> {
        self.seek_to(start_lba)?;
        self.file.read_exact(dst)
    }

    fn write_blocks(&mut self, start_lba: Lba, src: &[u8]) -> Result<(), Self::Error> {
        self.seek_to(start_lba)?;
        self.file.write_all(src)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.file.flush()
    }
}
