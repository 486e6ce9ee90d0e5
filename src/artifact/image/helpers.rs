//! Sparse file, content sizing and host tool helpers for image building.

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use walkdir::WalkDir;

use crate::process;

/// Granularity at which zero runs are skipped during sparse copies.
const SPARSE_BLOCK: usize = 4096;

/// Tools the disk pipeline drives, with the package that ships them.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("mkfs.vfat", "dosfstools"),
    ("mkfs.ext4", "e2fsprogs"),
    ("mcopy", "mtools"),
    ("cp", "coreutils"),
];

/// Verify host tools are available.
pub fn check_host_tools(extra_tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = REQUIRED_TOOLS
        .iter()
        .chain(extra_tools.iter())
        .filter(|(tool, _)| !process::exists(tool))
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect();

    if !missing.is_empty() {
        bail!(
            "Missing required tools:\n{}\n\nInstall them first.",
            missing.join("\n")
        );
    }
    Ok(())
}

/// Create (or truncate) a sparse file of exactly `size` bytes.
pub fn create_sparse(path: &Path, size: u64) -> io::Result<()> {
    let file = File::create(path)?;
    file.set_len(size)
}

/// Apparent size of everything under `path`, counting hard links once.
///
/// A missing directory measures as zero.
pub fn content_size(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        let metadata = entry.metadata()?;
        if metadata.nlink() > 1 && !seen.insert((metadata.dev(), metadata.ino())) {
            continue;
        }
        total += metadata.len();
    }
    Ok(total)
}

/// Copy `src` into `dst` at `offset` without truncating `dst`.
///
/// All-zero blocks are skipped so holes in `dst` stay holes. At most `limit`
/// bytes are copied when given. Returns the number of bytes consumed from
/// `src`.
pub fn sparse_copy(src: &Path, dst: &Path, offset: u64, limit: Option<u64>) -> io::Result<u64> {
    let mut input = File::open(src)?;
    let mut output = OpenOptions::new().write(true).open(dst)?;

    let available = input.metadata()?.len();
    let total = limit.map_or(available, |l| l.min(available));

    let mut buf = vec![0u8; SPARSE_BLOCK * 256];
    let mut copied = 0u64;
    while copied < total {
        let want = buf.len().min((total - copied) as usize);
        input.read_exact(&mut buf[..want])?;

        for (i, block) in buf[..want].chunks(SPARSE_BLOCK).enumerate() {
            if block.iter().all(|&b| b == 0) {
                continue;
            }
            let at = offset + copied + (i * SPARSE_BLOCK) as u64;
            output.seek(SeekFrom::Start(at))?;
            output.write_all(block)?;
        }
        copied += want as u64;
    }

    output.flush()?;
    Ok(copied)
}

/// Write `bytes` at `offset` in an existing file.
pub fn write_at(path: &Path, offset: u64, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_required_tools_list() {
        for (tool, package) in REQUIRED_TOOLS {
            assert!(!tool.is_empty());
            assert!(!package.is_empty());
        }
    }

    #[test]
    fn test_content_size_counts_hard_links_once() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();
        fs::write(temp.path().join("etc/hostname"), "recimg\n").unwrap();
        fs::write(temp.path().join("blob"), vec![1u8; 1000]).unwrap();
        fs::hard_link(temp.path().join("blob"), temp.path().join("blob-link")).unwrap();

        assert_eq!(content_size(temp.path()).unwrap(), 1007);
        assert_eq!(content_size(&temp.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn test_sparse_copy_is_non_truncating() {
        let temp = tempfile::tempdir().unwrap();
        let dst = temp.path().join("disk.img");
        create_sparse(&dst, 64 * 1024).unwrap();

        let src = temp.path().join("blob.bin");
        let mut data = vec![0u8; 3 * SPARSE_BLOCK];
        data[SPARSE_BLOCK + 7] = 0xAB;
        data[3 * SPARSE_BLOCK - 1] = 0xCD;
        fs::write(&src, &data).unwrap();

        let copied = sparse_copy(&src, &dst, 8192, None).unwrap();
        assert_eq!(copied, data.len() as u64);

        let disk = fs::read(&dst).unwrap();
        assert_eq!(disk.len(), 64 * 1024);
        assert_eq!(&disk[8192..8192 + data.len()], &data[..]);
        assert!(disk[..8192].iter().all(|&b| b == 0));
        assert!(disk[8192 + data.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sparse_copy_respects_limit() {
        let temp = tempfile::tempdir().unwrap();
        let dst = temp.path().join("disk.img");
        create_sparse(&dst, 4096).unwrap();
        let src = temp.path().join("blob.bin");
        fs::write(&src, vec![0xFFu8; 1000]).unwrap();

        assert_eq!(sparse_copy(&src, &dst, 0, Some(440)).unwrap(), 440);
        let disk = fs::read(&dst).unwrap();
        assert!(disk[..440].iter().all(|&b| b == 0xFF));
        assert!(disk[440..].iter().all(|&b| b == 0));
    }
}
