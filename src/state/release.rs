//! Acquire/release discipline for OS resources.
//!
//! Whatever acquires a loop device, mount or diversion pushes the matching
//! [`Release`] before doing anything that depends on it. Releases run in LIFO
//! order and every one is attempted; failures are collected, never dropped.

use anyhow::{anyhow, Error, Result};
use std::path::{Path, PathBuf};

use crate::process::Cmd;
use crate::sysops::SystemOps;

/// A typed release action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// `umount <path>`
    Unmount(PathBuf),
    /// `losetup --detach <device>`
    DetachLoop(String),
    /// Undo a `dpkg-divert --rename` inside a chroot.
    UndoDivert { root: PathBuf, path: String },
}

impl Release {
    fn command(&self) -> Cmd {
        match self {
            Release::Unmount(path) => Cmd::new("umount")
                .arg_path(path)
                .error_msg(format!("Failed to unmount {}", path.display())),
            Release::DetachLoop(device) => Cmd::new("losetup")
                .args(["--detach", device.as_str()])
                .error_msg(format!("Failed to detach loop device {}", device)),
            Release::UndoDivert { root, path } => Cmd::new("chroot")
                .arg_path(root)
                .args(["dpkg-divert", "--local", "--rename", "--remove", path.as_str()])
                .error_msg(format!("Failed to remove diversion of {}", path)),
        }
    }

    /// Run the release.
    pub fn run(&self, ops: &dyn SystemOps) -> Result<()> {
        tracing::debug!("release: {}", self.command().command_line());
        ops.run(self.command())?;
        Ok(())
    }
}

/// Marker returned by [`ReleaseStack::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark(usize);

/// LIFO stack of pending releases.
#[derive(Debug, Default)]
pub struct ReleaseStack {
    pending: Vec<Release>,
}

impl ReleaseStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, release: Release) {
        self.pending.push(release);
    }

    pub fn mark(&self) -> Mark {
        Mark(self.pending.len())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> &[Release] {
        &self.pending
    }

    /// Paths this stack will unmount.
    pub fn tracked_mounts(&self) -> impl Iterator<Item = &Path> {
        self.pending.iter().filter_map(|r| match r {
            Release::Unmount(path) => Some(path.as_path()),
            _ => None,
        })
    }

    /// Release everything pushed since `mark`, newest first.
    pub fn unwind_to(&mut self, ops: &dyn SystemOps, mark: Mark) -> Vec<Error> {
        let mut errors = Vec::new();
        while self.pending.len() > mark.0 {
            let Some(release) = self.pending.pop() else {
                break;
            };
            if let Err(e) = release.run(ops) {
                tracing::warn!("{:#}", e);
                errors.push(e);
            }
        }
        errors
    }

    /// Release everything, newest first.
    pub fn unwind_all(&mut self, ops: &dyn SystemOps) -> Vec<Error> {
        self.unwind_to(ops, Mark(0))
    }
}

/// Fold cleanup errors into the outcome of the work they followed.
pub fn join_errors(outcome: Result<()>, cleanup: Vec<Error>) -> Result<()> {
    if cleanup.is_empty() {
        return outcome;
    }
    let joined = cleanup
        .iter()
        .map(|e| format!("{:#}", e))
        .collect::<Vec<_>>()
        .join("; ");
    match outcome {
        Ok(()) => Err(anyhow!("cleanup failed: {}", joined)),
        Err(e) => Err(e.context(format!("cleanup also failed: {}", joined))),
    }
}

/// Mount points in a `/proc/self/mounts` style table that lie under `root`,
/// deepest first.
pub fn mounts_under(table: &str, root: &Path) -> Vec<PathBuf> {
    let mut mounts: Vec<PathBuf> = table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(decode_mount_field(field)))
        .filter(|path| path.starts_with(root))
        .collect();
    mounts.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| b.cmp(a))
    });
    mounts.dedup();
    mounts
}

/// Undo the octal escapes the kernel uses for whitespace and backslashes.
fn decode_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let digits = field.get(i + 1..i + 4).unwrap_or("");
            let octal = digits.len() == 3 && digits.bytes().all(|b| (b'0'..=b'7').contains(&b));
            if let Some(value) = octal.then(|| u8::from_str_radix(digits, 8).ok()).flatten() {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
