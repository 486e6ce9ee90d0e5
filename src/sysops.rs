//! System operations capability.
//!
//! Every component that touches the host (spawning tools, creating or moving
//! directories, reading entropy, inspecting the mount table) does so through a
//! [`SystemOps`] reference handed to it by the caller. [`HostOps`] is the real
//! implementation; tests wrap it and override only what they need.

use anyhow::Result;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

use crate::process::{Cmd, CommandResult};

/// Host capabilities used by the builder.
///
/// All methods default to the real host behaviour.
pub trait SystemOps {
    /// Run an external command.
    fn run(&self, cmd: Cmd) -> Result<CommandResult> {
        cmd.run()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        fs::copy(from, to)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        fs::write(path, contents)
    }

    /// Fill `buf` from the kernel entropy pool.
    fn random_bytes(&self, buf: &mut [u8]) -> io::Result<()> {
        fs::File::open("/dev/urandom")?.read_exact(buf)
    }

    /// Raw contents of the live mount table.
    fn mount_table(&self) -> io::Result<String> {
        fs::read_to_string("/proc/self/mounts")
    }
}

/// The real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostOps;

impl SystemOps for HostOps {}

/// Copy the contents of `source` into `target` preserving ownership, modes
/// and links (`cp -a source/. target`).
pub fn copy_tree(ops: &dyn SystemOps, source: &Path, target: &Path) -> Result<()> {
    ops.create_dir_all(target)?;
    ops.run(
        Cmd::new("cp")
            .arg("-a")
            .arg(format!("{}/.", source.display()))
            .arg_path(target)
            .error_msg(format!(
                "Failed to copy '{}' to '{}'",
                source.display(),
                target.display()
            )),
    )?;
    Ok(())
}
