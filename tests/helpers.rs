//! Shared test utilities for recimg integration tests.

#![allow(dead_code)]

use anyhow::Result;
use std::cell::{Cell, RefCell};
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tempfile::TempDir;

use recimg::config::Config;
use recimg::process::{Cmd, CommandResult};
use recimg::state::{self, CommonOptions};
use recimg::sysops::{HostOps, SystemOps};
use recimg::variant::{Pack, PackArgs};

/// GPT type of an EFI system partition.
pub const ESP_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
/// GPT type of a Linux filesystem partition.
pub const LINUX_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

/// Host stand-in for unprivileged tests.
///
/// `cp` runs for real so trees are actually copied; filesystem tools,
/// loop devices and mounts are recorded and succeed without doing anything.
/// Randomness comes from a seeded generator.
pub struct FakeHost {
    pub commands: RefCell<Vec<String>>,
    /// Fail any command whose command line contains this.
    pub fail_on: Option<String>,
    rng: Cell<u64>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::seeded(0x5eed)
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            commands: RefCell::new(Vec::new()),
            fail_on: None,
            rng: Cell::new(seed),
        }
    }

    pub fn failing_on(needle: &str) -> Self {
        Self {
            fail_on: Some(needle.to_string()),
            ..Self::new()
        }
    }

    pub fn ran(&self, program: &str) -> bool {
        self.commands
            .borrow()
            .iter()
            .any(|c| c.split_whitespace().any(|word| word == program))
    }

    fn next_u64(&self) -> u64 {
        // splitmix64
        let mut z = self.rng.get().wrapping_add(0x9E37_79B9_7F4A_7C15);
        self.rng.set(z);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

impl SystemOps for FakeHost {
    fn run(&self, cmd: Cmd) -> Result<CommandResult> {
        let line = cmd.command_line();
        self.commands.borrow_mut().push(line.clone());

        if self.fail_on.as_deref().is_some_and(|needle| line.contains(needle)) {
            return cmd.check(CommandResult {
                status: ExitStatus::from_raw(1 << 8),
                stdout: String::new(),
                stderr: "simulated failure".to_string(),
            });
        }
        if cmd.program() == "cp" {
            return HostOps.run(cmd);
        }

        let stdout = if cmd.program() == "losetup" && cmd.get_args().iter().any(|a| a == "--find") {
            "/dev/loop0\n".to_string()
        } else {
            String::new()
        };
        cmd.check(CommandResult {
            status: ExitStatus::from_raw(0),
            stdout,
            stderr: String::new(),
        })
    }

    fn random_bytes(&self, buf: &mut [u8]) -> std::io::Result<()> {
        for chunk in buf.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
        Ok(())
    }

    fn mount_table(&self) -> std::io::Result<String> {
        Ok(String::new())
    }
}

/// Temporary tree with a gadget directory, a rootfs and a work area.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub gadget: PathBuf,
    pub rootfs: PathBuf,
    pub base: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let gadget = base.join("gadget");
        let rootfs = base.join("rootfs");

        fs::create_dir_all(gadget.join("meta")).expect("Failed to create gadget dir");
        fs::create_dir_all(rootfs.join("etc")).expect("Failed to create rootfs dir");
        fs::write(rootfs.join("etc/hostname"), "recimg\n").expect("Failed to write hostname");

        Self {
            _temp_dir: temp_dir,
            gadget,
            rootfs,
            base,
        }
    }

    pub fn write_gadget(&self, toml: &str) {
        fs::write(self.gadget.join("meta/gadget.toml"), toml).expect("Failed to write gadget.toml");
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.base.join(rel)
    }

    /// Options with an explicit workdir (`work/`) and output dir (`out/`).
    pub fn options(&self) -> CommonOptions {
        CommonOptions {
            workdir: Some(self.path("work")),
            output_dir: Some(self.path("out")),
            ..Default::default()
        }
    }

    /// Build this gadget and rootfs with the pack variant.
    pub fn run_pack(&self, options: CommonOptions, host: &FakeHost) -> Result<()> {
        let variant = Pack::new(PackArgs {
            gadget_dir: self.gadget.clone(),
            rootfs_dir: self.rootfs.clone(),
        });
        state::execute(&variant, options, Config::default(), host)
    }
}

/// Write `len` bytes of `byte` at `path`, creating parents.
pub fn write_filled(path: &Path, len: usize, byte: u8) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    fs::write(path, vec![byte; len]).expect("Failed to write file");
}

pub fn read_range(path: &Path, offset: u64, len: usize) -> Vec<u8> {
    let data = fs::read(path).expect("Failed to read image");
    data[offset as usize..offset as usize + len].to_vec()
}

/// A single-volume GPT gadget: a 50 MiB ESP and a rootfs partition.
pub fn pc_gadget(bootloader: &str) -> String {
    format!(
        r#"
[[volumes]]
name = "pc"
schema = "gpt"
bootloader = "{bootloader}"

[[volumes.structure]]
name = "system-boot"
role = "boot"
type = "{ESP_GUID}"
size = "50M"
filesystem = "vfat"

[[volumes.structure]]
name = "writable"
role = "rootfs-data"
type = "{LINUX_GUID}"
size = "1M"
filesystem = "ext4"
"#
    )
}
