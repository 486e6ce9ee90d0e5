//! mtools operations for populating FAT images without mounting them.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::process::Cmd;
use crate::sysops::SystemOps;

/// Copy a file or directory tree into a FAT image using mcopy.
pub fn mtools_copy(ops: &dyn SystemOps, image: &Path, src: &Path, dest: &str) -> Result<()> {
    ops.run(
        Cmd::new("mcopy")
            .args(["-s", "-p", "-i"])
            .arg_path(image)
            .arg_path(src)
            .arg(format!("::{}", dest))
            .error_msg(format!("mcopy failed: {} -> {}", src.display(), dest)),
    )?;
    Ok(())
}

/// Copy every entry of `dir` into the root of a FAT image.
pub fn mtools_copy_tree(ops: &dyn SystemOps, image: &Path, dir: &Path) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        mtools_copy(ops, image, &entry.path(), &name.to_string_lossy())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandResult;
    use std::cell::RefCell;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    #[derive(Default)]
    struct Recorder {
        commands: RefCell<Vec<String>>,
    }

    impl SystemOps for Recorder {
        fn run(&self, cmd: Cmd) -> Result<CommandResult> {
            self.commands.borrow_mut().push(cmd.command_line());
            Ok(CommandResult {
                status: ExitStatus::from_raw(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[test]
    fn test_copy_tree_copies_each_entry_in_order() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("part1");
        fs::create_dir_all(dir.join("EFI/BOOT")).unwrap();
        fs::write(dir.join("config.txt"), "arm_64bit=1\n").unwrap();

        let ops = Recorder::default();
        let image = temp.path().join("part1.img");
        mtools_copy_tree(&ops, &image, &dir).unwrap();

        let commands = ops.commands.borrow();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].ends_with("/part1/EFI ::EFI"), "{}", commands[0]);
        assert!(commands[1].ends_with("/part1/config.txt ::config.txt"));
        assert!(commands[0].starts_with("mcopy -s -p -i "));
    }
}
