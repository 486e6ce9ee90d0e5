//! Environment configuration for recimg.
//!
//! Reads process environment variables. `main` loads a `.env` file with
//! dotenvy first, so values from `.env` appear here unless already exported.

use std::path::PathBuf;

/// Mirror the unpacked gadget/image tree to this path after loading.
pub const PRESERVE_UNPACK_VAR: &str = "RECIMG_PRESERVE_UNPACK";

/// Root of per-series filesystem tool configuration (`<root>/<series>/mke2fs.conf`).
pub const MKFS_CONFIG_DIR_VAR: &str = "RECIMG_MKFS_CONFIG_DIR";

/// Default location of the per-series mkfs configuration tree.
pub const DEFAULT_MKFS_CONFIG_DIR: &str = "/usr/share/recimg/mkfs";

/// recimg configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Where to mirror the unpack directory for debugging, if anywhere.
    pub preserve_unpack: Option<PathBuf>,
    /// Root of the per-series `mke2fs.conf` tree.
    pub mkfs_config_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preserve_unpack: None,
            mkfs_config_dir: PathBuf::from(DEFAULT_MKFS_CONFIG_DIR),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let preserve_unpack = lookup(PRESERVE_UNPACK_VAR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let mkfs_config_dir = lookup(MKFS_CONFIG_DIR_VAR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MKFS_CONFIG_DIR));

        Self {
            preserve_unpack,
            mkfs_config_dir,
        }
    }

    /// Series-specific `mke2fs.conf`, if one is shipped for `series`.
    pub fn mke2fs_config(&self, series: Option<&str>) -> Option<PathBuf> {
        let path = self.mkfs_config_dir.join(series?).join("mke2fs.conf");
        path.is_file().then_some(path)
    }

    /// Log configuration for debugging.
    pub fn log(&self) {
        tracing::debug!(
            "{}: {}",
            PRESERVE_UNPACK_VAR,
            self.preserve_unpack
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(unset)".to_string())
        );
        tracing::debug!(
            "{}: {}",
            MKFS_CONFIG_DIR_VAR,
            self.mkfs_config_dir.display()
        );
    }
}
