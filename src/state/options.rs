//! Flags shared by every image variant.

use clap::Args;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::gadget::layout::ImageSizeRequest;
use crate::logging::LogLevel;

pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Sector sizes the partition table writers support.
pub const SECTOR_SIZES: &[u64] = &[512, 4096];

#[derive(Args, Debug, Clone)]
pub struct CommonOptions {
    /// Stop before running this step
    #[arg(long, global = true, value_name = "STEP")]
    pub until: Option<String>,

    /// Stop after running this step
    #[arg(long, global = true, value_name = "STEP")]
    pub thru: Option<String>,

    /// Continue a previous run from its working directory
    #[arg(long, global = true)]
    pub resume: bool,

    /// Working directory (kept after the build; required for --until, --thru and --resume)
    #[arg(short = 'w', long, global = true, value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Where to write disk images
    #[arg(short = 'O', long, global = true, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Minimum image size: SIZE for every volume, or VOL:SIZE[,VOL:SIZE...]
    #[arg(long, global = true, value_name = "SIZE")]
    pub image_size: Option<ImageSizeRequest>,

    /// File copied to .disk/info in the rootfs
    #[arg(long, global = true, value_name = "PATH")]
    pub disk_info: Option<PathBuf>,

    #[arg(long, global = true)]
    pub debug: bool,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Sector size of the disk images (512 or 4096)
    #[arg(long, global = true, default_value_t = DEFAULT_SECTOR_SIZE, value_name = "BYTES")]
    pub sector_size: u64,

    /// Print the steps that would run and exit
    #[arg(long, global = true)]
    pub dry_run: bool,
}

impl Default for CommonOptions {
    fn default() -> Self {
        Self {
            until: None,
            thru: None,
            resume: false,
            workdir: None,
            output_dir: None,
            image_size: None,
            disk_info: None,
            debug: false,
            verbose: false,
            quiet: false,
            sector_size: DEFAULT_SECTOR_SIZE,
            dry_run: false,
        }
    }
}

impl CommonOptions {
    pub fn log_level(&self) -> Result<LogLevel, ConfigError> {
        match (self.debug, self.verbose, self.quiet) {
            (false, false, false) => Ok(LogLevel::Normal),
            (true, false, false) => Ok(LogLevel::Debug),
            (false, true, false) => Ok(LogLevel::Verbose),
            (false, false, true) => Ok(LogLevel::Quiet),
            _ => Err(ConfigError::MultipleLogLevels),
        }
    }

    /// Reject flag combinations that cannot work with `steps`.
    pub fn validate(&self, steps: &[&str]) -> Result<(), ConfigError> {
        if self.until.is_some() && self.thru.is_some() {
            return Err(ConfigError::ConflictingFlags("until", "thru"));
        }
        self.log_level()?;

        for name in self.until.iter().chain(self.thru.iter()) {
            if !steps.contains(&name.as_str()) {
                return Err(ConfigError::UnknownStep(name.clone()));
            }
        }

        if self.workdir.is_none() {
            if self.resume {
                return Err(ConfigError::WorkdirRequired("resume"));
            }
            if self.until.is_some() {
                return Err(ConfigError::WorkdirRequired("until"));
            }
            if self.thru.is_some() {
                return Err(ConfigError::WorkdirRequired("thru"));
            }
        }

        if !SECTOR_SIZES.contains(&self.sector_size) {
            return Err(ConfigError::InvalidSectorSize(self.sector_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEPS: &[&str] = &["make_temporary_directories", "load_gadget", "make_disk"];

    fn with_workdir() -> CommonOptions {
        CommonOptions {
            workdir: Some(PathBuf::from("/tmp/recimg-work")),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(CommonOptions::default().validate(STEPS).is_ok());
        assert_eq!(CommonOptions::default().log_level(), Ok(LogLevel::Normal));
    }

    #[test]
    fn test_until_and_thru_conflict() {
        let options = CommonOptions {
            until: Some("load_gadget".into()),
            thru: Some("make_disk".into()),
            ..with_workdir()
        };
        assert_eq!(
            options.validate(STEPS),
            Err(ConfigError::ConflictingFlags("until", "thru"))
        );
    }

    #[test]
    fn test_multiple_log_levels() {
        let options = CommonOptions {
            debug: true,
            quiet: true,
            ..Default::default()
        };
        assert_eq!(options.validate(STEPS), Err(ConfigError::MultipleLogLevels));
    }

    #[test]
    fn test_unknown_step_is_rejected() {
        let options = CommonOptions {
            thru: Some("load_gadgets".into()),
            ..with_workdir()
        };
        assert_eq!(
            options.validate(STEPS),
            Err(ConfigError::UnknownStep("load_gadgets".into()))
        );
    }

    #[test]
    fn test_partial_runs_need_workdir() {
        let options = CommonOptions {
            resume: true,
            ..Default::default()
        };
        assert_eq!(
            options.validate(STEPS),
            Err(ConfigError::WorkdirRequired("resume"))
        );

        let options = CommonOptions {
            until: Some("make_disk".into()),
            ..Default::default()
        };
        assert_eq!(
            options.validate(STEPS),
            Err(ConfigError::WorkdirRequired("until"))
        );
    }

    #[test]
    fn test_sector_size() {
        let options = CommonOptions {
            sector_size: 4096,
            ..Default::default()
        };
        assert!(options.validate(STEPS).is_ok());

        let options = CommonOptions {
            sector_size: 1024,
            ..Default::default()
        };
        assert_eq!(
            options.validate(STEPS),
            Err(ConfigError::InvalidSectorSize(1024))
        );
    }
}
