//! Resume metadata persisted in the working directory.
//!
//! The metadata is bound to the exact step list that wrote it: a SHA-256 of
//! the variant name and step names is stored alongside the state and checked
//! on load, so a workdir from a different variant (or an older step list) is
//! refused instead of being resumed at the wrong step.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use super::BuildState;
use crate::error::ResumeError;
use crate::sysops::SystemOps;

pub const METADATA_FILE: &str = "recimg.json";

pub fn metadata_path(workdir: &Path) -> PathBuf {
    workdir.join(METADATA_FILE)
}

/// Digest identifying a variant's step list.
pub fn step_digest(variant: &str, steps: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(variant.as_bytes());
    for step in steps {
        hasher.update(b"\n");
        hasher.update(step.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeMetadata {
    pub variant: String,
    pub steps: Vec<String>,
    pub digest: String,
    /// Index of the first step that has not completed.
    pub next_step: usize,
    pub state: BuildState,
}

impl ResumeMetadata {
    pub fn new(variant: &str, steps: &[&str], next_step: usize, state: BuildState) -> Self {
        Self {
            variant: variant.to_string(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
            digest: step_digest(variant, steps),
            next_step,
            state,
        }
    }

    /// Load the metadata a previous run of `variant` left in `workdir`.
    pub fn load(workdir: &Path, variant: &str, steps: &[&str]) -> Result<Self, ResumeError> {
        let path = metadata_path(workdir);
        if !path.is_file() {
            return Err(ResumeError::NoPriorRun(path));
        }

        let raw = fs::read_to_string(&path).map_err(|source| ResumeError::Read {
            path: path.clone(),
            source,
        })?;
        let metadata: Self = serde_json::from_str(&raw).map_err(|source| ResumeError::Corrupt {
            path: path.clone(),
            source,
        })?;

        let expected = step_digest(variant, steps);
        if metadata.digest != expected || metadata.next_step > steps.len() {
            return Err(ResumeError::Incompatible {
                path,
                expected: format!("{} {}", variant, short(&expected)),
                found: format!("{} {}", metadata.variant, short(&metadata.digest)),
            });
        }
        Ok(metadata)
    }

    /// Write to `<workdir>/recimg.json`, replacing any previous copy whole.
    pub fn save(&self, ops: &dyn SystemOps, workdir: &Path) -> Result<()> {
        let path = metadata_path(workdir);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize resume metadata")?;

        ops.write_file(&tmp, &json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        ops.rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

fn short(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}
