#![forbid(unsafe_code)]

use crate::plan::ConfigArtifact;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("config artifact `{target}` could not be written: {reason}")]
pub struct ConfigWriteError {
    pub target: String,
    pub reason: String,
}

impl ConfigWriteError {
    fn new(target: &str, reason: impl ToString) -> Self {
        Self {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeOutcome {
    /// Target was absent and has been created from the template.
    Written,
    /// Target existed without any key under the prefix; the block was appended.
    Merged,
    /// Target already carries a key under the prefix; left untouched.
    Skipped,
}

impl MaterializeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            MaterializeOutcome::Written => "written",
            MaterializeOutcome::Merged => "merged",
            MaterializeOutcome::Skipped => "skipped",
        }
    }
}

/// Writes environment artifacts without ever duplicating a key. The guard is
/// a line-oriented prefix search: any existing `KEY=` line whose key starts
/// with the artifact's prefix means the artifact was already materialized.
pub struct ConfigMaterializer {
    root: PathBuf,
}

impl ConfigMaterializer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn materialize(
        &self,
        artifact: &ConfigArtifact,
    ) -> Result<MaterializeOutcome, ConfigWriteError> {
        let path = self.root.join(&artifact.target);

        if !path.exists() {
            write_new(&path, artifact)?;
            tracing::info!(target = %artifact.target, "config artifact written");
            return Ok(MaterializeOutcome::Written);
        }

        let contents = std::fs::read_to_string(&path)
            .map_err(|err| ConfigWriteError::new(&artifact.target, err))?;

        if has_key_under_prefix(&contents, &artifact.key_prefix) {
            tracing::debug!(
                target = %artifact.target,
                prefix = %artifact.key_prefix,
                "config artifact already materialized, skipping"
            );
            return Ok(MaterializeOutcome::Skipped);
        }

        append_block(&path, &contents, artifact)?;
        tracing::info!(target = %artifact.target, "config artifact merged");
        Ok(MaterializeOutcome::Merged)
    }
}

fn has_key_under_prefix(contents: &str, prefix: &str) -> bool {
    contents.lines().any(|line| {
        let trimmed = line.trim_start();
        match trimmed.split_once('=') {
            Some((key, _)) => key.trim_end().starts_with(prefix),
            None => false,
        }
    })
}

fn write_new(path: &Path, artifact: &ConfigArtifact) -> Result<(), ConfigWriteError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| ConfigWriteError::new(&artifact.target, err))?;
    }

    let mut block = artifact.template.join("\n");
    block.push('\n');
    std::fs::write(path, block).map_err(|err| ConfigWriteError::new(&artifact.target, err))
}

fn append_block(
    path: &Path,
    existing: &str,
    artifact: &ConfigArtifact,
) -> Result<(), ConfigWriteError> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|err| ConfigWriteError::new(&artifact.target, err))?;

    let mut block = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        block.push('\n');
    }
    block.push_str(&artifact.template.join("\n"));
    block.push('\n');

    file.write_all(block.as_bytes())
        .map_err(|err| ConfigWriteError::new(&artifact.target, err))
}
