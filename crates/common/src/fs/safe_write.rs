use anyhow::{bail, Context, Result};
use path_clean::PathClean;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write a sibling temp file, fsync it, then rename over the target.
    Atomic,
    /// Plain overwrite; used for write-once or best-effort copies.
    Direct,
}

/// Writes files under one root directory with an optional size cap.
///
/// Paths are expected to be absolute (already resolved against the root);
/// anything that cleans to a location outside it is refused.
#[derive(Debug, Clone)]
pub struct SafeFileWriter {
    root: PathBuf,
    max_file_size: Option<usize>,
}

impl SafeFileWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_file_size: None,
        }
    }

    pub fn with_max_size(mut self, max_size: Option<usize>) -> Self {
        self.max_file_size = max_size;
        self
    }

    pub fn max_file_size(&self) -> Option<usize> {
        self.max_file_size
    }

    fn validate_path(&self, path: &Path) -> Result<()> {
        if path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            bail!(
                "path '{}' contains parent directory traversal",
                path.display()
            );
        }

        if !path.is_absolute() {
            bail!("path '{}' must be resolved before writing", path.display());
        }

        if !path.clean().starts_with(&self.root) {
            bail!("path '{}' is outside {}", path.display(), self.root.display());
        }

        Ok(())
    }

    fn validate_content(&self, content: &[u8]) -> Result<()> {
        if let Some(max_size) = self.max_file_size {
            if content.len() > max_size {
                bail!(
                    "content size {} exceeds maximum {} bytes",
                    content.len(),
                    max_size
                );
            }
        }
        Ok(())
    }

    pub fn write(&self, path: &Path, content: &[u8], mode: WriteMode) -> Result<()> {
        self.validate_path(path)?;
        self.validate_content(content)?;

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "failed to create parent directories for '{}'",
                        parent.display()
                    )
                })?;
            }
        }

        match mode {
            WriteMode::Direct => {
                fs::write(path, content)
                    .with_context(|| format!("failed to overwrite file '{}'", path.display()))?;
            }
            WriteMode::Atomic => {
                let temp_path = temp_sibling(path);
                let mut temp_file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&temp_path)
                    .with_context(|| {
                        format!("failed to create temp file '{}'", temp_path.display())
                    })?;

                temp_file.write_all(content).with_context(|| {
                    format!("failed to write temp file '{}'", temp_path.display())
                })?;
                temp_file
                    .sync_all()
                    .with_context(|| format!("failed to sync '{}'", temp_path.display()))?;
                drop(temp_file);

                if let Err(err) = fs::rename(&temp_path, path) {
                    let _ = fs::remove_file(&temp_path);
                    return Err(err).with_context(|| {
                        format!("failed to rename temp file over '{}'", path.display())
                    });
                }
            }
        }

        Ok(())
    }

    /// Removes a file. Returns `false` when it did not exist.
    pub fn remove(&self, path: &Path) -> Result<bool> {
        self.validate_path(path)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove file '{}'", path.display()))
            }
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!("{name}.tmp"))
}
