//! Before/after snapshot store.
//!
//! Layout: `<state>/snapshots/<id>/{before,after}/<relative path>`. A
//! snapshot is written once at apply time and only read afterwards; `prune`
//! is the only deletion path.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::changeset::FileChange;
use crate::errors::{VibeError, VibeResult};
use crate::warning::{Warning, WarningKind};

const MAX_ID_LEN: usize = 128;

/// Which side of a changeset to read or restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Before,
    After,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Before => "before",
            Side::After => "after",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Before => Side::After,
            Side::After => Side::Before,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub id: String,
    /// Directory modification time, unix millis.
    pub mtime: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub kept: usize,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    base: PathBuf,
}

impl SnapshotStore {
    /// Opens (and creates) `<state_dir>/snapshots`.
    pub fn open(state_dir: &Path) -> VibeResult<Self> {
        let base = state_dir.join("snapshots");
        fs::create_dir_all(&base)
            .map_err(|err| VibeError::io(Some(base.clone()), "create snapshot store", err))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `<unix millis>_<12 hex chars>`.
    pub fn generate_id() -> String {
        let fragment = Uuid::new_v4().simple().to_string();
        format!("{}_{}", Utc::now().timestamp_millis(), &fragment[..12])
    }

    pub fn validate_id(id: &str) -> VibeResult<()> {
        let valid = !id.is_empty()
            && id.len() <= MAX_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(())
        } else {
            Err(VibeError::validation("changesetId", "invalid changeset id"))
        }
    }

    fn dir(&self, id: &str) -> VibeResult<PathBuf> {
        Self::validate_id(id)?;
        Ok(self.base.join(id))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.dir(id).map(|dir| dir.is_dir()).unwrap_or(false)
    }

    /// Writes each change's defined sides. A failing file yields a warning
    /// and does not stop the others.
    pub fn capture(&self, id: &str, changes: &[FileChange]) -> VibeResult<Vec<Warning>> {
        let dir = self.dir(id)?;
        let mut warnings = Vec::new();

        for change in changes {
            for (side, content) in [
                (Side::Before, change.before.as_deref()),
                (Side::After, change.after.as_deref()),
            ] {
                let Some(content) = content else { continue };
                let target = dir.join(side.as_str()).join(&change.path);
                if let Err(err) = write_file(&target, content) {
                    warn!(
                        changeset = id,
                        path = %change.path,
                        side = side.as_str(),
                        "snapshot write failed: {err}"
                    );
                    warnings.push(Warning::new(
                        change.path.clone(),
                        WarningKind::SnapshotFailed,
                        format!("{} snapshot not written: {err}", side.as_str()),
                    ));
                }
            }
        }

        // Keep the id listable even when every change was a no-op.
        fs::create_dir_all(&dir)
            .map_err(|err| VibeError::io(Some(dir.clone()), "create snapshot dir", err))?;
        debug!(changeset = id, files = changes.len(), "captured snapshot");
        Ok(warnings)
    }

    /// Relative paths present on either side, sorted.
    pub fn list(&self, id: &str) -> VibeResult<Vec<String>> {
        let dir = self.dir(id)?;
        if !dir.is_dir() {
            return Err(VibeError::not_found("snapshot", id));
        }

        let mut paths = BTreeSet::new();
        for side in [Side::Before, Side::After] {
            let side_dir = dir.join(side.as_str());
            if !side_dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&side_dir).min_depth(1).into_iter().filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&side_dir) {
                    let rel = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    paths.insert(rel);
                }
            }
        }
        Ok(paths.into_iter().collect())
    }

    /// Content of `path` on `side`; `None` when that side was absent.
    pub fn read_side(&self, id: &str, side: Side, path: &str) -> VibeResult<Option<Vec<u8>>> {
        let target = self.dir(id)?.join(side.as_str()).join(path);
        match fs::read(&target) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(VibeError::io(Some(target), "read snapshot", err)),
        }
    }

    /// All snapshots, newest first.
    pub fn list_all(&self) -> VibeResult<Vec<SnapshotInfo>> {
        let entries = fs::read_dir(&self.base)
            .map_err(|err| VibeError::io(Some(self.base.clone()), "list snapshots", err))?;

        let mut infos: Vec<SnapshotInfo> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| {
                let id = entry.file_name().to_string_lossy().into_owned();
                let mtime = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                SnapshotInfo { id, mtime }
            })
            .collect();

        // Ids start with their creation millis, which breaks mtime ties.
        infos.sort_by(|a, b| b.mtime.cmp(&a.mtime).then_with(|| b.id.cmp(&a.id)));
        Ok(infos)
    }

    /// Keeps the `keep` most recent snapshots and deletes the rest.
    pub fn prune(&self, keep: usize) -> VibeResult<PruneReport> {
        let all = self.list_all()?;
        let mut report = PruneReport {
            kept: all.len().min(keep),
            removed: Vec::new(),
        };
        for info in all.into_iter().skip(keep) {
            let dir = self.base.join(&info.id);
            match fs::remove_dir_all(&dir) {
                Ok(()) => report.removed.push(info.id),
                Err(err) => warn!(snapshot = %info.id, "failed to prune snapshot: {err}"),
            }
        }
        info!(kept = report.kept, removed = report.removed.len(), "pruned snapshots");
        Ok(report)
    }
}

fn write_file(target: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(target, content)
}
