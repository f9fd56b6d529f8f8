//! Restoring files from a changeset's snapshot, in either direction.

use serde::Serialize;
use tracing::{debug, warn};

use crate::apply::render_text_diff;
use crate::errors::VibeResult;
use crate::minimal_diff;
use crate::snapshot::{Side, SnapshotStore};
use crate::warning::{Warning, WarningKind};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreAction {
    Restored,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoredFile {
    pub path: String,
    pub action: RestoreAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub restored: Vec<RestoredFile>,
    pub diff: String,
    pub warnings: Vec<Warning>,
}

pub struct RevertService<'a> {
    workspace: &'a Workspace,
    store: &'a SnapshotStore,
}

impl<'a> RevertService<'a> {
    pub fn new(workspace: &'a Workspace, store: &'a SnapshotStore) -> Self {
        Self { workspace, store }
    }

    /// Paths of the changeset, narrowed to `filter` when one is given.
    fn selected_paths(
        &self,
        id: &str,
        filter: Option<&[String]>,
        warnings: &mut Vec<Warning>,
    ) -> VibeResult<Vec<String>> {
        let all = self.store.list(id)?;
        let Some(filter) = filter.filter(|f| !f.is_empty()) else {
            return Ok(all);
        };

        let mut selected = Vec::new();
        for raw in filter {
            match self.workspace.normalize_relative(raw) {
                Ok(rel) if all.contains(&rel) => {
                    if !selected.contains(&rel) {
                        selected.push(rel);
                    }
                }
                Ok(rel) => warnings.push(Warning::new(
                    rel,
                    WarningKind::InvalidPath,
                    format!("not part of changeset {id}"),
                )),
                Err(err) => {
                    warnings.push(Warning::new(raw, WarningKind::InvalidPath, err.to_string()))
                }
            }
        }
        Ok(selected)
    }

    /// Dry run: reports files whose current content no longer matches the
    /// side opposite to `target`.
    pub fn check(&self, id: &str, target: Side, filter: Option<&[String]>) -> VibeResult<Vec<Warning>> {
        let mut warnings = Vec::new();
        for path in self.selected_paths(id, filter, &mut warnings)? {
            if let Some(warning) = self.divergence(id, target, &path)? {
                warnings.push(warning);
            }
        }
        Ok(warnings)
    }

    fn divergence(&self, id: &str, target: Side, path: &str) -> VibeResult<Option<Warning>> {
        let expected = self.store.read_side(id, target.opposite(), path)?;
        let current = self.workspace.read_bytes(path)?;
        if current == expected {
            return Ok(None);
        }
        let note = match (&expected, &current) {
            (None, Some(_)) => format!(
                "file exists but was absent in the {} snapshot",
                target.opposite().as_str()
            ),
            (Some(_), None) => format!(
                "file is missing but exists in the {} snapshot",
                target.opposite().as_str()
            ),
            _ => format!(
                "current content differs from the {} snapshot",
                target.opposite().as_str()
            ),
        };
        Ok(Some(Warning::new(path, WarningKind::Diverged, note)))
    }

    /// Rewrites the selected files to their `target` side. Divergence is
    /// reported but does not stop the restore.
    pub fn restore(&self, id: &str, target: Side, filter: Option<&[String]>) -> VibeResult<RestoreOutcome> {
        let mut outcome = RestoreOutcome::default();
        let paths = self.selected_paths(id, filter, &mut outcome.warnings)?;

        for path in paths {
            if let Some(warning) = self.divergence(id, target, &path)? {
                outcome.warnings.push(warning);
            }
            let desired = self.store.read_side(id, target, &path)?;
            let current = self.workspace.read_bytes(&path)?;

            let result = match &desired {
                Some(content) if current.as_deref() == Some(content.as_slice()) => {
                    Ok(RestoreAction::Restored)
                }
                Some(content) => self
                    .workspace
                    .write(&path, content)
                    .map(|_| RestoreAction::Restored),
                None => self.workspace.remove(&path).map(|_| RestoreAction::Deleted),
            };

            match result {
                Ok(action) => {
                    let diff = if is_text(current.as_deref()) && is_text(desired.as_deref()) {
                        render_text_diff(&path, current.as_deref(), desired.as_deref())
                    } else {
                        minimal_diff::render_binary(&path)
                    };
                    outcome.diff.push_str(&diff);
                    outcome.diff.push('\n');
                    outcome.restored.push(RestoredFile { path, action });
                }
                Err(err) => {
                    warn!(changeset = id, path = %path, "restore failed: {err}");
                    outcome
                        .warnings
                        .push(Warning::new(path, WarningKind::WriteFailed, err.to_string()));
                }
            }
        }

        debug!(
            changeset = id,
            target = target.as_str(),
            restored = outcome.restored.len(),
            "restored snapshot"
        );
        Ok(outcome)
    }
}

fn is_text(content: Option<&[u8]>) -> bool {
    content.map_or(true, |bytes| std::str::from_utf8(bytes).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::FileChange;
    use crate::config::VibeConfig;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Workspace, SnapshotStore) {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path(), &VibeConfig::default()).unwrap();
        let store = SnapshotStore::open(&ws.state_dir()).unwrap();
        (dir, ws, store)
    }

    fn capture(store: &SnapshotStore, id: &str, path: &str, before: Option<&str>, after: Option<&str>) {
        let change = FileChange::new(
            path,
            before.map(|s| s.as_bytes().to_vec()),
            after.map(|s| s.as_bytes().to_vec()),
            String::new(),
        );
        store.capture(id, &[change]).unwrap();
    }

    #[test]
    fn restore_before_deletes_added_files_and_prunes_dirs() {
        let (dir, ws, store) = setup();
        ws.write("pkg/new/file.txt", b"fresh").unwrap();
        capture(&store, "1_add", "pkg/new/file.txt", None, Some("fresh"));

        let service = RevertService::new(&ws, &store);
        assert!(service.check("1_add", Side::Before, None).unwrap().is_empty());

        let outcome = service.restore("1_add", Side::Before, None).unwrap();
        assert_eq!(outcome.restored[0].action, RestoreAction::Deleted);
        assert!(!dir.path().join("pkg").exists());
        assert!(outcome.diff.starts_with("--- a/pkg/new/file.txt\n+++ /dev/null"));
    }

    #[test]
    fn divergence_is_reported_but_restore_proceeds() {
        let (dir, ws, store) = setup();
        ws.write("a.txt", b"edited by hand").unwrap();
        capture(&store, "2_mod", "a.txt", Some("v1"), Some("v2"));

        let service = RevertService::new(&ws, &store);
        let warnings = service.check("2_mod", Side::Before, None).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::Diverged);

        let outcome = service.restore("2_mod", Side::Before, None).unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "v1");
    }

    #[test]
    fn path_filter_limits_the_restore() {
        let (dir, ws, store) = setup();
        ws.write("a.txt", b"a2").unwrap();
        ws.write("b.txt", b"b2").unwrap();
        let changes = vec![
            FileChange::new("a.txt", Some(b"a1".to_vec()), Some(b"a2".to_vec()), String::new()),
            FileChange::new("b.txt", Some(b"b1".to_vec()), Some(b"b2".to_vec()), String::new()),
        ];
        store.capture("3_two", &changes).unwrap();

        let service = RevertService::new(&ws, &store);
        let filter = vec!["b.txt".to_string(), "zzz.txt".to_string()];
        let outcome = service.restore("3_two", Side::Before, Some(filter.as_slice())).unwrap();
        assert_eq!(outcome.restored.len(), 1);
        assert_eq!(outcome.warnings[0].kind, WarningKind::InvalidPath);
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "a2");
        assert_eq!(fs::read_to_string(dir.path().join("b.txt")).unwrap(), "b1");
    }
}
