//! Turning a parsed diff into planned file changes, and writing them out.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::changeset::{ChangeType, FileChange};
use crate::errors::VibeError;
use crate::minimal_diff;
use crate::patch_parser::ParsedPatch;
use crate::patcher::{apply_hunks, ApplyOptions};
use crate::warning::{Warning, WarningKind};
use crate::workspace::Workspace;

/// Computes the post-patch content of every file in `parsed` without
/// touching the disk. Files that cannot be patched become warnings.
pub fn plan_patch(
    workspace: &Workspace,
    parsed: &ParsedPatch,
    options: &ApplyOptions,
    warnings: &mut Vec<Warning>,
) -> Vec<FileChange> {
    let mut changes: Vec<FileChange> = Vec::new();
    // Later file sections for the same path build on earlier ones.
    let mut seen: HashMap<String, usize> = HashMap::new();

    for file in &parsed.files {
        let raw = file.target_path().unwrap_or_default();
        let rel = match workspace.normalize_relative(raw) {
            Ok(rel) => rel,
            Err(err) => {
                warnings.push(Warning::new(raw, WarningKind::InvalidPath, err.to_string()));
                continue;
            }
        };
        if let Err(err) = workspace.check_writable(&rel) {
            warnings.push(Warning::new(&rel, WarningKind::PathBlocked, err.to_string()));
            continue;
        }

        let (before, base) = match seen.get(&rel) {
            Some(&index) => (changes[index].before.clone(), changes[index].after.clone()),
            None => match workspace.read_bytes(&rel) {
                Ok(bytes) => (bytes.clone(), bytes),
                Err(err) => {
                    warnings.push(Warning::new(&rel, WarningKind::InvalidPath, err.to_string()));
                    continue;
                }
            },
        };

        let original = match base.as_deref().map(std::str::from_utf8).transpose() {
            Ok(text) => text.unwrap_or_default().to_string(),
            Err(_) => {
                warnings.push(Warning::new(
                    &rel,
                    WarningKind::BinaryContent,
                    "binary content not supported",
                ));
                continue;
            }
        };

        let outcome = apply_hunks(&rel, &original, &file.hunks, options, warnings);

        let after = if base.is_none() && outcome.applied == 0 {
            None
        } else if file.is_deleted_file() && outcome.skipped == 0 && outcome.text.is_empty() {
            None
        } else {
            Some(outcome.text.into_bytes())
        };

        let diff = render_text_diff(&rel, before.as_deref(), after.as_deref());
        let change = FileChange::new(rel.clone(), before, after, diff)
            .with_hunk_counts(outcome.applied, outcome.skipped);

        match seen.get(&rel) {
            Some(&index) => {
                let (applied, skipped) = (
                    changes[index].applied_hunks.unwrap_or(0) + outcome.applied,
                    changes[index].skipped_hunks.unwrap_or(0) + outcome.skipped,
                );
                changes[index] = change.with_hunk_counts(applied, skipped);
            }
            None => {
                seen.insert(rel, changes.len());
                changes.push(change);
            }
        }
    }

    changes
}

pub fn render_text_diff(path: &str, before: Option<&[u8]>, after: Option<&[u8]>) -> String {
    let before = before.map(String::from_utf8_lossy);
    let after = after.map(String::from_utf8_lossy);
    minimal_diff::render(path, before.as_deref(), after.as_deref())
}

/// Writes or removes each changed file. A failed write becomes a
/// `write_failed` warning and the change is dropped from the result.
pub fn commit_changes(
    workspace: &Workspace,
    changes: Vec<FileChange>,
    warnings: &mut Vec<Warning>,
) -> Vec<FileChange> {
    let mut committed = Vec::with_capacity(changes.len());
    for change in changes {
        let outcome = match (&change.change_type, &change.after) {
            (ChangeType::Unchanged, _) => Ok(()),
            (_, Some(content)) => workspace.write(&change.path, content),
            (_, None) => workspace.remove(&change.path).map(|_| ()),
        };
        match outcome {
            Ok(()) => committed.push(change),
            Err(err) => {
                warn!(path = %change.path, "write failed: {err}");
                warnings.push(Warning::new(
                    &change.path,
                    WarningKind::WriteFailed,
                    write_failure_note(&err),
                ));
            }
        }
    }
    debug!(files = committed.len(), "committed changes");
    committed
}

fn write_failure_note(err: &VibeError) -> String {
    match err {
        VibeError::ResourceLimit { current_usage, limit, .. } => {
            format!("content too large ({current_usage} > {limit})")
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VibeConfig;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Workspace) {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path(), &VibeConfig::default()).unwrap();
        (dir, ws)
    }

    #[test]
    fn blocked_and_invalid_paths_become_warnings() {
        let (_dir, ws) = setup();
        let diff = "\
--- a/.git/config
+++ b/.git/config
@@ -1 +1 @@
-a
+b
--- a/../outside.txt
+++ b/../outside.txt
@@ -0,0 +1 @@
+x
";
        let mut warnings = Vec::new();
        let changes = plan_patch(&ws, &ParsedPatch::from_diff(diff), &ApplyOptions::default(), &mut warnings);
        assert!(changes.is_empty());
        let kinds: Vec<_> = warnings.iter().map(|w| w.kind).collect();
        assert_eq!(kinds, vec![WarningKind::PathBlocked, WarningKind::InvalidPath]);
    }

    #[test]
    fn deletion_via_dev_null_removes_file() {
        let (dir, ws) = setup();
        fs::write(dir.path().join("gone.txt"), "bye\n").unwrap();
        let diff = "--- a/gone.txt\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-bye\n";

        let mut warnings = Vec::new();
        let changes = plan_patch(&ws, &ParsedPatch::from_diff(diff), &ApplyOptions::default(), &mut warnings);
        assert_eq!(changes[0].change_type, ChangeType::Deleted);

        let committed = commit_changes(&ws, changes, &mut warnings);
        assert_eq!(committed.len(), 1);
        assert!(!dir.path().join("gone.txt").exists());
        assert!(warnings.is_empty());
    }

    #[test]
    fn missing_file_with_no_applied_hunks_is_not_created() {
        let (dir, ws) = setup();
        let diff = "--- a/nope.txt\n+++ b/nope.txt\n@@ -1,1 +1,1 @@\n-old\n+new\n";
        let mut warnings = Vec::new();
        let changes = plan_patch(&ws, &ParsedPatch::from_diff(diff), &ApplyOptions::default(), &mut warnings);
        assert_eq!(changes[0].change_type, ChangeType::Unchanged);
        commit_changes(&ws, changes, &mut warnings);
        assert!(!dir.path().join("nope.txt").exists());
    }

    #[test]
    fn oversized_result_is_reported_not_written() {
        let dir = tempdir().unwrap();
        let mut config = VibeConfig::default();
        config.limits.max_write_bytes = 4;
        let ws = Workspace::new(dir.path(), &config).unwrap();

        let diff = "--- /dev/null\n+++ b/big.txt\n@@ -0,0 +1,1 @@\n+0123456789\n";
        let mut warnings = Vec::new();
        let changes = plan_patch(&ws, &ParsedPatch::from_diff(diff), &ApplyOptions::default(), &mut warnings);
        let committed = commit_changes(&ws, changes, &mut warnings);
        assert!(committed.is_empty());
        assert_eq!(warnings[0].kind, WarningKind::WriteFailed);
        assert!(!dir.path().join("big.txt").exists());
    }
}
