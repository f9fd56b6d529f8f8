//! Direct write path: explicit file operations instead of a diff.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::apply::render_text_diff;
use crate::changeset::FileChange;
use crate::errors::{VibeError, VibeResult};
use crate::minimal_diff;
use crate::workspace::Workspace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOp {
    Add {
        path: String,
        #[serde(default)]
        content: String,
    },
    Write {
        path: String,
        #[serde(default)]
        content: String,
    },
    Delete {
        path: String,
    },
    AddBinary {
        path: String,
        #[serde(alias = "contentBase64")]
        base64: String,
    },
}

impl FileOp {
    pub fn path(&self) -> &str {
        match self {
            FileOp::Add { path, .. }
            | FileOp::Write { path, .. }
            | FileOp::Delete { path }
            | FileOp::AddBinary { path, .. } => path,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileOp::Add { .. } => "add",
            FileOp::Write { .. } => "write",
            FileOp::Delete { .. } => "delete",
            FileOp::AddBinary { .. } => "add_binary",
        }
    }
}

/// A rejected op. Sibling ops in the same batch still run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpError {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub error: String,
}

/// Parses raw op records, keeping the first `max_ops`. Records past the cap
/// and records that do not parse are reported as errors.
pub fn parse_ops(raw: &[Value], max_ops: usize) -> (Vec<(usize, FileOp)>, Vec<OpError>) {
    let mut ops = Vec::new();
    let mut errors = Vec::new();

    for (index, value) in raw.iter().enumerate() {
        let path = value.get("path").and_then(Value::as_str).map(str::to_string);
        let name = value.get("op").and_then(Value::as_str).map(str::to_string);
        if index >= max_ops {
            errors.push(OpError {
                index,
                op: name,
                path,
                error: "ignored: exceeds op limit".to_string(),
            });
            continue;
        }
        match serde_json::from_value::<FileOp>(normalize_op(value)) {
            Ok(op) if !op.path().trim().is_empty() => ops.push((index, op)),
            Ok(_) => errors.push(OpError {
                index,
                op: name,
                path,
                error: "invalid op: path is required".to_string(),
            }),
            Err(err) => errors.push(OpError {
                index,
                op: name,
                path,
                error: format!("invalid op: {err}"),
            }),
        }
    }

    (ops, errors)
}

/// An op carrying base64 content is a binary add regardless of its name.
fn normalize_op(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(object) = value.as_object_mut() {
        let has_base64 = object.contains_key("base64") || object.contains_key("contentBase64");
        let is_delete = object.get("op").and_then(Value::as_str) == Some("delete");
        if has_base64 && !is_delete {
            object.insert("op".to_string(), Value::from("add_binary"));
            object.remove("content");
        }
        if let Some(content) = object.get_mut("content") {
            if !content.is_string() && !content.is_null() {
                *content = Value::from(content.to_string());
            }
            if content.is_null() {
                *content = Value::from("");
            }
        }
    }
    value
}

/// Executes one op against the workspace and describes what changed.
pub fn execute_op(workspace: &Workspace, op: &FileOp) -> VibeResult<FileChange> {
    let rel = workspace.normalize_relative(op.path())?;
    workspace.check_writable(&rel)?;
    let before = workspace.read_bytes(&rel)?;

    match op {
        FileOp::Delete { .. } => {
            if before.is_some() {
                workspace.remove(&rel)?;
            }
            let diff = render_text_diff(&rel, before.as_deref(), None);
            Ok(FileChange::new(rel, before, None, diff))
        }
        FileOp::Add { content, .. } | FileOp::Write { content, .. } => {
            if content.contains('\0') {
                return Err(VibeError::validation("content", "binary content not supported"));
            }
            workspace.write(&rel, content.as_bytes())?;
            let after = content.as_bytes().to_vec();
            let diff = render_text_diff(&rel, before.as_deref(), Some(&after));
            Ok(FileChange::new(rel, before, Some(after), diff))
        }
        FileOp::AddBinary { base64, .. } => {
            let bytes = BASE64
                .decode(base64.trim())
                .map_err(|err| VibeError::validation("base64", format!("invalid base64: {err}")))?;
            workspace.write(&rel, &bytes)?;
            let diff = minimal_diff::render_binary(&rel);
            Ok(FileChange::new(rel, before, Some(bytes), diff))
        }
    }
}

/// Folds repeated ops on one path into a single change: the first op's
/// `before` and the last op's `after`.
pub fn merge_by_path(changes: Vec<FileChange>) -> Vec<FileChange> {
    let mut merged: Vec<FileChange> = Vec::with_capacity(changes.len());
    let mut seen: HashMap<String, usize> = HashMap::new();

    for change in changes {
        let existing = seen.get(&change.path).copied();
        let Some(index) = existing else {
            seen.insert(change.path.clone(), merged.len());
            merged.push(change);
            continue;
        };
        let before = merged[index].before.take();
        let diff = if change.diff == minimal_diff::render_binary(&change.path) {
            change.diff
        } else {
            render_text_diff(&change.path, before.as_deref(), change.after.as_deref())
        };
        merged[index] = FileChange::new(change.path, before, change.after, diff);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangeType;
    use crate::config::VibeConfig;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn parses_known_ops_and_reports_the_rest() {
        let raw = vec![
            json!({"op": "add", "path": "a.txt", "content": "hi"}),
            json!({"op": "rename", "path": "b.txt"}),
            json!({"op": "write", "path": "c.txt", "contentBase64": "AAE="}),
            json!({"op": "delete", "path": ""}),
            json!({"op": "write", "path": "d.txt", "content": 12}),
        ];
        let (ops, errors) = parse_ops(&raw, 50);
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[1].1.name(), "add_binary");
        assert_eq!(
            ops[2].1,
            FileOp::Write {
                path: "d.txt".into(),
                content: "12".into()
            }
        );
        assert_eq!(errors.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn ops_past_the_cap_are_ignored() {
        let raw: Vec<Value> = (0..4)
            .map(|i| json!({"op": "add", "path": format!("f{i}.txt")}))
            .collect();
        let (ops, errors) = parse_ops(&raw, 2);
        assert_eq!(ops.len(), 2);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].error, "ignored: exceeds op limit");
    }

    #[test]
    fn executes_text_binary_and_delete_ops() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path(), &VibeConfig::default()).unwrap();

        let added = execute_op(
            &ws,
            &FileOp::Add {
                path: "src/a.txt".into(),
                content: "one\n".into(),
            },
        )
        .unwrap();
        assert_eq!(added.change_type, ChangeType::Added);
        assert_eq!(fs::read_to_string(dir.path().join("src/a.txt")).unwrap(), "one\n");

        let binary = execute_op(
            &ws,
            &FileOp::AddBinary {
                path: "img.bin".into(),
                base64: "AAEC".into(),
            },
        )
        .unwrap();
        assert_eq!(fs::read(dir.path().join("img.bin")).unwrap(), vec![0u8, 1, 2]);
        assert!(binary.diff.ends_with("(binary file)"));

        let deleted = execute_op(&ws, &FileOp::Delete { path: "src/a.txt".into() }).unwrap();
        assert_eq!(deleted.change_type, ChangeType::Deleted);
        assert_eq!(deleted.before.as_deref(), Some(&b"one\n"[..]));
    }

    #[test]
    fn rejects_nul_content_and_blocked_paths() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path(), &VibeConfig::default()).unwrap();

        let err = execute_op(
            &ws,
            &FileOp::Write {
                path: "x.txt".into(),
                content: "a\0b".into(),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("binary content not supported"));

        let err = execute_op(
            &ws,
            &FileOp::Write {
                path: "node_modules/x.js".into(),
                content: "x".into(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, VibeError::ProtectedPath { .. }));
    }

    #[test]
    fn repeated_paths_keep_first_before_and_last_after() {
        let changes = vec![
            FileChange::new("n.txt", None, Some(b"one".to_vec()), "d1".into()),
            FileChange::new("o.txt", Some(b"x".to_vec()), None, "d2".into()),
            FileChange::new("n.txt", Some(b"one".to_vec()), Some(b"two".to_vec()), "d3".into()),
        ];
        let merged = merge_by_path(changes);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].path, "n.txt");
        assert_eq!(merged[0].before, None);
        assert_eq!(merged[0].after.as_deref(), Some(&b"two"[..]));
        assert_eq!(merged[0].change_type, ChangeType::Added);
        assert!(merged[0].diff.contains("+two"));

        let round_trip = merge_by_path(vec![
            FileChange::new("t.txt", None, Some(b"tmp".to_vec()), "d".into()),
            FileChange::new("t.txt", Some(b"tmp".to_vec()), None, "d".into()),
        ]);
        assert!(round_trip[0].is_unchanged());
    }
}
