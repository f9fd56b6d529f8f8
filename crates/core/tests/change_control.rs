use std::fs;
use std::sync::Arc;

use serde_json::json;
use vibe_core::{
    ChangeControl, ChangeType, EventKind, MutationClass, PatchOptions, Side, TestRun, VibeConfig,
    VibeError, WarningKind,
};

mod common;
use common::{open_control, read, seeded_workspace, FakeVcs, MAIN_JS};

const LOGGING_DIFF: &str = "\
--- a/src/main.js
+++ b/src/main.js
@@ -1,4 +1,5 @@
 function main() {
   const a = 1;
+  console.log(a);
   return a;
 }
--- /dev/null
+++ b/src/util.js
@@ -0,0 +1,1 @@
+export const two = 2;
";

fn titled(title: &str) -> PatchOptions {
    PatchOptions {
        title: Some(title.to_string()),
        ..PatchOptions::default()
    }
}

#[test]
fn revert_then_reapply_restores_exact_bytes() {
    let dir = seeded_workspace();
    let cc = open_control(dir.path());

    let applied = cc.apply_patch(LOGGING_DIFF, titled("Add logging")).unwrap();
    let id = applied.changeset_id.clone().expect("changeset id");
    assert!(applied.warnings.is_empty(), "{:?}", applied.warnings);
    assert_eq!(applied.changes.len(), 2);
    assert_eq!(applied.changes[1].change_type, ChangeType::Added);
    let patched = read(dir.path(), "src/main.js");
    assert!(patched.contains("console.log(a);"));

    let reverted = cc.revert(&id, Side::Before, None).unwrap();
    assert!(!reverted.partial);
    assert!(reverted.warnings.is_empty());
    assert_eq!(read(dir.path(), "src/main.js"), MAIN_JS);
    assert!(!dir.path().join("src/util.js").exists());

    let reapplied = cc.revert(&id, Side::After, None).unwrap();
    assert_eq!(reapplied.restored.len(), 2);
    assert_eq!(read(dir.path(), "src/main.js"), patched);
    assert_eq!(read(dir.path(), "src/util.js"), "export const two = 2;\n");

    let kinds: Vec<EventKind> = cc.read_events(None).into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::PatchApplied, EventKind::Revert, EventKind::Reapply]
    );
    assert!(cc.memory_summary().starts_with("Memory: patches=1 reverts=1 tests=0"));
}

#[test]
fn diverged_files_are_reported_before_revert() {
    let dir = seeded_workspace();
    let cc = open_control(dir.path());
    let id = cc
        .apply_patch(LOGGING_DIFF, PatchOptions::default())
        .unwrap()
        .changeset_id
        .unwrap();

    fs::write(dir.path().join("src/main.js"), "hand edited\n").unwrap();
    let warnings = cc.check_revert(&id, Side::Before, None).unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].path, "src/main.js");

    let filter = vec!["src/util.js".to_string()];
    let partial = cc.revert(&id, Side::Before, Some(filter.as_slice())).unwrap();
    assert!(partial.partial);
    assert_eq!(partial.restored.len(), 1);
    assert_eq!(read(dir.path(), "src/main.js"), "hand edited\n");
}

#[test]
fn unknown_or_malformed_changeset_ids_are_rejected() {
    let dir = seeded_workspace();
    let cc = open_control(dir.path());

    let err = cc.revert("1700000000000_deadbeef0000", Side::Before, None).unwrap_err();
    assert!(matches!(err, VibeError::NotFound { .. }));

    let err = cc.revert("../../etc", Side::Before, None).unwrap_err();
    assert_eq!(err.error_code(), "E_VALIDATION");
}

#[test]
fn held_patch_permit_rejects_second_mutation() {
    let dir = seeded_workspace();
    let cc = open_control(dir.path());

    let permit = cc.coordinator().try_acquire(MutationClass::Patch).unwrap();
    let err = cc.apply_patch(LOGGING_DIFF, PatchOptions::default()).unwrap_err();
    assert_eq!(err.error_code(), "E_BUSY");
    assert!(err.is_retryable());
    assert_eq!(err.to_string(), "patch in progress, try again");

    let err = cc.apply_ops(&[json!({"op": "add", "path": "x.txt"})], None).unwrap_err();
    assert!(matches!(err, VibeError::Busy { .. }));

    // Previews never take the permit.
    let preview = cc
        .apply_patch(
            LOGGING_DIFF,
            PatchOptions {
                preview: true,
                ..PatchOptions::default()
            },
        )
        .unwrap();
    assert!(preview.changeset_id.is_none());
    assert_eq!(read(dir.path(), "src/main.js"), MAIN_JS);

    drop(permit);
    assert!(cc.apply_patch(LOGGING_DIFF, PatchOptions::default()).is_ok());
}

#[test]
fn concurrent_ops_are_admitted_or_rejected_busy() {
    let dir = seeded_workspace();
    let cc = open_control(dir.path());
    let permit = cc.coordinator().try_acquire(MutationClass::Revert).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let cc = Arc::clone(&cc);
            std::thread::spawn(move || {
                cc.apply_ops(
                    &[json!({"op": "write", "path": format!("t{i}.txt"), "content": "x"})],
                    None,
                )
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(VibeError::Busy { .. })))
        .count();
    assert_eq!(ok + busy, 4);
    assert!(ok >= 1);

    // The revert class is independent of the patch class.
    assert!(cc.coordinator().is_busy(MutationClass::Revert));
    drop(permit);
    assert!(!cc.coordinator().is_busy(MutationClass::Revert));
}

#[test]
fn ops_batch_reports_per_op_failures() {
    let dir = seeded_workspace();
    let cc = open_control(dir.path());

    let result = cc
        .apply_ops(
            &[
                json!({"op": "add", "path": "docs/a.md", "content": "# A\n"}),
                json!({"op": "write", "path": ".git/config", "content": "x"}),
                json!({"op": "delete", "path": "README.md"}),
            ],
            Some("Docs"),
        )
        .unwrap();
    assert!(result.changeset_id.is_some());
    assert_eq!(result.changes.len(), 2);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].index, 1);
    assert_eq!(result.errors[0].error, "path not allowed");
    assert!(!dir.path().join("README.md").exists());

    let events = cc.read_events(Some(1));
    assert_eq!(events[0].data["title"], "Docs");
}

#[test]
fn unchanged_patch_records_nothing() {
    let dir = seeded_workspace();
    let cc = open_control(dir.path());
    let diff = "--- a/README.md\n+++ b/README.md\n@@ -1,1 +1,1 @@\n-# Nope\n+# Other\n";

    let result = cc.apply_patch(diff, PatchOptions::default()).unwrap();
    assert!(result.changeset_id.is_none());
    assert_eq!(result.changes[0].skipped_hunks, Some(1));
    assert!(cc.read_events(None).is_empty());
    assert!(cc.list_snapshots().unwrap().is_empty());
}

#[test]
fn ops_touching_one_path_twice_revert_to_the_original() {
    let dir = seeded_workspace();
    let cc = open_control(dir.path());

    let result = cc
        .apply_ops(
            &[
                json!({"op": "add", "path": "n.txt", "content": "one"}),
                json!({"op": "write", "path": "n.txt", "content": "two"}),
                json!({"op": "write", "path": "README.md", "content": "first"}),
                json!({"op": "write", "path": "README.md", "content": "second"}),
            ],
            None,
        )
        .unwrap();
    let id = result.changeset_id.clone().expect("changeset id");
    assert_eq!(result.changes.len(), 2);
    assert_eq!(result.changes[0].change_type, ChangeType::Added);
    assert_eq!(result.changes[1].change_type, ChangeType::Modified);
    assert_eq!(read(dir.path(), "n.txt"), "two");

    cc.revert(&id, Side::Before, None).unwrap();
    assert!(!dir.path().join("n.txt").exists());
    assert_eq!(read(dir.path(), "README.md"), common::README);

    cc.revert(&id, Side::After, None).unwrap();
    assert_eq!(read(dir.path(), "n.txt"), "two");
    assert_eq!(read(dir.path(), "README.md"), "second");
}

#[test]
fn snapshot_failure_still_reports_written_files() {
    let dir = seeded_workspace();
    let cc = open_control(dir.path());
    let snapshots = dir.path().join(".vibe/snapshots");
    fs::remove_dir_all(&snapshots).unwrap();
    fs::write(&snapshots, "not a directory").unwrap();

    let result = cc.apply_patch(LOGGING_DIFF, PatchOptions::default()).unwrap();
    assert!(result.changeset_id.is_none());
    assert_eq!(result.changes.len(), 2);
    assert!(read(dir.path(), "src/main.js").contains("console.log(a);"));
    assert!(result
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::SnapshotFailed && w.note.starts_with("changeset not recorded")));
    assert!(cc.read_events(None).is_empty());
}

#[test]
fn corrupt_event_log_recovers_from_backup_then_prefix() {
    let dir = seeded_workspace();
    let cc = open_control(dir.path());
    cc.append_event(EventKind::Chat, json!({"text": "one"})).unwrap();
    cc.append_event(EventKind::Answer, json!({"text": "two"})).unwrap();

    let log = dir.path().join(".vibe/events.json");
    fs::write(&log, "{{{ not json").unwrap();
    let recovered = cc.read_events(None);
    assert_eq!(recovered.len(), 2);
    assert_eq!(recovered[1].kind, EventKind::Answer);

    fs::remove_file(dir.path().join(".vibe/events.json.bak")).unwrap();
    fs::write(
        &log,
        r#"[{"ts": 1, "type": "CHAT", "data": {"text": "kept"}}, {"ts": 2, "type": "CH"#,
    )
    .unwrap();
    let salvaged = cc.read_events(None);
    assert_eq!(salvaged.len(), 1);
    assert_eq!(salvaged[0].data["text"], "kept");

    // Appending after recovery keeps the salvaged history.
    cc.append_event(EventKind::TaskDone, json!({})).unwrap();
    assert_eq!(cc.read_events(None).len(), 2);
}

#[test]
fn test_results_are_truncated() {
    let dir = seeded_workspace();
    let cc = open_control(dir.path());
    let event = cc
        .record_test_result(TestRun {
            ok: false,
            code: Some(1),
            stdout: "x".repeat(25_000),
            stderr: "boom".to_string(),
        })
        .unwrap();
    assert_eq!(event.kind, EventKind::TestResult);
    assert_eq!(event.data["stdout"].as_str().unwrap().len(), 20_000);
    assert_eq!(event.data["stderr"], "boom");
}

#[test]
fn full_revert_delegates_to_vcs_when_a_commit_exists() {
    let dir = seeded_workspace();
    let vcs = Arc::new(FakeVcs::default());
    let cc = ChangeControl::open(dir.path(), VibeConfig::default())
        .unwrap()
        .with_vcs(vcs.clone());

    let applied = cc.apply_patch(LOGGING_DIFF, titled("Add logging")).unwrap();
    let id = applied.changeset_id.unwrap();
    assert_eq!(applied.commit_hash.as_deref(), Some("abc0001"));
    {
        let commits = vcs.commits.lock().unwrap();
        assert_eq!(commits[0].1, format!("[ViBE] Add logging ({id})"));
        assert_eq!(commits[0].0, vec!["src/main.js", "src/util.js"]);
    }

    let result = cc.revert(&id, Side::Before, None).unwrap();
    assert_eq!(result.vcs.as_ref().map(|v| v.reverted.as_str()), Some("abc0001"));
    assert_eq!(result.diff, "(git revert abc0001)");
    assert_eq!(*vcs.reverted.lock().unwrap(), vec!["abc0001".to_string()]);
    let last = cc.read_events(Some(1)).remove(0);
    assert_eq!(last.kind, EventKind::GitRevert);
    assert_eq!(last.data["commitHash"], "abc0001");
}

#[test]
fn failed_vcs_revert_falls_back_to_snapshot_restore() {
    let dir = seeded_workspace();
    let vcs = Arc::new(FakeVcs {
        fail_revert: true,
        ..FakeVcs::default()
    });
    let cc = ChangeControl::open(dir.path(), VibeConfig::default())
        .unwrap()
        .with_vcs(vcs);

    let id = cc
        .apply_patch(LOGGING_DIFF, PatchOptions::default())
        .unwrap()
        .changeset_id
        .unwrap();
    let result = cc.revert(&id, Side::Before, None).unwrap();
    assert!(result.vcs.is_none());
    assert_eq!(read(dir.path(), "src/main.js"), MAIN_JS);
}
