//! # Change Control
//!
//! `ChangeControl` owns the workspace, snapshot store, event log, mutation
//! coordinator and VCS side channel, and exposes every logical operation of
//! the change-control plane.
//!
//! ## Ordering
//!
//! Mutations run under the coordinator. Inside the critical section files are
//! written first, then the snapshot is captured, then the PATCH_APPLIED event
//! is appended, so a crash can leave an orphan snapshot but never an event
//! that points at a missing one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use vibe_common::limits::{
    resolve_read_max_bytes, resolve_search_max_results, resolve_tree_depth,
};

use crate::apply::{commit_changes, plan_patch, render_text_diff};
use crate::changeset::{combined_diff, FileChange};
use crate::config::VibeConfig;
use crate::errors::{VibeError, VibeResult};
use crate::events::{self, Event, EventKind, EventLog};
use crate::guard::{MutationClass, MutationCoordinator};
use crate::ops::{execute_op, merge_by_path, parse_ops, OpError};
use crate::patch_parser::ParsedPatch;
use crate::patcher::ApplyOptions;
use crate::revert::{RestoreAction, RestoredFile, RevertService};
use crate::snapshot::{PruneReport, Side, SnapshotInfo, SnapshotStore};
use crate::vcs::{GitCli, VcsChannel};
use crate::warning::{Warning, WarningKind};
use crate::workspace::{FileRead, SearchMatch, TreeEntry, Workspace};

const TEST_OUTPUT_MAX_CHARS: usize = 20_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PatchOptions {
    /// Overrides `patch.keep_regions` when set.
    pub keep_regions: Option<bool>,
    pub preview: bool,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchResult {
    pub changeset_id: Option<String>,
    pub preview: bool,
    pub changes: Vec<FileChange>,
    pub diff: String,
    pub warnings: Vec<Warning>,
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsResult {
    pub changeset_id: Option<String>,
    pub changes: Vec<FileChange>,
    pub diff: String,
    pub errors: Vec<OpError>,
    pub warnings: Vec<Warning>,
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VcsRevert {
    pub reverted: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertResult {
    pub changeset_id: String,
    pub direction: Side,
    pub restored: Vec<RestoredFile>,
    pub diff: String,
    pub warnings: Vec<Warning>,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcs: Option<VcsRevert>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TestRun {
    pub ok: bool,
    pub code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

pub struct ChangeControl {
    config: VibeConfig,
    workspace: Workspace,
    snapshots: SnapshotStore,
    events: EventLog,
    coordinator: MutationCoordinator,
    vcs: Arc<dyn VcsChannel>,
}

impl ChangeControl {
    /// Opens the workspace at `root`, creating the state directory.
    pub fn open(root: impl Into<std::path::PathBuf>, config: VibeConfig) -> VibeResult<Self> {
        let workspace = Workspace::new(root, &config)?;
        let state_dir = workspace.state_dir();
        let snapshots = SnapshotStore::open(&state_dir)?;
        let events = EventLog::open(&state_dir)?;
        let vcs: Arc<dyn VcsChannel> = Arc::new(GitCli::new(workspace.root(), &config.git));
        info!(root = %workspace.root().display(), "change control ready");
        Ok(Self {
            config,
            workspace,
            snapshots,
            events,
            coordinator: MutationCoordinator::new(),
            vcs,
        })
    }

    pub fn with_vcs(mut self, vcs: Arc<dyn VcsChannel>) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn config(&self) -> &VibeConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn vcs(&self) -> &dyn VcsChannel {
        self.vcs.as_ref()
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    /// Applies a unified diff. With `preview` nothing is written, captured
    /// or logged and no changeset id is issued.
    #[instrument(skip(self, diff), fields(bytes = diff.len(), preview = options.preview))]
    pub fn apply_patch(&self, diff: &str, options: PatchOptions) -> VibeResult<PatchResult> {
        let limit = self.config.limits.max_diff_bytes;
        if diff.len() > limit {
            return Err(VibeError::ResourceLimit {
                resource_type: "diff".to_string(),
                current_usage: diff.len() as u64,
                limit: limit as u64,
                unit: "bytes".to_string(),
            });
        }

        let parsed = ParsedPatch::from_diff(diff);
        if parsed.hunk_count() == 0 {
            return Err(VibeError::InvalidDiff {
                reason: "no file hunks found in diff".to_string(),
                line_number: None,
            });
        }

        let apply_options = ApplyOptions::from_config(&self.config.patch, options.keep_regions);
        let mut warnings = Vec::new();

        if options.preview {
            let changes = plan_patch(&self.workspace, &parsed, &apply_options, &mut warnings);
            return Ok(PatchResult {
                changeset_id: None,
                preview: true,
                diff: combined_diff(&changes),
                changes,
                warnings,
                commit_hash: None,
            });
        }

        let _permit = self.coordinator.try_acquire(MutationClass::Patch)?;
        let planned = plan_patch(&self.workspace, &parsed, &apply_options, &mut warnings);
        let changes = commit_changes(&self.workspace, planned, &mut warnings);
        let (changeset_id, commit_hash) =
            self.record_changeset(&changes, options.title.as_deref(), &mut warnings)?;

        info!(
            changeset = changeset_id.as_deref().unwrap_or("-"),
            files = changes.len(),
            warnings = warnings.len(),
            "patch applied"
        );
        Ok(PatchResult {
            changeset_id,
            preview: false,
            diff: combined_diff(&changes),
            changes,
            warnings,
            commit_hash,
        })
    }

    /// Runs raw file ops. Per-op failures land in `errors`; the rest of the
    /// batch still applies.
    #[instrument(skip(self, raw_ops), fields(ops = raw_ops.len()))]
    pub fn apply_ops(&self, raw_ops: &[Value], title: Option<&str>) -> VibeResult<OpsResult> {
        if raw_ops.is_empty() {
            return Err(VibeError::validation("ops", "ops required"));
        }
        let (ops, mut errors) = parse_ops(raw_ops, self.config.limits.max_ops);

        let _permit = self.coordinator.try_acquire(MutationClass::Patch)?;
        let mut changes = Vec::new();
        for (index, op) in &ops {
            match execute_op(&self.workspace, op) {
                Ok(change) => changes.push(change),
                Err(err) => {
                    warn!(op = op.name(), path = op.path(), "op rejected: {err}");
                    errors.push(OpError {
                        index: *index,
                        op: Some(op.name().to_string()),
                        path: Some(op.path().to_string()),
                        error: op_error_message(&err),
                    });
                }
            }
        }
        errors.sort_by_key(|error| error.index);
        let changes = merge_by_path(changes);

        let mut warnings = Vec::new();
        let (changeset_id, commit_hash) = self.record_changeset(&changes, title, &mut warnings)?;
        Ok(OpsResult {
            changeset_id,
            diff: combined_diff(&changes),
            changes,
            errors,
            warnings,
            commit_hash,
        })
    }

    /// Snapshot, optional commit, then PATCH_APPLIED. Returns no id when
    /// nothing changed.
    fn record_changeset(
        &self,
        changes: &[FileChange],
        title: Option<&str>,
        warnings: &mut Vec<Warning>,
    ) -> VibeResult<(Option<String>, Option<String>)> {
        let changed: Vec<FileChange> = changes
            .iter()
            .filter(|change| !change.is_unchanged())
            .cloned()
            .collect();
        if changed.is_empty() {
            return Ok((None, None));
        }

        let id = SnapshotStore::generate_id();
        match self.snapshots.capture(&id, &changed) {
            Ok(capture_warnings) => warnings.extend(capture_warnings),
            Err(err) => {
                // Files are already written; report them without an id.
                warn!(changeset = %id, "snapshot not captured: {err}");
                warnings.push(Warning::new(
                    "",
                    WarningKind::SnapshotFailed,
                    format!("changeset not recorded: {err}"),
                ));
                return Ok((None, None));
            }
        }

        let title = title.map(str::trim).filter(|t| !t.is_empty());
        let commit_hash = self.vcs_commit(&changed, title.unwrap_or("Patch"), &id);

        let summary: Vec<Value> = changed
            .iter()
            .map(|change| json!({ "path": change.path, "type": change.change_type }))
            .collect();
        let data = json!({
            "changesetId": id,
            "changes": summary,
            "commitHash": commit_hash,
            "title": title.unwrap_or(""),
        });
        if let Err(err) = self.events.append(EventKind::PatchApplied, data) {
            warn!(changeset = %id, "PATCH_APPLIED not logged: {err}");
            warnings.push(Warning::new("", WarningKind::EventLogFailed, err.to_string()));
        }
        Ok((Some(id), commit_hash))
    }

    fn vcs_commit(&self, changes: &[FileChange], title: &str, id: &str) -> Option<String> {
        if !self.vcs.is_available() {
            return None;
        }
        if let Err(err) = self.vcs.ensure_branch() {
            warn!("run branch unavailable: {err:#}");
        }
        let paths: Vec<String> = changes.iter().map(|change| change.path.clone()).collect();
        match self.vcs.commit(&paths, &format!("[ViBE] {title} ({id})")) {
            Ok(hash) => Some(hash),
            Err(err) => {
                warn!(changeset = id, "commit skipped: {err:#}");
                None
            }
        }
    }

    /// Dry run of [`revert`](Self::revert): divergence warnings only.
    pub fn check_revert(
        &self,
        changeset_id: &str,
        direction: Side,
        paths: Option<&[String]>,
    ) -> VibeResult<Vec<Warning>> {
        SnapshotStore::validate_id(changeset_id)?;
        RevertService::new(&self.workspace, &self.snapshots).check(changeset_id, direction, paths)
    }

    #[instrument(skip(self, paths), fields(direction = direction.as_str()))]
    pub fn revert(
        &self,
        changeset_id: &str,
        direction: Side,
        paths: Option<&[String]>,
    ) -> VibeResult<RevertResult> {
        SnapshotStore::validate_id(changeset_id)?;
        let _permit = self.coordinator.try_acquire(MutationClass::Revert)?;
        let partial = paths.map_or(false, |p| !p.is_empty());

        if direction == Side::Before && !partial {
            if let Some(result) = self.try_vcs_revert(changeset_id)? {
                return Ok(result);
            }
        }

        let outcome =
            RevertService::new(&self.workspace, &self.snapshots).restore(changeset_id, direction, paths)?;
        let kind = match direction {
            Side::Before => EventKind::Revert,
            Side::After => EventKind::Reapply,
        };
        let mut warnings = outcome.warnings;
        let data = json!({
            "changesetId": changeset_id,
            "restored": outcome.restored,
            "partial": partial,
        });
        if let Err(err) = self.events.append(kind, data) {
            warn!(changeset = changeset_id, "revert not logged: {err}");
            warnings.push(Warning::new("", WarningKind::EventLogFailed, err.to_string()));
        }

        info!(
            changeset = changeset_id,
            restored = outcome.restored.len(),
            partial,
            "changeset restored"
        );
        Ok(RevertResult {
            changeset_id: changeset_id.to_string(),
            direction,
            restored: outcome.restored,
            diff: outcome.diff,
            warnings,
            partial,
            vcs: None,
        })
    }

    fn try_vcs_revert(&self, changeset_id: &str) -> VibeResult<Option<RevertResult>> {
        if !self.vcs.is_available() {
            return Ok(None);
        }
        let Some(hash) = events::find_patch_commit(&self.events.read_all(), changeset_id) else {
            return Ok(None);
        };
        // The files are needed either way; an unknown id fails here.
        let paths = self.snapshots.list(changeset_id)?;

        if let Err(err) = self.vcs.revert_commit(&hash) {
            warn!(changeset = changeset_id, commit = %hash, "git revert failed, restoring files: {err:#}");
            return Ok(None);
        }

        let mut warnings = Vec::new();
        if let Err(err) = self.events.append(
            EventKind::GitRevert,
            json!({ "changesetId": changeset_id, "commitHash": hash }),
        ) {
            warnings.push(Warning::new("", WarningKind::EventLogFailed, err.to_string()));
        }

        let mut restored = Vec::with_capacity(paths.len());
        for path in paths {
            let action = match self.snapshots.read_side(changeset_id, Side::Before, &path)? {
                Some(_) => RestoreAction::Restored,
                None => RestoreAction::Deleted,
            };
            restored.push(RestoredFile { path, action });
        }

        Ok(Some(RevertResult {
            changeset_id: changeset_id.to_string(),
            direction: Side::Before,
            restored,
            diff: format!("(git revert {hash})"),
            warnings,
            partial: false,
            vcs: Some(VcsRevert { reverted: hash }),
        }))
    }

    pub fn list_snapshots(&self) -> VibeResult<Vec<SnapshotInfo>> {
        self.snapshots.list_all()
    }

    /// Deletes all but the `keep` newest snapshots. Only runs on request.
    pub fn prune_snapshots(&self, keep: usize) -> VibeResult<PruneReport> {
        let _permit = self.coordinator.try_acquire(MutationClass::Revert)?;
        self.snapshots.prune(keep)
    }

    pub fn append_event(&self, kind: EventKind, data: Value) -> VibeResult<Event> {
        self.events.append(kind, data)
    }

    /// All events, or the most recent `limit`.
    pub fn read_events(&self, limit: Option<usize>) -> Vec<Event> {
        let events = self.events.read_all();
        match limit {
            Some(limit) if limit < events.len() => events[events.len() - limit..].to_vec(),
            _ => events,
        }
    }

    pub fn memory_summary(&self) -> String {
        events::summarize(&self.events.read_all())
    }

    pub fn record_test_result(&self, run: TestRun) -> VibeResult<Event> {
        let data = json!({
            "ok": run.ok,
            "code": run.code,
            "stdout": truncate_chars(&run.stdout, TEST_OUTPUT_MAX_CHARS),
            "stderr": truncate_chars(&run.stderr, TEST_OUTPUT_MAX_CHARS),
        });
        self.events.append(EventKind::TestResult, data)
    }

    pub fn tree(&self, path: Option<&str>, depth: Option<u64>) -> VibeResult<Vec<TreeEntry>> {
        let depth = resolve_tree_depth(depth).value as usize;
        self.workspace.tree(path, depth)
    }

    pub fn read_file(&self, path: &str, offset: u64, max_bytes: Option<u64>) -> VibeResult<FileRead> {
        let max = resolve_read_max_bytes(max_bytes, self.config.limits.read_max_bytes).value;
        self.workspace.read_file(path, offset, max)
    }

    pub fn search(
        &self,
        query: &str,
        path: Option<&str>,
        max: Option<u64>,
        ext: Option<&str>,
    ) -> VibeResult<Vec<SearchMatch>> {
        let max = resolve_search_max_results(max).value as usize;
        self.workspace.search(query, path, max, ext)
    }

    /// Minimal diff from the file on disk to `new_content`.
    pub fn diff_against_current(&self, path: &str, new_content: &str) -> VibeResult<String> {
        let rel = self.workspace.normalize_relative(path)?;
        let current = self.workspace.read_bytes(&rel)?;
        Ok(render_text_diff(&rel, current.as_deref(), Some(new_content.as_bytes())))
    }
}

fn op_error_message(err: &VibeError) -> String {
    match err {
        VibeError::Validation { reason, .. } => reason.clone(),
        VibeError::ProtectedPath { .. } => "path not allowed".to_string(),
        VibeError::ResourceLimit {
            current_usage,
            limit,
            ..
        } => format!("content too large ({current_usage} > {limit})"),
        other => other.to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
