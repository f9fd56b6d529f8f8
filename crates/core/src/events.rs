//! Durable event log.
//!
//! The log is one JSON array in `<state>/events.json`. Every append rewrites
//! the whole array through a temp file and an atomic rename, then refreshes
//! `events.json.bak` on a best-effort basis. Reads never fail: a corrupt
//! primary is salvaged element by element, then the backup is consulted,
//! and as a last resort the log reads as empty.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use vibe_common::fs::{SafeFileWriter, WriteMode};

use crate::errors::{VibeError, VibeResult};

const EVENTS_FILE: &str = "events.json";
const SUMMARY_WINDOW: usize = 50;
const SUMMARY_MAX_PATHS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    PatchApplied,
    Revert,
    Reapply,
    TestResult,
    Chat,
    AskInput,
    Answer,
    TaskDone,
    AgentPlan,
    GitRevert,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::PatchApplied => "PATCH_APPLIED",
            EventKind::Revert => "REVERT",
            EventKind::Reapply => "REAPPLY",
            EventKind::TestResult => "TEST_RESULT",
            EventKind::Chat => "CHAT",
            EventKind::AskInput => "ASK_INPUT",
            EventKind::Answer => "ANSWER",
            EventKind::TaskDone => "TASK_DONE",
            EventKind::AgentPlan => "AGENT_PLAN",
            EventKind::GitRevert => "GIT_REVERT",
            EventKind::Other(name) => name,
        }
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "PATCH_APPLIED" => EventKind::PatchApplied,
            "REVERT" => EventKind::Revert,
            "REAPPLY" => EventKind::Reapply,
            "TEST_RESULT" => EventKind::TestResult,
            "CHAT" => EventKind::Chat,
            "ASK_INPUT" => EventKind::AskInput,
            "ANSWER" => EventKind::Answer,
            "TASK_DONE" => EventKind::TaskDone,
            "AGENT_PLAN" => EventKind::AgentPlan,
            "GIT_REVERT" => EventKind::GitRevert,
            _ => EventKind::Other(value),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unix millis.
    #[serde(rename = "ts", alias = "timestamp", default)]
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn now(kind: EventKind, data: Value) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            kind,
            data,
        }
    }
}

pub struct EventLog {
    path: PathBuf,
    backup_path: PathBuf,
    writer: SafeFileWriter,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn open(state_dir: &Path) -> VibeResult<Self> {
        fs::create_dir_all(state_dir).map_err(|err| {
            VibeError::io(Some(state_dir.to_path_buf()), "create state directory", err)
        })?;
        let path = state_dir.join(EVENTS_FILE);
        let backup_path = state_dir.join(format!("{EVENTS_FILE}.bak"));
        Ok(Self {
            path,
            backup_path,
            writer: SafeFileWriter::new(state_dir.to_path_buf()),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, kind: EventKind, data: Value) -> VibeResult<Event> {
        let event = Event::now(kind, data);
        self.append_event(event.clone())?;
        Ok(event)
    }

    /// Appends under the write lock so concurrent appends never lose events.
    pub fn append_event(&self, event: Event) -> VibeResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut events = self.read_all();
        events.push(event);
        let serialized = serde_json::to_vec_pretty(&events)
            .map_err(|err| VibeError::internal(format!("serialize event log: {err}")))?;

        self.writer
            .write(&self.path, &serialized, WriteMode::Atomic)
            .map_err(VibeError::from)?;

        if let Err(err) = self
            .writer
            .write(&self.backup_path, &serialized, WriteMode::Direct)
        {
            warn!("event log backup not refreshed: {err:#}");
        }
        debug!(events = events.len(), "appended event");
        Ok(())
    }

    pub fn read_all(&self) -> Vec<Event> {
        let primary = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return read_backup(&self.backup_path).unwrap_or_default()
            }
            Err(err) => {
                warn!("event log unreadable: {err}");
                String::new()
            }
        };

        if let Ok(values) = serde_json::from_str::<Vec<Value>>(&primary) {
            return events_from_values(values);
        }

        let salvaged = salvage_prefix(&primary);
        let backup = read_backup(&self.backup_path);
        match backup {
            Some(backup) if backup.len() >= salvaged.len() => {
                warn!(
                    salvaged = salvaged.len(),
                    recovered = backup.len(),
                    "event log corrupt; recovered from backup"
                );
                backup
            }
            _ => {
                warn!(salvaged = salvaged.len(), "event log corrupt; salvaged valid prefix");
                salvaged
            }
        }
    }
}

fn read_backup(path: &Path) -> Option<Vec<Event>> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str::<Vec<Value>>(&raw)
        .ok()
        .map(events_from_values)
}

/// Drops elements that are not well-formed events instead of failing the read.
fn events_from_values(values: Vec<Value>) -> Vec<Event> {
    values
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect()
}

/// Parses array elements one at a time and keeps every element that
/// completed before the damage.
fn salvage_prefix(raw: &str) -> Vec<Event> {
    let Some(open) = raw.find('[') else {
        return Vec::new();
    };
    let mut rest = &raw[open + 1..];
    let mut values = Vec::new();

    loop {
        rest = rest.trim_start();
        if rest.is_empty() || rest.starts_with(']') {
            break;
        }
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                values.push(value);
                rest = rest[consumed..].trim_start();
                match rest.strip_prefix(',') {
                    Some(after_comma) => rest = after_comma,
                    None => break,
                }
            }
            _ => break,
        }
    }

    events_from_values(values)
}

/// One-line digest of recent activity, injected into planning prompts.
pub fn summarize(events: &[Event]) -> String {
    let window = &events[events.len().saturating_sub(SUMMARY_WINDOW)..];
    let (mut patches, mut reverts, mut tests) = (0, 0, 0);
    let mut recent: Vec<&str> = Vec::new();

    for event in window {
        match event.kind {
            EventKind::PatchApplied => patches += 1,
            EventKind::Revert => reverts += 1,
            EventKind::TestResult => tests += 1,
            _ => {}
        }
    }

    for event in window.iter().rev() {
        if event.kind != EventKind::PatchApplied {
            continue;
        }
        let paths = event
            .data
            .get("changes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|change| change.get("path").and_then(Value::as_str));
        for path in paths {
            if recent.len() < SUMMARY_MAX_PATHS && !recent.contains(&path) {
                recent.push(path);
            }
        }
    }

    let mut summary = format!("Memory: patches={patches} reverts={reverts} tests={tests}");
    if !recent.is_empty() {
        summary.push_str(&format!(" recent=[{}]", recent.join(", ")));
    }
    summary
}

/// Commit hash recorded on the PATCH_APPLIED event for `changeset_id`.
pub fn find_patch_commit(events: &[Event], changeset_id: &str) -> Option<String> {
    events
        .iter()
        .rev()
        .filter(|event| event.kind == EventKind::PatchApplied)
        .find(|event| {
            event.data.get("changesetId").and_then(Value::as_str) == Some(changeset_id)
        })
        .and_then(|event| event.data.get("commitHash"))
        .and_then(Value::as_str)
        .filter(|hash| !hash.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_round_trip_preserves_order() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();

        log.append(EventKind::Chat, json!({"text": "hi"})).unwrap();
        log.append(EventKind::Other("CUSTOM".into()), json!(null)).unwrap();

        let events = log.read_all();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Chat);
        assert_eq!(events[1].kind.as_str(), "CUSTOM");
        assert!(dir.path().join("events.json.bak").exists());
    }

    #[test]
    fn truncated_primary_without_backup_yields_valid_prefix() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        for i in 0..3 {
            log.append(EventKind::Chat, json!({ "n": i })).unwrap();
        }
        fs::remove_file(dir.path().join("events.json.bak")).unwrap();

        let raw = fs::read_to_string(log.path()).unwrap();
        let third = raw.rfind("\"n\": 2").unwrap();
        fs::write(log.path(), &raw[..third]).unwrap();

        let events = log.read_all();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data["n"], 1);
    }

    #[test]
    fn unreadable_primary_falls_back_to_backup() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        log.append(EventKind::TestResult, json!({"ok": true})).unwrap();
        log.append(EventKind::Chat, json!({"text": "x"})).unwrap();

        fs::write(log.path(), "\u{0}garbage").unwrap();
        let events = log.read_all();
        assert_eq!(events.len(), 2);

        fs::write(dir.path().join("events.json.bak"), "also garbage").unwrap();
        assert!(log.read_all().is_empty());
    }

    #[test]
    fn accepts_timestamp_alias_and_skips_malformed_entries() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        fs::write(
            log.path(),
            r#"[{"timestamp": 5, "type": "REVERT", "data": {}}, 42, {"type": "CHAT"}]"#,
        )
        .unwrap();

        let events = log.read_all();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp, 5);
        assert_eq!(events[1].data, Value::Null);
    }

    #[test]
    fn summary_counts_and_recent_paths() {
        let events = vec![
            Event::now(
                EventKind::PatchApplied,
                json!({"changes": [{"path": "a.rs"}, {"path": "b.rs"}]}),
            ),
            Event::now(EventKind::Revert, json!({})),
            Event::now(EventKind::TestResult, json!({"ok": false})),
            Event::now(EventKind::PatchApplied, json!({"changes": [{"path": "c.rs"}, {"path": "a.rs"}]})),
        ];
        assert_eq!(
            summarize(&events),
            "Memory: patches=2 reverts=1 tests=1 recent=[c.rs, a.rs, b.rs]"
        );
        assert_eq!(summarize(&[]), "Memory: patches=0 reverts=0 tests=0");
    }

    #[test]
    fn finds_commit_for_changeset() {
        let events = vec![
            Event::now(EventKind::PatchApplied, json!({"changesetId": "1_a", "commitHash": "abc123"})),
            Event::now(EventKind::PatchApplied, json!({"changesetId": "2_b", "commitHash": null})),
        ];
        assert_eq!(find_patch_commit(&events, "1_a").as_deref(), Some("abc123"));
        assert_eq!(find_patch_commit(&events, "2_b"), None);
        assert_eq!(find_patch_commit(&events, "3_c"), None);
    }
}
