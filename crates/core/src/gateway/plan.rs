//! Task plans: normalisation of oracle-supplied plans, the task status
//! machine, and grouping of write actions into one executable plan.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::action::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Planned,
    Executing,
    Verifying,
    Done,
    Blocked,
    NeedsInput,
    Reverted,
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PLANNED" => Some(Self::Planned),
            "EXECUTING" => Some(Self::Executing),
            "VERIFYING" => Some(Self::Verifying),
            "DONE" => Some(Self::Done),
            "BLOCKED" => Some(Self::Blocked),
            "NEEDS_INPUT" => Some(Self::NeedsInput),
            "REVERTED" => Some(Self::Reverted),
            _ => None,
        }
    }

    pub fn is_pending(self) -> bool {
        !matches!(self, Self::Done | Self::Reverted)
    }

    /// Forward-only, except a blocked task may be retried and a finished one
    /// may be reverted.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self == next {
            return true;
        }
        match self {
            Planned => matches!(next, Executing | Blocked | NeedsInput),
            Executing => matches!(next, Verifying | Done | Blocked | NeedsInput),
            Verifying => matches!(next, Done | Blocked),
            Blocked => next == Verifying,
            NeedsInput => next == Executing,
            Done => next == Reverted,
            Reverted => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedWrite {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub writes: Vec<PlannedWrite>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl Task {
    fn new(title: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            title: title.into(),
            status: TaskStatus::Planned,
            steps,
            notes: String::new(),
            writes: Vec::new(),
            diff: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub goal: String,
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn has_writes(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| !t.writes.is_empty() || t.diff.is_some())
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status.is_pending()).count()
    }
}

/// Accepts any object with a `tasks` array and fills in what is missing.
pub fn normalize_plan(value: &Value) -> Option<Plan> {
    let tasks = value.get("tasks")?.as_array()?;
    let text = |v: &Value, key: &str| {
        v.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let tasks = tasks
        .iter()
        .filter(|t| t.is_object())
        .map(|t| Task {
            task_id: text(t, "taskId")
                .or_else(|| text(t, "id"))
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            title: ["title", "name", "summary", "description"]
                .iter()
                .find_map(|key| text(t, key))
                .unwrap_or_else(|| "Task".to_string()),
            status: t
                .get("status")
                .and_then(Value::as_str)
                .and_then(TaskStatus::parse)
                .unwrap_or_default(),
            steps: t
                .get("steps")
                .and_then(Value::as_array)
                .map(|steps| {
                    steps
                        .iter()
                        .map(|s| match s {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            notes: text(t, "notes").unwrap_or_default(),
            writes: t
                .get("writes")
                .cloned()
                .and_then(|w| serde_json::from_value(w).ok())
                .unwrap_or_default(),
            diff: text(t, "diff"),
        })
        .collect();

    Some(Plan {
        plan_id: text(value, "planId").unwrap_or_else(|| format!("plan_{}", millis())),
        goal: text(value, "goal").unwrap_or_default(),
        tasks,
    })
}

/// Folds the write-shaped actions into one plan: a task per directory, one
/// task for all file writes, one for all diffs. `None` when nothing writes.
pub fn group_writes(actions: &[Action], goal: &str) -> Option<Plan> {
    let mut tasks = Vec::new();
    let mut writes = Vec::new();
    let mut diffs: Vec<&str> = Vec::new();

    for action in actions {
        match action {
            Action::CreateDir { path } => {
                tasks.push(Task::new(
                    format!("Create directory {path}"),
                    vec![format!("mkdir {path}")],
                ));
            }
            Action::CreateFile { path, content } | Action::UpdateFile { path, content } => {
                writes.push(PlannedWrite {
                    path: path.clone(),
                    content: Some(content.clone()),
                    base64: None,
                });
            }
            Action::CreateFileBinary { path, base64 } => writes.push(PlannedWrite {
                path: path.clone(),
                content: None,
                base64: Some(base64.clone()),
            }),
            Action::EditDiff { diff } => diffs.push(diff),
            _ => {}
        }
    }

    if !writes.is_empty() {
        let title = match writes.as_slice() {
            [single] => format!("Write {}", single.path),
            many => format!("Write {} file(s)", many.len()),
        };
        let steps = writes.iter().map(|w| format!("write {}", w.path)).collect();
        let mut task = Task::new(title, steps);
        task.writes = writes;
        tasks.push(task);
    }

    if !diffs.is_empty() {
        let combined = diffs.join("\n");
        let paths = diff_targets(&combined);
        let mut task = Task::new(
            format!("Apply diff ({} files)", paths.len()),
            paths.iter().map(|p| format!("diff {p}")).collect(),
        );
        task.diff = Some(combined);
        tasks.push(task);
    }

    if tasks.is_empty() {
        return None;
    }
    Some(Plan {
        plan_id: format!("tool_plan_{}", millis()),
        goal: goal.to_string(),
        tasks,
    })
}

/// Two-step plan used when the oracle cannot be reached.
pub fn fallback_plan(goal: &str) -> Plan {
    Plan {
        plan_id: format!("mock_{}", millis()),
        goal: goal.to_string(),
        tasks: vec![
            Task::new("Analyze repository", vec!["tree".into(), "search".into()]),
            Task::new("Implement change", vec!["edit files".into(), "tests".into()]),
        ],
    }
}

fn diff_targets(diff: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for line in diff.lines() {
        let Some(rest) = line.strip_prefix("+++ ") else {
            continue;
        };
        let path = rest.split('\t').next().unwrap_or_default().trim();
        let path = path.strip_prefix("b/").unwrap_or(path);
        if path != "/dev/null" && !path.is_empty() && !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
    }
    paths
}

fn millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
