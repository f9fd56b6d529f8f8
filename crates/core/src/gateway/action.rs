//! Oracle action records: lenient normalisation, then strict validation into
//! the [`Action`] sum type.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vibe_common::Capability;

use super::plan::{normalize_plan, Plan};

const MAX_BATCH_PATHS: usize = 50;

/// Loosely-typed action, with field aliases from different oracle versions
/// folded together.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    pub kind: String,
    pub path: Option<String>,
    pub content: Option<String>,
    pub paths: Option<Vec<String>>,
    pub base64: Option<String>,
    pub diff: Option<String>,
    pub raw: Value,
}

impl ActionRecord {
    /// `None` when the record carries no recognisable type.
    pub fn from_value(raw: &Value) -> Option<Self> {
        let object = raw.as_object()?;
        let kind = ["type", "action", "tool"]
            .iter()
            .filter_map(|key| object.get(*key).and_then(Value::as_str))
            .map(|s| s.trim().to_ascii_uppercase())
            .find(|s| !s.is_empty())?;

        let path = ["path", "file", "name"]
            .iter()
            .filter_map(|key| object.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(str::to_string);

        // Only string content counts; objects and numbers fail validation.
        let content = object
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string);

        let paths = object.get("paths").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .take(MAX_BATCH_PATHS)
                .collect()
        });

        let base64 = ["base64", "contentBase64"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
            .map(str::to_string);

        let diff = object.get("diff").and_then(Value::as_str).map(str::to_string);

        Some(Self {
            kind: canonical_kind(&kind).to_string(),
            path,
            content,
            paths,
            base64,
            diff,
            raw: raw.clone(),
        })
    }

    fn str_field(&self, key: &str) -> Option<String> {
        self.raw
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Folds synonyms onto the canonical type names.
fn canonical_kind(kind: &str) -> &str {
    match kind {
        "READ" | "VIEW_FILE" | "OPEN_FILE" => "READ_FILE",
        "TREE" | "LIST_DIR" | "LIST_FILES" => "LIST_TREE",
        "GREP" | "SEARCH_REPO" => "SEARCH",
        "CREATE" => "CREATE_FILE",
        "WRITE_FILE" | "MODIFY_FILE" | "EDIT_FILE" => "UPDATE_FILE",
        "CREATE_DIRECTORY" | "MKDIR" => "CREATE_DIR",
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    ReadFile {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        paths: Vec<String>,
    },
    ListTree {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        depth: Option<u64>,
    },
    Search {
        query: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ext: Option<String>,
    },
    CreateFile {
        path: String,
        content: String,
    },
    CreateFileBinary {
        path: String,
        base64: String,
    },
    UpdateFile {
        path: String,
        content: String,
    },
    CreateDir {
        path: String,
    },
    EditDiff {
        diff: String,
    },
    EmitPlan {
        plan: Plan,
    },
    Replan {
        plan: Plan,
    },
    ProceedExecution,
    HaltExecution {
        reason: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        missing: Vec<Capability>,
    },
    PlanOnly {
        #[serde(skip_serializing_if = "Option::is_none")]
        plan: Option<Plan>,
    },
    AskInput {
        question: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
    RunTests {
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
}

impl Action {
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::ReadFile { .. } => "READ_FILE",
            Action::ListTree { .. } => "LIST_TREE",
            Action::Search { .. } => "SEARCH",
            Action::CreateFile { .. } => "CREATE_FILE",
            Action::CreateFileBinary { .. } => "CREATE_FILE_BINARY",
            Action::UpdateFile { .. } => "UPDATE_FILE",
            Action::CreateDir { .. } => "CREATE_DIR",
            Action::EditDiff { .. } => "EDIT_DIFF",
            Action::EmitPlan { .. } => "EMIT_PLAN",
            Action::Replan { .. } => "REPLAN",
            Action::ProceedExecution => "PROCEED_EXECUTION",
            Action::HaltExecution { .. } => "HALT_EXECUTION",
            Action::PlanOnly { .. } => "PLAN_ONLY",
            Action::AskInput { .. } => "ASK_INPUT",
            Action::RunTests { .. } => "RUN_TESTS",
        }
    }

    /// Tool actions the gateway executes itself.
    pub fn is_observation(&self) -> bool {
        matches!(
            self,
            Action::ReadFile { .. } | Action::ListTree { .. } | Action::Search { .. }
        )
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Action::CreateFile { .. }
                | Action::CreateFileBinary { .. }
                | Action::UpdateFile { .. }
                | Action::CreateDir { .. }
                | Action::EditDiff { .. }
        )
    }

    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            _ if self.is_observation() => Some(Capability::Read),
            _ if self.is_write() => Some(Capability::Write),
            Action::EmitPlan { plan } | Action::Replan { plan } if plan.has_writes() => {
                Some(Capability::Write)
            }
            Action::RunTests { .. } => Some(Capability::Test),
            _ => None,
        }
    }
}

/// Strict validation of one record.
pub fn validate(record: &ActionRecord) -> Result<Action, String> {
    let kind = record.kind.as_str();
    let required_path = || {
        record
            .path
            .clone()
            .ok_or_else(|| format!("{kind} requires path"))
    };

    match kind {
        "READ_FILE" => {
            let paths = record.paths.clone().unwrap_or_default();
            if record.path.is_none() && paths.iter().all(|p| p.trim().is_empty()) {
                return Err("READ_FILE requires path".to_string());
            }
            Ok(Action::ReadFile {
                path: record.path.clone(),
                paths,
            })
        }
        "LIST_TREE" => Ok(Action::ListTree {
            path: record.path.clone(),
            depth: record.raw.get("depth").and_then(Value::as_u64),
        }),
        "SEARCH" => {
            let query = record
                .str_field("query")
                .or_else(|| record.str_field("q"))
                .ok_or_else(|| "SEARCH requires query".to_string())?;
            Ok(Action::Search {
                query,
                path: record.path.clone(),
                ext: record.str_field("ext"),
            })
        }
        "CREATE_FILE" | "UPDATE_FILE" => match (&record.path, &record.content) {
            (Some(path), Some(content)) => Ok(if kind == "CREATE_FILE" {
                Action::CreateFile {
                    path: path.clone(),
                    content: content.clone(),
                }
            } else {
                Action::UpdateFile {
                    path: path.clone(),
                    content: content.clone(),
                }
            }),
            _ => Err(format!("{kind} requires path and content")),
        },
        "CREATE_FILE_BINARY" => match (&record.path, &record.base64) {
            (Some(path), Some(base64)) => Ok(Action::CreateFileBinary {
                path: path.clone(),
                base64: base64.clone(),
            }),
            _ => Err("CREATE_FILE_BINARY requires path and base64".to_string()),
        },
        "CREATE_DIR" => Ok(Action::CreateDir {
            path: required_path()?,
        }),
        "EDIT_DIFF" => record
            .diff
            .clone()
            .filter(|d| !d.trim().is_empty())
            .map(|diff| Action::EditDiff { diff })
            .ok_or_else(|| "EDIT_DIFF requires diff".to_string()),
        "EMIT_PLAN" | "REPLAN" => {
            let plan = record
                .raw
                .get("plan")
                .and_then(normalize_plan)
                .ok_or_else(|| format!("{kind} requires plan.tasks array"))?;
            Ok(if kind == "EMIT_PLAN" {
                Action::EmitPlan { plan }
            } else {
                Action::Replan { plan }
            })
        }
        "PROCEED_EXECUTION" => Ok(Action::ProceedExecution),
        "HALT_EXECUTION" => Ok(Action::HaltExecution {
            reason: record
                .str_field("reason")
                .unwrap_or_else(|| "HALTED".to_string()),
            missing: record
                .raw
                .get("missing")
                .cloned()
                .and_then(|m| serde_json::from_value(m).ok())
                .unwrap_or_default(),
        }),
        "PLAN_ONLY" => Ok(Action::PlanOnly {
            plan: record.raw.get("plan").and_then(normalize_plan),
        }),
        "ASK_INPUT" => {
            let question = record
                .str_field("question")
                .or_else(|| record.str_field("prompt"))
                .ok_or_else(|| "ASK_INPUT requires question".to_string())?;
            let options = record
                .raw
                .get("options")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Action::AskInput {
                question,
                options,
                kind: record.str_field("kind"),
            })
        }
        "RUN_TESTS" => Ok(Action::RunTests {
            command: record.str_field("command"),
        }),
        other => Err(format!("unknown type {other}")),
    }
}

/// Validates a whole reply. Returns the valid actions and one error string
/// per rejected record.
pub fn validate_all(raw: &[Value]) -> (Vec<Action>, Vec<String>) {
    let mut actions = Vec::new();
    let mut errors = Vec::new();
    for value in raw {
        if value.is_null() {
            errors.push("null action".to_string());
            continue;
        }
        let Some(record) = ActionRecord::from_value(value) else {
            errors.push("missing type".to_string());
            continue;
        };
        match validate(&record) {
            Ok(action) => actions.push(action),
            Err(err) => errors.push(err),
        }
    }
    (actions, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_field_aliases() {
        let record = ActionRecord::from_value(&json!({
            "action": "view_file",
            "file": " src/main.rs ",
        }))
        .unwrap();
        assert_eq!(record.kind, "READ_FILE");
        assert_eq!(record.path.as_deref(), Some("src/main.rs"));

        let record = ActionRecord::from_value(&json!({
            "tool": "create_file_binary",
            "name": "logo.png",
            "contentBase64": "AAA=",
        }))
        .unwrap();
        assert_eq!(record.base64.as_deref(), Some("AAA="));
        assert!(ActionRecord::from_value(&json!({"path": "x"})).is_none());
    }

    #[test]
    fn batch_paths_are_capped() {
        let paths: Vec<String> = (0..80).map(|i| format!("f{i}")).collect();
        let record = ActionRecord::from_value(&json!({"type": "READ_FILE", "paths": paths})).unwrap();
        assert_eq!(record.paths.unwrap().len(), 50);
    }

    #[test]
    fn strict_validation_reports_precise_errors() {
        let (actions, errors) = validate_all(&[
            json!({"type": "CREATE_FILE", "path": "a.txt", "content": "x"}),
            json!({"type": "UPDATE_FILE", "path": "b.txt"}),
            json!({"type": "DANCE"}),
            json!({"type": "EMIT_PLAN", "plan": {"goal": "g"}}),
            json!(null),
            json!({"type": "PROCEED_EXECUTION"}),
            json!({"type": "CREATE_FILE", "path": "c.json", "content": {"not": "a string"}}),
            json!({"type": "UPDATE_FILE", "path": "d.txt", "content": 42}),
        ]);
        assert_eq!(actions.len(), 2);
        assert_eq!(
            errors,
            vec![
                "UPDATE_FILE requires path and content",
                "unknown type DANCE",
                "EMIT_PLAN requires plan.tasks array",
                "null action",
                "CREATE_FILE requires path and content",
                "UPDATE_FILE requires path and content",
            ]
        );
    }

    #[test]
    fn serializes_with_screaming_type_tag() {
        let action = Action::HaltExecution {
            reason: "PERMISSION_REQUIRED".into(),
            missing: vec![Capability::Write],
        };
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({"type": "HALT_EXECUTION", "reason": "PERMISSION_REQUIRED", "missing": ["write"]})
        );
        assert_eq!(
            serde_json::to_value(Action::ProceedExecution).unwrap(),
            json!({"type": "PROCEED_EXECUTION"})
        );
    }

    #[test]
    fn capability_requirements() {
        let read = Action::ReadFile { path: Some("a".into()), paths: vec![] };
        let write = Action::CreateDir { path: "d".into() };
        let tests = Action::RunTests { command: None };
        assert_eq!(read.required_capability(), Some(Capability::Read));
        assert_eq!(write.required_capability(), Some(Capability::Write));
        assert_eq!(tests.required_capability(), Some(Capability::Test));
        assert_eq!(Action::ProceedExecution.required_capability(), None);
    }
}
