//! Planning oracle contract.
//!
//! The oracle turns natural-language intent into a message plus raw action
//! records. Nothing it returns is trusted: the gateway in `vibe-core`
//! normalises and revalidates every reply.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ChatMessage;

/// One oracle round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleRequest {
    /// Compact repository summary (top-level files and dirs).
    pub repo_summary: Value,
    /// Recent conversation, oldest first.
    pub history: Vec<ChatMessage>,
    pub user_text: String,
    /// Extra system guidance: observations, policy reminders, validation errors.
    pub extra_system: Option<String>,
    /// Set when the previous reply was unusable and at least one action is required.
    pub force_actions: bool,
}

/// Raw oracle output, before normalisation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OracleReply {
    pub message: String,
    pub actions: Vec<Value>,
}

impl OracleReply {
    /// Builds a reply from an arbitrary JSON object, tolerating missing or
    /// mistyped `message` / `actions` fields.
    pub fn from_value(value: Value) -> Self {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let actions = value
            .get("actions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Self { message, actions }
    }
}

#[async_trait]
pub trait PlanningOracle: Send + Sync {
    /// Short provider name reported back to callers (e.g. `openai`).
    fn name(&self) -> &str;

    async fn complete(&self, request: &OracleRequest) -> Result<OracleReply>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_tolerates_missing_fields() {
        let reply = OracleReply::from_value(json!({ "actions": "nope" }));
        assert_eq!(reply.message, "");
        assert!(reply.actions.is_empty());

        let reply = OracleReply::from_value(json!({
            "message": "  ok  ",
            "actions": [{ "type": "READ_FILE", "path": "README.md" }]
        }));
        assert_eq!(reply.message, "ok");
        assert_eq!(reply.actions.len(), 1);
    }
}
