//! Planning oracle backed by any OpenAI-compatible `chat/completions`
//! endpoint (OpenAI, Azure-style proxies, local servers).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use vibe_common::{ChatRole, OracleReply, OracleRequest, PlanningOracle};

const TEMPERATURE: f64 = 0.2;
const ERROR_BODY_MAX_CHARS: usize = 500;

const SYSTEM_PROMPT: &str = r#"You are a coding agent working inside a local repository.
Reply with a single JSON object: {"message": string, "actions": Action[]}.
Action types:
- READ_FILE {path} or {paths: [..]}: read files before changing them
- LIST_TREE {path, depth}: list directories
- SEARCH {query, path?, ext?}: case-insensitive text search
- CREATE_FILE {path, content} / UPDATE_FILE {path, content}: full file content
- CREATE_FILE_BINARY {path, base64}
- CREATE_DIR {path}
- EDIT_DIFF {diff}: unified diff
- EMIT_PLAN {plan: {goal, tasks: [{title, steps, notes}]}} / REPLAN {plan}
- PROCEED_EXECUTION / HALT_EXECUTION {reason}
- ASK_INPUT {question, options?, kind?}
- RUN_TESTS {command?}
Never invent file contents you have not read. Return JSON only."#;

#[derive(Debug, Clone)]
pub struct OpenAiLikeSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// Number of history messages forwarded per request.
    pub history_window: usize,
}

impl Default for OpenAiLikeSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
            history_window: 10,
        }
    }
}

pub struct OpenAiLikeOracle {
    client: reqwest::Client,
    settings: OpenAiLikeSettings,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiLikeOracle {
    pub fn new(settings: OpenAiLikeSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("Failed to build HTTP client for the planning oracle")?;
        Ok(Self { client, settings })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn build_messages(&self, request: &OracleRequest) -> Vec<Value> {
        let mut messages = vec![
            json!({ "role": "system", "content": SYSTEM_PROMPT }),
            json!({
                "role": "system",
                "content": format!("Repository summary: {}", request.repo_summary),
            }),
        ];
        if let Some(extra) = request.extra_system.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(json!({ "role": "system", "content": extra }));
        }
        if request.force_actions {
            messages.push(json!({
                "role": "system",
                "content": "You must return at least one valid action.",
            }));
        }

        let skip = request
            .history
            .len()
            .saturating_sub(self.settings.history_window);
        for message in &request.history[skip..] {
            let role = match message.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::System => "system",
            };
            messages.push(json!({ "role": role, "content": message.content }));
        }

        messages.push(json!({ "role": "user", "content": request.user_text }));
        messages
    }
}

#[async_trait]
impl PlanningOracle for OpenAiLikeOracle {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &OracleRequest) -> Result<OracleReply> {
        let body = json!({
            "model": self.settings.model,
            "temperature": TEMPERATURE,
            "response_format": { "type": "json_object" },
            "messages": self.build_messages(request),
        });

        let mut builder = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = self.settings.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to send request to the planning oracle")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(ERROR_BODY_MAX_CHARS).collect();
            bail!("planning oracle returned {status}: {snippet}");
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .context("Failed to decode chat completion")?;
        let reply = parse_completion(completion)?;
        debug!(
            model = %self.settings.model,
            actions = reply.actions.len(),
            "oracle replied"
        );
        Ok(reply)
    }
}

fn parse_completion(completion: ChatCompletion) -> Result<OracleReply> {
    let content = completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .context("chat completion carried no message content")?;
    let value: Value = serde_json::from_str(strip_code_fence(&content))
        .context("planning oracle reply is not valid JSON")?;
    if !value.is_object() {
        bail!("planning oracle reply is not a JSON object");
    }
    Ok(OracleReply::from_value(value))
}

/// Some servers wrap JSON mode output in a markdown fence anyway.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
