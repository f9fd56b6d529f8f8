//! One agent turn: ask the oracle, validate, observe, re-ask, gate.
//!
//! The turn is a small state machine. Every edge back to the oracle is
//! bounded by a counter or a one-shot flag, so a turn makes at most
//! `1 + max_validation_retries + max_observe_rounds + 2` oracle calls.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use vibe_common::{ChatMessage, ChatRole, OracleReply, OracleRequest, Permissions, PlanningOracle};

use super::action::{validate_all, Action};
use super::debug::DebugLog;
use super::plan::{fallback_plan, group_writes};
use crate::config::GatewayConfig;
use crate::engine::ChangeControl;
use crate::errors::VibeError;
use crate::events::EventKind;
use crate::workspace::EntryKind;

const SUMMARY_MAX_ENTRIES: usize = 200;
const MAX_OBSERVED_PATHS: usize = 50;
const FALLBACK_PROVIDER: &str = "fallback";
const PERMISSION_REQUIRED: &str = "PERMISSION_REQUIRED";

/// Client-reported state that steers the oracle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientState {
    pub pending_count: usize,
    pub active_dir: Option<String>,
    pub autopilot: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub text: String,
    pub history: Vec<ChatMessage>,
    pub client: ClientState,
    pub permissions: Permissions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentTurn {
    pub provider: String,
    pub message: String,
    pub actions: Vec<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Retry {
    Validation(Vec<String>),
    ReadBeforeWrite,
    Degenerate,
}

impl Retry {
    fn instruction(&self) -> String {
        match self {
            Retry::Validation(errors) => format!(
                "Your previous actions failed validation. Return corrected JSON with valid actions only. Errors: {}",
                errors.join("; ")
            ),
            Retry::ReadBeforeWrite => "Inspect the workspace before writing: return LIST_TREE or READ_FILE \
                 (for example README.md) first, then base your changes on the existing content."
                .to_string(),
            Retry::Degenerate => "Your previous reply contained no valid actions. Always return at least one action. \
                 If there are no pending tasks, do NOT return PROCEED_EXECUTION; choose REPLAN or \
                 UPDATE_FILE/CREATE_FILE/ASK_INPUT."
                .to_string(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Retry::Validation(_) => "validation",
            Retry::ReadBeforeWrite => "read_before_write",
            Retry::Degenerate => "degenerate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Validating,
    Observing,
    Retrying(Retry),
    Resolved,
}

/// Mutable bookkeeping for one turn.
#[derive(Debug, Default)]
struct TurnState {
    message: String,
    raw_actions: Vec<Value>,
    actions: Vec<Action>,
    observations: String,
    oracle_calls: usize,
    validation_retries: usize,
    observe_rounds: usize,
    observed: bool,
    read_before_write_asked: bool,
    degenerate_asked: bool,
}

impl TurnState {
    fn take_reply(&mut self, reply: OracleReply) {
        self.oracle_calls += 1;
        self.message = reply.message;
        self.raw_actions = reply.actions;
    }
}

pub struct ActionGateway {
    oracle: Arc<dyn PlanningOracle>,
    control: Arc<ChangeControl>,
    settings: GatewayConfig,
    observation_max_bytes: u64,
    debug: Arc<DebugLog>,
}

impl ActionGateway {
    pub fn new(oracle: Arc<dyn PlanningOracle>, control: Arc<ChangeControl>) -> Self {
        let settings = control.config().gateway.clone();
        let observation_max_bytes = control.config().limits.observation_max_bytes;
        let debug = Arc::new(DebugLog::new(settings.debug_log_limit));
        Self {
            oracle,
            control,
            settings,
            observation_max_bytes,
            debug,
        }
    }

    pub fn debug_log(&self) -> &DebugLog {
        &self.debug
    }

    pub fn provider(&self) -> &str {
        self.oracle.name()
    }

    pub async fn resolve(&self, request: TurnRequest) -> AgentTurn {
        self.debug.push(
            "chat_in",
            json!({
                "text": request.text,
                "history": request.history.len(),
                "client": request.client,
            }),
        );
        let guidance = self.system_guidance(&request);

        let mut state = TurnState::default();
        match self.ask(&request, guidance.clone(), false).await {
            Ok(reply) => state.take_reply(reply),
            Err(err) => {
                warn!("oracle unavailable, using fallback: {err:#}");
                return self.fallback(&request, err.to_string());
            }
        }

        let mut phase = Phase::Validating;
        loop {
            phase = match phase {
                Phase::Validating => self.validate(&mut state, &request),
                Phase::Observing => {
                    self.observe(&mut state);
                    let extra = format!(
                        "{guidance}\n{}\nUse these observations to produce concrete actions.",
                        state.observations
                    );
                    self.reask(&mut state, &request, extra).await
                }
                Phase::Retrying(reason) => {
                    debug!(reason = reason.label(), "re-asking oracle");
                    let extra = format!("{guidance}\n{}\n{}", state.observations, reason.instruction());
                    self.reask(&mut state, &request, extra).await
                }
                Phase::Resolved => break,
            };
        }

        self.finish(&request, state)
    }

    fn validate(&self, state: &mut TurnState, request: &TurnRequest) -> Phase {
        let (actions, errors) = validate_all(&state.raw_actions);
        state.actions = actions;

        if !errors.is_empty() {
            debug!(errors = errors.len(), "oracle actions failed validation");
            if state.validation_retries < self.settings.max_validation_retries {
                state.validation_retries += 1;
                return Phase::Retrying(Retry::Validation(errors));
            }
        }

        let can_read = request.permissions.read;
        if can_read
            && state.observe_rounds < self.settings.max_observe_rounds
            && state.actions.iter().any(Action::is_observation)
        {
            return Phase::Observing;
        }

        if can_read
            && !state.observed
            && !state.read_before_write_asked
            && state.actions.iter().any(Action::is_write)
        {
            state.read_before_write_asked = true;
            return Phase::Retrying(Retry::ReadBeforeWrite);
        }

        if !state.degenerate_asked && is_degenerate(&state.actions, request.client.pending_count) {
            state.degenerate_asked = true;
            return Phase::Retrying(Retry::Degenerate);
        }

        Phase::Resolved
    }

    /// A failed re-ask keeps what the previous round validated.
    async fn reask(&self, state: &mut TurnState, request: &TurnRequest, extra: String) -> Phase {
        match self.ask(request, extra, true).await {
            Ok(reply) => {
                state.take_reply(reply);
                Phase::Validating
            }
            Err(err) => {
                warn!("oracle re-ask failed: {err:#}");
                self.debug.push("oracle_error", json!({ "error": err.to_string() }));
                Phase::Resolved
            }
        }
    }

    async fn ask(
        &self,
        request: &TurnRequest,
        extra_system: String,
        force_actions: bool,
    ) -> anyhow::Result<OracleReply> {
        let window = self.settings.history_window;
        let skip = request.history.len().saturating_sub(window);
        let oracle_request = OracleRequest {
            repo_summary: self.control.workspace().summary(SUMMARY_MAX_ENTRIES),
            history: request.history[skip..].to_vec(),
            user_text: request.text.clone(),
            extra_system: Some(extra_system),
            force_actions,
        };
        self.oracle.complete(&oracle_request).await
    }

    fn system_guidance(&self, request: &TurnRequest) -> String {
        let client = &request.client;
        let mut lines = vec![
            format!("Observation: pending_task_count={}", client.pending_count),
            format!(
                "Observation: autopilot={}",
                if client.autopilot { "on" } else { "off" }
            ),
        ];
        if let Some(dir) = client.active_dir.as_deref().filter(|d| !d.trim().is_empty()) {
            lines.push(format!("Observation: active_dir={dir}"));
        }
        lines.push("Policy: Always return at least one action in the actions array.".to_string());
        lines.push(
            "Policy: If pending_task_count==0, do NOT return PROCEED_EXECUTION; propose REPLAN or concrete file actions."
                .to_string(),
        );
        lines.push(
            "Policy: To change an existing file use UPDATE_FILE with { path, content } holding the full new content."
                .to_string(),
        );
        lines.push(self.control.memory_summary());
        lines.join("\n")
    }

    /// Runs this round's read, tree and search actions and appends their
    /// results to the observation transcript.
    fn observe(&self, state: &mut TurnState) {
        state.observe_rounds += 1;
        state.observed = true;

        let mut read_paths: Vec<String> = Vec::new();
        for action in &state.actions {
            match action {
                Action::ReadFile { path, paths } => {
                    for p in path.iter().chain(paths.iter()) {
                        let p = p.trim();
                        if !p.is_empty() && !read_paths.iter().any(|seen| seen == p) {
                            read_paths.push(p.to_string());
                        }
                    }
                }
                Action::ListTree { path, depth } => {
                    let text = self.observe_tree(path.as_deref(), *depth);
                    state.observations.push_str(&text);
                }
                Action::Search { query, path, ext } => {
                    let text = self.observe_search(query, path.as_deref(), ext.as_deref());
                    state.observations.push_str(&text);
                }
                _ => {}
            }
        }

        for path in read_paths.iter().take(MAX_OBSERVED_PATHS) {
            let text = self.observe_file(path);
            state.observations.push_str(&text);
        }
        debug!(
            round = state.observe_rounds,
            files = read_paths.len().min(MAX_OBSERVED_PATHS),
            "executed observation round"
        );
    }

    fn observe_file(&self, path: &str) -> String {
        match self.control.read_file(path, 0, Some(self.observation_max_bytes)) {
            Ok(read) => format!(
                "\nObservation: FILE {} (size={})\n{}\n---",
                read.path, read.size, read.content
            ),
            Err(VibeError::NotFound { .. }) => format!("\nObservation: READ_FILE {path} → not found"),
            Err(err) => format!("\nObservation: READ_FILE error for {path}: {err}"),
        }
    }

    fn observe_tree(&self, path: Option<&str>, depth: Option<u64>) -> String {
        let label = path.unwrap_or(".");
        match self.control.tree(path, depth) {
            Ok(entries) => {
                let lines: Vec<String> = entries
                    .iter()
                    .map(|e| match (e.kind, e.size) {
                        (EntryKind::Dir, _) => format!("dir {}/", e.path),
                        (EntryKind::File, Some(size)) => format!("file {} ({size})", e.path),
                        (EntryKind::File, None) => format!("file {}", e.path),
                    })
                    .collect();
                format!(
                    "\nObservation: TREE {label} ({} entries)\n{}\n---",
                    entries.len(),
                    lines.join("\n")
                )
            }
            Err(err) => format!("\nObservation: LIST_TREE error for {label}: {err}"),
        }
    }

    fn observe_search(&self, query: &str, path: Option<&str>, ext: Option<&str>) -> String {
        match self.control.search(query, path, None, ext) {
            Ok(matches) => {
                let lines: Vec<String> = matches
                    .iter()
                    .map(|m| format!("{}:{}: {}", m.path, m.line, m.text))
                    .collect();
                format!(
                    "\nObservation: SEARCH \"{query}\" → {} match(es)\n{}\n---",
                    matches.len(),
                    lines.join("\n")
                )
            }
            Err(err) => format!("\nObservation: SEARCH error for \"{query}\": {err}"),
        }
    }

    fn finish(&self, request: &TurnRequest, state: TurnState) -> AgentTurn {
        let mut message = state.message;
        let required = state.actions.iter().filter_map(Action::required_capability);
        let missing = request.permissions.missing(required);

        let actions = if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|c| c.as_str()).collect();
            info!(missing = ?names, "agent turn halted on permissions");
            if message.is_empty() {
                message = format!("Permission required: {}", names.join(", "));
            }
            vec![Action::HaltExecution {
                reason: PERMISSION_REQUIRED.to_string(),
                missing,
            }]
        } else {
            match group_writes(&state.actions, &turn_goal(request)) {
                Some(plan) => vec![Action::EmitPlan { plan }, Action::ProceedExecution],
                None => state.actions,
            }
        };

        let types: Vec<&str> = actions.iter().map(Action::type_name).collect();
        if let Err(err) = self
            .control
            .append_event(EventKind::Chat, json!({ "text": request.text, "actions": types }))
        {
            warn!("failed to record chat event: {err}");
        }
        self.debug.push(
            "chat_out",
            json!({
                "provider": self.oracle.name(),
                "oracleCalls": state.oracle_calls,
                "observeRounds": state.observe_rounds,
                "actions": types,
            }),
        );
        info!(
            provider = self.oracle.name(),
            oracle_calls = state.oracle_calls,
            actions = actions.len(),
            "agent turn resolved"
        );

        AgentTurn {
            provider: self.oracle.name().to_string(),
            message,
            actions,
            error: None,
        }
    }

    fn fallback(&self, request: &TurnRequest, error: String) -> AgentTurn {
        self.debug.push("oracle_error", json!({ "error": error }));
        let turn = if is_ambiguous(request) {
            AgentTurn {
                provider: FALLBACK_PROVIDER.to_string(),
                message: "What would you like to build or change in this repo?".to_string(),
                actions: Vec::new(),
                error: Some(error),
            }
        } else {
            AgentTurn {
                provider: FALLBACK_PROVIDER.to_string(),
                message: "Here is a proposed plan. Shall I proceed?".to_string(),
                actions: vec![Action::EmitPlan {
                    plan: fallback_plan(&turn_goal(request)),
                }],
                error: Some(error),
            }
        };
        self.debug.push("chat_out", json!({ "provider": FALLBACK_PROVIDER }));
        turn
    }
}

/// No actions at all, or only "proceed" while nothing is pending.
fn is_degenerate(actions: &[Action], pending_count: usize) -> bool {
    actions.is_empty()
        || (pending_count == 0 && actions.iter().all(|a| *a == Action::ProceedExecution))
}

fn last_substantive_user_message(history: &[ChatMessage]) -> Option<&str> {
    history
        .iter()
        .rev()
        .filter(|m| m.role == ChatRole::User)
        .map(|m| m.content.trim())
        .find(|c| c.chars().count() > 4)
}

fn turn_goal(request: &TurnRequest) -> String {
    last_substantive_user_message(&request.history)
        .unwrap_or(request.text.trim())
        .to_string()
}

fn is_ambiguous(request: &TurnRequest) -> bool {
    let text = request.text.trim().to_lowercase();
    matches!(text.as_str(), "go" | "start" | "run" | "proceed")
        || (text.chars().count() < 4 && last_substantive_user_message(&request.history).is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_replies() {
        assert!(is_degenerate(&[], 3));
        assert!(is_degenerate(&[Action::ProceedExecution], 0));
        assert!(!is_degenerate(&[Action::ProceedExecution], 2));
        assert!(!is_degenerate(
            &[Action::ProceedExecution, Action::CreateDir { path: "x".into() }],
            0
        ));
    }

    #[test]
    fn ambiguity_considers_history() {
        let mut request = TurnRequest {
            text: "ok".into(),
            ..TurnRequest::default()
        };
        assert!(is_ambiguous(&request));

        request.history = vec![ChatMessage::user("add a login page")];
        assert!(!is_ambiguous(&request));
        assert_eq!(turn_goal(&request), "add a login page");

        request.text = "Proceed".into();
        assert!(is_ambiguous(&request));
    }

    #[test]
    fn retry_instructions_name_the_constraint() {
        let text = Retry::Validation(vec!["a".into(), "b".into()]).instruction();
        assert!(text.ends_with("Errors: a; b"));
        assert!(Retry::Degenerate.instruction().contains("do NOT return PROCEED_EXECUTION"));
        assert!(Retry::ReadBeforeWrite.instruction().contains("README.md"));
    }
}
