//! # Configuration
//!
//! Settings for the change-control plane and its HTTP binding.
//!
//! ## Configuration Loading
//!
//! Configuration is loaded from multiple sources in order of precedence:
//! 1. Environment variables (`VIBE_*`, plus `PORT`, `OPENAI_MODEL`, `OPENAI_BASE_URL`)
//! 2. Configuration files (`vibe.toml`, `.vibe/vibe.toml`)
//! 3. Built-in defaults
//!
//! Permissions may additionally be persisted per workspace in
//! `.vibe/config.json` as `{"perms": {"read": .., "write": .., "test": ..}}`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use vibe_common::Permissions;

pub const DEFAULT_STATE_DIR: &str = ".vibe";
pub const DEFAULT_KEEP_START: &str = "VIBE-KEEP START";
pub const DEFAULT_KEEP_END: &str = "VIBE-KEEP END";
const DEFAULT_BLOCKED_SEGMENTS: &[&str] = &[".git", "node_modules"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VibeConfig {
    pub workspace: WorkspaceSettings,
    pub limits: LimitsConfig,
    pub patch: PatchConfig,
    pub policy: PathPolicyConfig,
    pub git: GitConfig,
    pub permissions: Permissions,
    pub gateway: GatewayConfig,
    pub oracle: OracleConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    /// Explicit workspace root; discovered from `.git` when absent.
    pub root: Option<PathBuf>,
    /// Bookkeeping directory, relative to the root.
    pub state_dir: String,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            root: None,
            state_dir: DEFAULT_STATE_DIR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_write_bytes: usize,
    pub max_diff_bytes: usize,
    pub max_ops: usize,
    pub read_max_bytes: u64,
    /// Byte budget for each file read inside the gateway tool loop.
    pub observation_max_bytes: u64,
    pub search_max_file_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_write_bytes: 500_000,
            max_diff_bytes: 2_000_000,
            max_ops: 50,
            read_max_bytes: 100_000,
            observation_max_bytes: 60_000,
            search_max_file_bytes: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Default for the per-request keep-regions flag.
    pub keep_regions: bool,
    /// Fuzz window, in lines, around a hunk's declared start.
    pub fuzz_lines: usize,
    pub keep_start_marker: String,
    pub keep_end_marker: String,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            keep_regions: true,
            fuzz_lines: 3,
            keep_start_marker: DEFAULT_KEEP_START.to_string(),
            keep_end_marker: DEFAULT_KEEP_END.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathPolicyConfig {
    /// Path components that may never be written (`.git`, `node_modules`).
    pub blocked_segments: Vec<String>,
}

impl Default for PathPolicyConfig {
    fn default() -> Self {
        Self {
            blocked_segments: DEFAULT_BLOCKED_SEGMENTS
                .iter()
                .map(|segment| segment.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Enables the best-effort git side channel.
    pub integration: bool,
    pub branch_prefix: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            integration: false,
            branch_prefix: "vibe-run-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub max_observe_rounds: usize,
    pub max_validation_retries: usize,
    /// Number of history messages forwarded to the oracle.
    pub history_window: usize,
    pub debug_log_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_observe_rounds: 2,
            max_validation_retries: 1,
            history_window: 10,
            debug_log_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7080,
        }
    }
}

impl VibeConfig {
    /// Loads configuration from the given path, applying environment overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;

        let mut config: VibeConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path_ref.to_path_buf(),
                source,
            })?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from standard sources (path override, env, defaults).
    ///
    /// A config file that fails to load is logged and ignored.
    pub fn from_sources(path_override: Option<PathBuf>, search_root: Option<&Path>) -> Self {
        if let Some(path) = Self::discover_config_path(path_override, search_root) {
            match Self::load_from_path(&path) {
                Ok(config) => {
                    debug!(path = %path.display(), "loaded configuration");
                    return config;
                }
                Err(err) => warn!("{err}; falling back to defaults"),
            }
        }

        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn discover_config_path(
        path_override: Option<PathBuf>,
        search_root: Option<&Path>,
    ) -> Option<PathBuf> {
        if let Some(path) = path_override {
            return Some(path);
        }

        if let Ok(from_env) = env::var("VIBE_CONFIG") {
            let trimmed = from_env.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }

        let base = search_root
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let candidates = [
            base.join("vibe.toml"),
            base.join(DEFAULT_STATE_DIR).join("vibe.toml"),
        ];

        candidates.into_iter().find(|candidate| candidate.exists())
    }

    /// Applies environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_non_empty("VIBE_WORKSPACE") {
            self.workspace.root = Some(PathBuf::from(value));
        }

        if let Some(value) = env_non_empty("VIBE_STATE_DIR") {
            self.workspace.state_dir = value;
        }

        if let Some(parsed) = env_parse::<usize>("VIBE_MAX_WRITE_BYTES") {
            self.limits.max_write_bytes = parsed;
        }

        if let Some(parsed) = env_parse::<usize>("VIBE_MAX_OPS") {
            self.limits.max_ops = parsed;
        }

        if let Some(flag) = env_bool("VIBE_KEEP_REGIONS") {
            self.patch.keep_regions = flag;
        }

        if let Some(flag) = env_bool("VIBE_GIT_INTEGRATION") {
            self.git.integration = flag;
        }

        if let Some(value) = env_non_empty("VIBE_PERMS") {
            self.permissions = parse_permission_list(&value);
        }

        if let Some(parsed) = env_parse::<usize>("VIBE_DEBUG_LOG_LIMIT") {
            self.gateway.debug_log_limit = parsed.max(5);
        }

        if let Some(value) = env_non_empty("OPENAI_MODEL") {
            self.oracle.model = value;
        }

        if let Some(value) = env_non_empty("OPENAI_BASE_URL") {
            self.oracle.base_url = value.trim_end_matches('/').to_string();
        }

        if let Some(value) = env_non_empty("VIBE_HOST") {
            self.server.host = value;
        }

        if let Some(parsed) = env_parse::<u16>("PORT") {
            self.server.port = parsed;
        }
    }

    /// Resolves the workspace root: explicit override, configured root, the
    /// nearest ancestor holding `.git`, then the current directory.
    pub fn resolve_workspace_root(&self, cli_override: Option<PathBuf>) -> AnyhowResult<PathBuf> {
        if let Some(root) = cli_override.or_else(|| self.workspace.root.clone()) {
            return root
                .canonicalize()
                .with_context(|| format!("workspace root {} is not accessible", root.display()));
        }

        let cwd = env::current_dir().context("Unable to determine current directory")?;
        let discovered = cwd
            .ancestors()
            .find(|dir| dir.join(".git").is_dir())
            .map(Path::to_path_buf)
            .unwrap_or(cwd);
        discovered
            .canonicalize()
            .with_context(|| format!("workspace root {} is not accessible", discovered.display()))
    }

    /// Overlays permissions persisted in `<root>/<state_dir>/config.json`.
    pub fn overlay_persisted_permissions(&mut self, root: &Path) {
        let path = root.join(&self.workspace.state_dir).join("config.json");
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let parsed: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path.display(), "ignoring unreadable permissions file: {err}");
                return;
            }
        };
        if let Some(perms) = parsed.get("perms") {
            if let Some(flag) = perms.get("read").and_then(Value::as_bool) {
                self.permissions.read = flag;
            }
            if let Some(flag) = perms.get("write").and_then(Value::as_bool) {
                self.permissions.write = flag;
            }
            if let Some(flag) = perms.get("test").and_then(Value::as_bool) {
                self.permissions.test = flag;
            }
        }
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_non_empty(name)?.parse::<T>().ok()
}

fn env_bool(name: &str) -> Option<bool> {
    match env_non_empty(name)?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses `read,write` / `all` / `none` into a permission set.
fn parse_permission_list(value: &str) -> Permissions {
    let mut perms = Permissions::default();
    for token in value.split(',').map(|t| t.trim().to_ascii_lowercase()) {
        match token.as_str() {
            "all" => perms = Permissions::all(),
            "read" => perms.read = true,
            "write" => perms.write = true,
            "test" => perms.test = true,
            _ => {}
        }
    }
    perms
}
