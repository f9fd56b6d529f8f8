//! Optional version-control side channel.
//!
//! Nothing in the change-control plane depends on these calls succeeding;
//! callers log failures and carry on with file-level behaviour.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::config::GitConfig;

pub trait VcsChannel: Send + Sync {
    /// Whether the channel should be used at all.
    fn is_available(&self) -> bool;

    fn current_branch(&self) -> Option<String>;

    /// Switches to this process's run branch, creating it on first use.
    fn ensure_branch(&self) -> Result<String>;

    /// Stages `paths` and commits them. Returns the new commit hash.
    fn commit(&self, paths: &[String], message: &str) -> Result<String>;

    fn revert_commit(&self, hash: &str) -> Result<()>;
}

/// Drives the `git` executable in the workspace root.
pub struct GitCli {
    root: PathBuf,
    enabled: bool,
    branch_prefix: String,
    run_branch: Mutex<Option<String>>,
}

impl GitCli {
    pub fn new(root: &Path, config: &GitConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            enabled: config.integration,
            branch_prefix: config.branch_prefix.clone(),
            run_branch: Mutex::new(None),
        }
    }

    fn is_repo(&self) -> bool {
        self.root.join(".git").is_dir()
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        debug!(?args, "running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl VcsChannel for GitCli {
    fn is_available(&self) -> bool {
        self.enabled && self.is_repo()
    }

    fn current_branch(&self) -> Option<String> {
        if !self.is_repo() {
            return None;
        }
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .ok()
            .filter(|branch| !branch.is_empty())
    }

    fn ensure_branch(&self) -> Result<String> {
        let mut slot = self
            .run_branch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        let name = format!("{}{}", self.branch_prefix, Utc::now().timestamp_millis());
        self.git(&["checkout", "-b", &name])?;
        info!(branch = %name, "created run branch");
        *slot = Some(name.clone());
        Ok(name)
    }

    fn commit(&self, paths: &[String], message: &str) -> Result<String> {
        if paths.is_empty() {
            bail!("nothing to commit");
        }
        let mut add: Vec<&str> = vec!["add", "-A", "--"];
        add.extend(paths.iter().map(String::as_str));
        self.git(&add)?;
        self.git(&["commit", "-m", message])?;
        self.git(&["rev-parse", "--short", "HEAD"])
    }

    fn revert_commit(&self, hash: &str) -> Result<()> {
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("refusing to revert malformed commit hash {hash:?}");
        }
        self.git(&["revert", "--no-edit", hash])?;
        info!(commit = hash, "reverted commit");
        Ok(())
    }
}
