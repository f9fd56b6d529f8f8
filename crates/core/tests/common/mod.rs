//! # Test fixtures
//!
//! Seeded workspaces, a scripted planning oracle, and an in-memory VCS
//! channel.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use vibe_common::{OracleReply, OracleRequest, PlanningOracle};
use vibe_core::{ChangeControl, VcsChannel, VibeConfig};

pub const README: &str = "# Demo\n\nA small project.\n";
pub const MAIN_JS: &str = "function main() {\n  const a = 1;\n  return a;\n}\n";

/// Temp workspace with a README and `src/main.js`.
pub fn seeded_workspace() -> TempDir {
    let dir = tempfile::tempdir().expect("unable to create test workspace");
    fs::write(dir.path().join("README.md"), README).expect("unable to seed README.md");
    fs::create_dir_all(dir.path().join("src")).expect("unable to create src");
    fs::write(dir.path().join("src/main.js"), MAIN_JS).expect("unable to seed src/main.js");
    dir
}

pub fn open_control(root: &Path) -> Arc<ChangeControl> {
    Arc::new(ChangeControl::open(root, VibeConfig::default()).expect("open change control"))
}

pub fn read(root: &Path, rel: &str) -> String {
    fs::read_to_string(root.join(rel)).expect("read fixture file")
}

/// Replays canned replies in order and records every request it saw.
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Result<OracleReply>>>,
    seen: Mutex<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(|v| Ok(OracleReply::from_value(v))).collect()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::from([Err(anyhow!("connection refused"))])),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlanningOracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &OracleRequest) -> Result<OracleReply> {
        self.seen.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("script exhausted")))
    }
}

/// Records commits and reverts instead of shelling out to git.
#[derive(Default)]
pub struct FakeVcs {
    pub commits: Mutex<Vec<(Vec<String>, String)>>,
    pub reverted: Mutex<Vec<String>>,
    pub fail_revert: bool,
}

impl VcsChannel for FakeVcs {
    fn is_available(&self) -> bool {
        true
    }

    fn current_branch(&self) -> Option<String> {
        Some("vibe-run-test".to_string())
    }

    fn ensure_branch(&self) -> Result<String> {
        Ok("vibe-run-test".to_string())
    }

    fn commit(&self, paths: &[String], message: &str) -> Result<String> {
        let mut commits = self.commits.lock().unwrap();
        commits.push((paths.to_vec(), message.to_string()));
        Ok(format!("abc{:04}", commits.len()))
    }

    fn revert_commit(&self, hash: &str) -> Result<()> {
        if self.fail_revert {
            return Err(anyhow!("revert conflict"));
        }
        self.reverted.lock().unwrap().push(hash.to_string());
        Ok(())
    }
}
