// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod fs;
pub mod limits;
pub mod oracle;

use serde::{Deserialize, Serialize};

pub use oracle::{OracleReply, OracleRequest, PlanningOracle};

/// Capabilities a caller may grant to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Test,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Test => "test",
        }
    }
}

/// Capability set granted by the caller (`{read, write, test}`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub test: bool,
}

impl Permissions {
    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
            test: true,
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::Read => self.read,
            Capability::Write => self.write,
            Capability::Test => self.test,
        }
    }

    /// Returns the capabilities from `required` that are not granted, deduplicated
    /// and in request order.
    pub fn missing<I>(&self, required: I) -> Vec<Capability>
    where
        I: IntoIterator<Item = Capability>,
    {
        let mut missing = Vec::new();
        for capability in required {
            if !self.allows(capability) && !missing.contains(&capability) {
                missing.push(capability);
            }
        }
        missing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// One entry of the conversation history forwarded to the planning oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_capabilities_are_deduplicated() {
        let perms = Permissions {
            read: true,
            write: false,
            test: false,
        };
        let missing = perms.missing([
            Capability::Write,
            Capability::Read,
            Capability::Write,
            Capability::Test,
        ]);
        assert_eq!(missing, vec![Capability::Write, Capability::Test]);
    }

    #[test]
    fn permissions_deserialize_with_defaults() {
        let perms: Permissions = serde_json::from_str(r#"{"write": true}"#).unwrap();
        assert!(!perms.read);
        assert!(perms.write);
        assert!(!perms.test);
    }
}
