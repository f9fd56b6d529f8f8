use serde::{Deserialize, Serialize};

/// Non-fatal conditions reported alongside a best-effort result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    FuzzyOffset,
    OutOfOrder,
    ContextMismatch,
    DeleteMismatch,
    KeepRegion,
    InvalidPath,
    PathBlocked,
    BinaryContent,
    WriteFailed,
    Diverged,
    SnapshotFailed,
    EventLogFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub path: String,
    pub kind: WarningKind,
    /// Zero-based hunk index, for diff application warnings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hunk: Option<usize>,
    pub note: String,
}

impl Warning {
    pub fn new(path: impl Into<String>, kind: WarningKind, note: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            hunk: None,
            note: note.into(),
        }
    }

    pub fn for_hunk(
        path: impl Into<String>,
        hunk: usize,
        kind: WarningKind,
        note: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            kind,
            hunk: Some(hunk),
            note: note.into(),
        }
    }
}
