use serde::{Deserialize, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Unchanged,
}

impl ChangeType {
    pub fn classify(before: Option<&[u8]>, after: Option<&[u8]>) -> Self {
        match (before, after) {
            (None, Some(_)) => ChangeType::Added,
            (Some(_), None) => ChangeType::Deleted,
            (Some(b), Some(a)) if b != a => ChangeType::Modified,
            _ => ChangeType::Unchanged,
        }
    }
}

/// One file's before/after state inside a changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub path: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub diff: String,
    #[serde(
        rename = "beforeContent",
        serialize_with = "serialize_text",
        skip_serializing_if = "is_not_text"
    )]
    pub before: Option<Vec<u8>>,
    #[serde(
        rename = "afterContent",
        serialize_with = "serialize_text",
        skip_serializing_if = "is_not_text"
    )]
    pub after: Option<Vec<u8>>,
    #[serde(rename = "appliedHunks", skip_serializing_if = "Option::is_none")]
    pub applied_hunks: Option<usize>,
    #[serde(rename = "skippedHunks", skip_serializing_if = "Option::is_none")]
    pub skipped_hunks: Option<usize>,
}

impl FileChange {
    pub fn new(
        path: impl Into<String>,
        before: Option<Vec<u8>>,
        after: Option<Vec<u8>>,
        diff: String,
    ) -> Self {
        Self {
            path: path.into(),
            change_type: ChangeType::classify(before.as_deref(), after.as_deref()),
            diff,
            before,
            after,
            applied_hunks: None,
            skipped_hunks: None,
        }
    }

    pub fn with_hunk_counts(mut self, applied: usize, skipped: usize) -> Self {
        self.applied_hunks = Some(applied);
        self.skipped_hunks = Some(skipped);
        self
    }

    pub fn is_unchanged(&self) -> bool {
        self.change_type == ChangeType::Unchanged
    }
}

/// Absent sides and binary content are left out of the JSON.
fn is_not_text(content: &Option<Vec<u8>>) -> bool {
    content
        .as_deref()
        .map_or(true, |bytes| std::str::from_utf8(bytes).is_err())
}

fn serialize_text<S: Serializer>(content: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    match content.as_deref().and_then(|bytes| std::str::from_utf8(bytes).ok()) {
        Some(text) => serializer.serialize_str(text),
        None => serializer.serialize_none(),
    }
}

/// Concatenates per-file diffs, one per line block.
pub fn combined_diff(changes: &[FileChange]) -> String {
    changes
        .iter()
        .map(|change| format!("{}\n", change.diff))
        .collect()
}
