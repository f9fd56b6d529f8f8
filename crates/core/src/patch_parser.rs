//! Lenient unified-diff parser.
//!
//! Malformed fragments are not errors: a header that does not match simply
//! does not open a new file or hunk, so a broken diff degrades to fewer (or
//! zero) hunks rather than failing the request.

use once_cell::sync::Lazy;
use regex::Regex;

static HUNK_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@@\s+-(\d+)(?:,(\d+))?\s+\+(\d+)(?:,(\d+))?\s+@@").expect("valid hunk regex")
});

const DEV_NULL: &str = "/dev/null";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchLine {
    Context(String),
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<PatchLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// `None` when the old side is `/dev/null`.
    pub old_path: Option<String>,
    /// `None` when the new side is `/dev/null`.
    pub new_path: Option<String>,
    pub hunks: Vec<PatchHunk>,
}

impl FilePatch {
    /// The workspace path this patch targets.
    pub fn target_path(&self) -> Option<&str> {
        self.new_path.as_deref().or(self.old_path.as_deref())
    }

    pub fn is_new_file(&self) -> bool {
        self.old_path.is_none() && self.new_path.is_some()
    }

    pub fn is_deleted_file(&self) -> bool {
        self.new_path.is_none() && self.old_path.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPatch {
    pub files: Vec<FilePatch>,
}

impl ParsedPatch {
    pub fn from_diff(diff_content: &str) -> Self {
        let normalized = diff_content.replace("\r\n", "\n");
        let lines: Vec<&str> = normalized.split('\n').collect();
        let mut files = Vec::new();
        let mut current: Option<FilePatch> = None;
        let mut i = 0;

        while i < lines.len() {
            if is_file_header(&lines, i) {
                if let Some(done) = current.take() {
                    files.push(done);
                }
                current = Some(FilePatch {
                    old_path: header_path(&lines[i][4..], "a/"),
                    new_path: header_path(&lines[i + 1][4..], "b/"),
                    hunks: Vec::new(),
                });
                i += 2;
                continue;
            }

            if let Some(file) = current.as_mut() {
                if let Some((hunk, next_index)) = parse_hunk(&lines, i) {
                    file.hunks.push(hunk);
                    i = next_index;
                    continue;
                }
            }

            i += 1;
        }

        if let Some(done) = current {
            files.push(done);
        }

        ParsedPatch { files }
    }

    pub fn hunk_count(&self) -> usize {
        self.files.iter().map(|file| file.hunks.len()).sum()
    }
}

fn is_file_header(lines: &[&str], index: usize) -> bool {
    lines[index].starts_with("--- ")
        && lines
            .get(index + 1)
            .map(|next| next.starts_with("+++ "))
            .unwrap_or(false)
}

/// Strips the `a/` / `b/` prefix and any tab-separated timestamp.
fn header_path(raw: &str, prefix: &str) -> Option<String> {
    let path = raw.split('\t').next().unwrap_or("").trim();
    if path.is_empty() || path == DEV_NULL {
        return None;
    }
    let path = path.strip_prefix(prefix).unwrap_or(path);
    Some(path.to_string())
}

fn parse_hunk(lines: &[&str], start: usize) -> Option<(PatchHunk, usize)> {
    let caps = HUNK_HEADER.captures(lines[start])?;
    let number = |index: usize, default: usize| {
        caps.get(index)
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .unwrap_or(default)
    };

    let mut hunk = PatchHunk {
        old_start: number(1, 0),
        old_count: number(2, 1),
        new_start: number(3, 0),
        new_count: number(4, 1),
        lines: Vec::new(),
    };

    let mut i = start + 1;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("@@") || line.starts_with("diff --git") || is_file_header(lines, i) {
            break;
        }

        match line.chars().next() {
            Some(' ') => hunk.lines.push(PatchLine::Context(line[1..].to_string())),
            Some('+') => hunk.lines.push(PatchLine::Add(line[1..].to_string())),
            Some('-') => hunk.lines.push(PatchLine::Remove(line[1..].to_string())),
            // "\ No newline at end of file"
            Some('\\') => {}
            _ if line.trim().is_empty() && blank_run_continues_hunk(lines, i) => {
                hunk.lines.push(PatchLine::Context(String::new()));
            }
            _ => break,
        }
        i += 1;
    }

    Some((hunk, i))
}

/// A bare blank line is an unprefixed empty context line only when more hunk
/// body follows; trailing blank lines end the hunk.
fn blank_run_continues_hunk(lines: &[&str], from: usize) -> bool {
    lines[from..]
        .iter()
        .find(|line| !line.trim().is_empty())
        .map(|line| {
            matches!(line.chars().next(), Some(' ' | '+' | '-'))
                && !line.starts_with("+++ ")
                && !line.starts_with("--- ")
        })
        .unwrap_or(false)
}
