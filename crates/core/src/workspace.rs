//! Workspace access: path resolution, write policy, and the bounded read
//! operations (tree, file, search) shared by callers and the gateway tool loop.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use vibe_common::fs::{SafeFileWriter, WriteMode};
use walkdir::WalkDir;

use crate::config::VibeConfig;
use crate::errors::{VibeError, VibeResult};

const MAX_PATH_LEN: usize = 4096;
const SEARCH_LINE_MAX_CHARS: usize = 300;
const IGNORED_NAMES: &[&str] = &[
    ".git",
    "node_modules",
    ".next",
    "dist",
    "build",
    "coverage",
    ".cache",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRead {
    pub path: String,
    /// Full size of the file on disk.
    pub size: u64,
    pub offset: u64,
    pub content: String,
    /// Bytes past the returned window; 0 when the read reached end of file.
    pub truncated_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub path: String,
    pub line: usize,
    pub text: String,
}

/// A canonical workspace root plus the policies that guard it.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    state_dir_name: String,
    blocked_segments: Vec<String>,
    search_max_file_bytes: u64,
    writer: SafeFileWriter,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, config: &VibeConfig) -> VibeResult<Self> {
        let root = root.into();
        let canonical_root = root
            .canonicalize()
            .map_err(|err| VibeError::io(Some(root.clone()), "canonicalize workspace root", err))?;

        let writer = SafeFileWriter::new(canonical_root.clone())
            .with_max_size(Some(config.limits.max_write_bytes));

        Ok(Self {
            root: canonical_root,
            state_dir_name: config.workspace.state_dir.clone(),
            blocked_segments: config.policy.blocked_segments.clone(),
            search_max_file_bytes: config.limits.search_max_file_bytes,
            writer,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the bookkeeping directory (`<root>/.vibe`).
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(&self.state_dir_name)
    }

    pub fn max_write_bytes(&self) -> Option<usize> {
        self.writer.max_file_size()
    }

    /// Normalises a caller-supplied relative path to `a/b/c` form.
    ///
    /// Leading slashes are stripped; `.` segments are dropped; `..`, NUL bytes
    /// and oversized paths are rejected.
    pub fn normalize_relative(&self, raw: &str) -> VibeResult<String> {
        let trimmed = raw.trim();
        if trimmed.contains('\0') {
            return Err(VibeError::protected(raw, "null_byte", "resolve"));
        }
        if trimmed.len() > MAX_PATH_LEN {
            let head: String = trimmed.chars().take(64).collect();
            return Err(VibeError::protected(head, "path_length_limit", "resolve"));
        }

        let unified = trimmed.replace('\\', "/");
        let mut segments = Vec::new();
        for segment in unified.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(VibeError::protected(raw, "no_path_traversal", "resolve")),
                other => segments.push(other),
            }
        }

        if segments.is_empty() {
            return Err(VibeError::validation("path", "path is empty"));
        }
        Ok(segments.join("/"))
    }

    /// Resolves a relative path to an absolute path inside the root.
    ///
    /// Existing paths are canonicalised so symlinks cannot escape the root.
    pub fn resolve(&self, raw: &str) -> VibeResult<PathBuf> {
        let rel = self.normalize_relative(raw)?;
        let joined = self.root.join(&rel);

        let resolved = if joined.exists() {
            joined
                .canonicalize()
                .map_err(|err| VibeError::io(Some(joined.clone()), "canonicalize path", err))?
        } else {
            self.manual_resolve(Path::new(&rel))?
        };

        if !resolved.starts_with(&self.root) {
            return Err(VibeError::protected(
                rel,
                "path_security_repo_boundary",
                "resolve",
            ));
        }
        Ok(resolved)
    }

    fn manual_resolve(&self, target: &Path) -> VibeResult<PathBuf> {
        let mut resolved = self.root.clone();
        for component in target.components() {
            match component {
                Component::Normal(name) => resolved.push(name),
                Component::ParentDir => {
                    if !resolved.pop() || !resolved.starts_with(&self.root) {
                        return Err(VibeError::protected(
                            target,
                            "path_resolution_escape",
                            "resolve",
                        ));
                    }
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        Ok(resolved)
    }

    /// Write policy: blocked segments and the state directory are off limits.
    pub fn check_writable(&self, rel: &str) -> VibeResult<()> {
        let rel = self.normalize_relative(rel)?;
        for (index, segment) in rel.split('/').enumerate() {
            if self.blocked_segments.iter().any(|blocked| blocked == segment) {
                return Err(VibeError::protected(
                    rel.as_str(),
                    format!("blocked_segment:{segment}"),
                    "write",
                ));
            }
            if index == 0 && segment == self.state_dir_name {
                return Err(VibeError::protected(rel.as_str(), "state_dir", "write"));
            }
        }
        Ok(())
    }

    pub fn relative(&self, absolute: &Path) -> String {
        let stripped = absolute.strip_prefix(&self.root).unwrap_or(absolute);
        stripped
            .components()
            .filter_map(|component| match component {
                Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Reads raw bytes; `None` when the file does not exist.
    pub fn read_bytes(&self, rel: &str) -> VibeResult<Option<Vec<u8>>> {
        let path = self.resolve(rel)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(VibeError::io(Some(path), "read file", err)),
        }
    }

    /// Reads UTF-8 text; `None` when the file does not exist.
    pub fn read_text(&self, rel: &str) -> VibeResult<Option<String>> {
        match self.read_bytes(rel)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| VibeError::validation(rel, "binary content not supported")),
            None => Ok(None),
        }
    }

    /// Atomic write, subject to the write policy and size cap.
    pub fn write(&self, rel: &str, content: &[u8]) -> VibeResult<()> {
        self.check_writable(rel)?;
        if let Some(limit) = self.writer.max_file_size() {
            if content.len() > limit {
                return Err(VibeError::ResourceLimit {
                    resource_type: "file content".to_string(),
                    current_usage: content.len() as u64,
                    limit: limit as u64,
                    unit: "bytes".to_string(),
                });
            }
        }
        let path = self.resolve(rel)?;
        self.writer.write(&path, content, WriteMode::Atomic)?;
        debug!(path = rel, bytes = content.len(), "wrote file");
        Ok(())
    }

    /// Removes a file and prunes directories it leaves empty, up to the root.
    pub fn remove(&self, rel: &str) -> VibeResult<bool> {
        self.check_writable(rel)?;
        let path = self.resolve(rel)?;
        let existed = self.writer.remove(&path)?;

        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            let is_empty = fs::read_dir(&current)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if !is_empty {
                break;
            }
            if let Err(err) = fs::remove_dir(&current) {
                warn!(dir = %current.display(), "failed to prune empty directory: {err}");
                break;
            }
            dir = current.parent().map(Path::to_path_buf);
        }
        Ok(existed)
    }

    pub fn create_dir(&self, rel: &str) -> VibeResult<()> {
        self.check_writable(rel)?;
        let path = self.resolve(rel)?;
        fs::create_dir_all(&path).map_err(|err| VibeError::io(Some(path), "create directory", err))
    }

    fn is_ignored(&self, name: &str) -> bool {
        IGNORED_NAMES.contains(&name) || name == self.state_dir_name
    }

    fn start_dir(&self, rel: Option<&str>) -> VibeResult<PathBuf> {
        match rel.map(str::trim).filter(|r| !r.is_empty() && *r != "." && *r != "/") {
            Some(rel) => {
                let path = self.resolve(rel)?;
                if !path.is_dir() {
                    return Err(VibeError::not_found("directory", rel));
                }
                Ok(path)
            }
            None => Ok(self.root.clone()),
        }
    }

    /// Lists entries below `rel` (the root when `None`). Depth 0 lists only
    /// the direct children.
    pub fn tree(&self, rel: Option<&str>, depth: usize) -> VibeResult<Vec<TreeEntry>> {
        let start = self.start_dir(rel)?;
        let mut entries = Vec::new();

        let walker = WalkDir::new(&start)
            .min_depth(1)
            .max_depth(depth + 1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_ignored(&entry.file_name().to_string_lossy()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!("skipping unreadable tree entry: {err}");
                    continue;
                }
            };
            let path = self.relative(entry.path());
            let file_type = entry.file_type();
            if file_type.is_dir() {
                entries.push(TreeEntry {
                    kind: EntryKind::Dir,
                    path,
                    size: None,
                });
            } else if file_type.is_file() {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                entries.push(TreeEntry {
                    kind: EntryKind::File,
                    path,
                    size: Some(size),
                });
            }
        }

        Ok(entries)
    }

    /// Byte-range read. Content past `max_bytes` is cut and flagged with a
    /// `/* truncated N bytes */` trailer.
    pub fn read_file(&self, rel: &str, offset: u64, max_bytes: u64) -> VibeResult<FileRead> {
        let path = self.resolve(rel)?;
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(VibeError::not_found("file", rel))
            }
            Err(err) => return Err(VibeError::io(Some(path), "read file metadata", err)),
        };
        if !metadata.is_file() {
            return Err(VibeError::validation("path", format!("{rel} is not a file")));
        }

        let size = metadata.len();
        let offset = offset.min(size);
        let remaining = size - offset;
        let window = remaining.min(max_bytes);

        let mut file =
            File::open(&path).map_err(|err| VibeError::io(Some(path.clone()), "open file", err))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| VibeError::io(Some(path.clone()), "seek file", err))?;
        let mut buffer = Vec::with_capacity(window as usize);
        file.take(window)
            .read_to_end(&mut buffer)
            .map_err(|err| VibeError::io(Some(path.clone()), "read file", err))?;

        let truncated_bytes = remaining - window;
        let mut content = String::from_utf8_lossy(&buffer).into_owned();
        if truncated_bytes > 0 {
            content.push_str(&format!("\n\n/* truncated {truncated_bytes} bytes */"));
        }

        Ok(FileRead {
            path: self.relative(&path),
            size,
            offset,
            content,
            truncated_bytes,
        })
    }

    /// Case-insensitive substring search over text files.
    pub fn search(
        &self,
        query: &str,
        rel: Option<&str>,
        max_matches: usize,
        ext: Option<&str>,
    ) -> VibeResult<Vec<SearchMatch>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Err(VibeError::validation("q", "query is required"));
        }
        let wanted_ext = ext
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty());
        let start = self.start_dir(rel)?;
        let mut matches = Vec::new();

        let walker = WalkDir::new(&start)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_ignored(&entry.file_name().to_string_lossy()));

        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let too_big = entry
                .metadata()
                .map(|m| m.len() > self.search_max_file_bytes)
                .unwrap_or(true);
            if too_big {
                continue;
            }
            if let Some(wanted) = &wanted_ext {
                let actual = entry
                    .path()
                    .extension()
                    .map(|e| e.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                if &actual != wanted {
                    continue;
                }
            }
            let text = match fs::read_to_string(entry.path()) {
                Ok(text) => text,
                Err(_) => continue,
            };
            let rel_path = self.relative(entry.path());
            for (index, line) in text.split('\n').enumerate() {
                let line = line.strip_suffix('\r').unwrap_or(line);
                if line.to_lowercase().contains(&needle) {
                    matches.push(SearchMatch {
                        path: rel_path.clone(),
                        line: index + 1,
                        text: line.chars().take(SEARCH_LINE_MAX_CHARS).collect(),
                    });
                    if matches.len() >= max_matches {
                        return Ok(matches);
                    }
                }
            }
        }

        Ok(matches)
    }

    /// Compact `{files, dirs}` view of the top two levels, for oracle context.
    pub fn summary(&self, max: usize) -> Value {
        let entries = self.tree(None, 1).unwrap_or_default();
        let files: Vec<&str> = entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .take(max)
            .map(|e| e.path.as_str())
            .collect();
        let dirs: Vec<&str> = entries
            .iter()
            .filter(|e| e.kind == EntryKind::Dir)
            .take(max)
            .map(|e| e.path.as_str())
            .collect();
        json!({ "files": files, "dirs": dirs })
    }
}
