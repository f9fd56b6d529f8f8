//! Hunk application against in-memory file content.
//!
//! Application is best effort: every hunk either lands completely or is
//! rolled back and reported as skipped. Nothing here touches the disk.

use crate::config::PatchConfig;
use crate::patch_parser::{PatchHunk, PatchLine};
use crate::warning::{Warning, WarningKind};

/// Inclusive, 1-based line span between a START marker and its END marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepRegion {
    pub start: usize,
    pub end: usize,
}

impl KeepRegion {
    /// Deleting (or replacing) line `line` touches the region.
    fn guards_line(&self, line: usize) -> bool {
        self.start <= line && line <= self.end
    }

    /// Inserting before line `line` lands strictly inside the markers.
    fn guards_insert_at(&self, line: usize) -> bool {
        self.start < line && line <= self.end
    }
}

/// Scans for marker pairs. An unclosed START protects through end of file.
pub fn find_keep_regions(content: &str, start_marker: &str, end_marker: &str) -> Vec<KeepRegion> {
    let mut regions = Vec::new();
    let mut open: Option<usize> = None;
    let mut line_count = 0;

    for (index, line) in content.split('\n').enumerate() {
        line_count = index + 1;
        match open {
            None if line.contains(start_marker) => open = Some(index + 1),
            Some(start) if line.contains(end_marker) => {
                regions.push(KeepRegion {
                    start,
                    end: index + 1,
                });
                open = None;
            }
            _ => {}
        }
    }

    if let Some(start) = open {
        regions.push(KeepRegion {
            start,
            end: line_count,
        });
    }
    regions
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub fuzz_lines: usize,
    pub keep_regions: bool,
    pub keep_start_marker: String,
    pub keep_end_marker: String,
}

impl ApplyOptions {
    pub fn from_config(config: &PatchConfig, keep_regions: Option<bool>) -> Self {
        Self {
            fuzz_lines: config.fuzz_lines,
            keep_regions: keep_regions.unwrap_or(config.keep_regions),
            keep_start_marker: config.keep_start_marker.clone(),
            keep_end_marker: config.keep_end_marker.clone(),
        }
    }
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self::from_config(&PatchConfig::default(), None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkOutcome {
    pub text: String,
    pub applied: usize,
    pub skipped: usize,
}

/// Why a hunk was rolled back.
struct Rejection {
    kind: WarningKind,
    note: String,
}

impl Rejection {
    fn new(kind: WarningKind, note: impl Into<String>) -> Self {
        Self {
            kind,
            note: note.into(),
        }
    }
}

pub struct HunkApplier<'a> {
    path: &'a str,
    options: &'a ApplyOptions,
    regions: Vec<KeepRegion>,
}

impl<'a> HunkApplier<'a> {
    pub fn new(path: &'a str, original: &str, options: &'a ApplyOptions) -> Self {
        let regions = if options.keep_regions {
            find_keep_regions(
                original,
                &options.keep_start_marker,
                &options.keep_end_marker,
            )
        } else {
            Vec::new()
        };
        Self {
            path,
            options,
            regions,
        }
    }

    /// Applies `hunks` in order, pushing one warning per fuzzy shift or
    /// skipped hunk into `warnings`.
    pub fn apply(
        &self,
        original: &str,
        hunks: &[PatchHunk],
        warnings: &mut Vec<Warning>,
    ) -> HunkOutcome {
        let lines: Vec<&str> = original.split('\n').collect();
        let mut out: Vec<&str> = Vec::with_capacity(lines.len());
        // 1-based index of the next unconsumed original line.
        let mut ptr = 1usize;
        let mut applied = 0;
        let mut skipped = 0;

        for (index, hunk) in hunks.iter().enumerate() {
            let (target, shift) = self.locate(&lines, hunk, ptr);
            if target < ptr {
                warnings.push(Warning::for_hunk(
                    self.path,
                    index,
                    WarningKind::OutOfOrder,
                    format!("hunk targets line {target} but line {ptr} is already consumed"),
                ));
                skipped += 1;
                continue;
            }

            let (saved_len, saved_ptr) = (out.len(), ptr);
            while ptr < target && ptr <= lines.len() {
                out.push(lines[ptr - 1]);
                ptr += 1;
            }

            match self.apply_one(&lines, hunk, &mut ptr, &mut out) {
                Ok(()) => {
                    if shift != 0 {
                        warnings.push(Warning::for_hunk(
                            self.path,
                            index,
                            WarningKind::FuzzyOffset,
                            format!("hunk applied at line {target} (offset {shift:+})"),
                        ));
                    }
                    applied += 1;
                }
                Err(rejection) => {
                    out.truncate(saved_len);
                    ptr = saved_ptr;
                    warnings.push(Warning::for_hunk(
                        self.path,
                        index,
                        rejection.kind,
                        rejection.note,
                    ));
                    skipped += 1;
                }
            }
        }

        if ptr <= lines.len() {
            out.extend_from_slice(&lines[ptr - 1..]);
        }

        HunkOutcome {
            text: out.join("\n"),
            applied,
            skipped,
        }
    }

    /// Picks the start line for `hunk`, returning it with its offset from
    /// the declared start.
    fn locate(&self, lines: &[&str], hunk: &PatchHunk, ptr: usize) -> (usize, isize) {
        let old_side: Vec<&PatchLine> = hunk
            .lines
            .iter()
            .filter(|line| !matches!(line, PatchLine::Add(_)))
            .collect();
        // Pure insertions (`-N,0`) go after line N.
        let declared = if old_side.is_empty() && hunk.old_count == 0 {
            hunk.old_start + 1
        } else {
            hunk.old_start.max(1)
        };

        // First context line, with its offset into the old side.
        let anchor = old_side
            .iter()
            .enumerate()
            .find_map(|(k, line)| match line {
                PatchLine::Context(text) => Some((k, text.as_str())),
                _ => None,
            });
        let Some((k, first_context)) = anchor else {
            return (declared, 0);
        };

        let matches_at = |start: usize| -> bool {
            start >= ptr && lines.get(start + k - 1).map_or(false, |l| *l == first_context)
        };

        if matches_at(declared) {
            return (declared, 0);
        }
        for distance in 1..=self.options.fuzz_lines {
            if let Some(earlier) = declared.checked_sub(distance).filter(|s| *s >= 1) {
                if matches_at(earlier) {
                    return (earlier, -(distance as isize));
                }
            }
            if matches_at(declared + distance) {
                return (declared + distance, distance as isize);
            }
        }
        (declared, 0)
    }

    fn apply_one<'l>(
        &self,
        lines: &[&'l str],
        hunk: &'l PatchHunk,
        ptr: &mut usize,
        out: &mut Vec<&'l str>,
    ) -> Result<(), Rejection> {
        for line in &hunk.lines {
            match line {
                PatchLine::Context(expected) => {
                    let actual = current(lines, *ptr);
                    if actual != Some(expected.as_str()) {
                        return Err(Rejection::new(
                            WarningKind::ContextMismatch,
                            mismatch_note("context", *ptr, expected, actual),
                        ));
                    }
                    out.push(lines[*ptr - 1]);
                    *ptr += 1;
                }
                PatchLine::Remove(expected) => {
                    if let Some(region) = self.regions.iter().find(|r| r.guards_line(*ptr)) {
                        return Err(Rejection::new(
                            WarningKind::KeepRegion,
                            format!(
                                "delete at line {} falls inside keep region {}-{}",
                                *ptr, region.start, region.end
                            ),
                        ));
                    }
                    let actual = current(lines, *ptr);
                    if actual != Some(expected.as_str()) {
                        return Err(Rejection::new(
                            WarningKind::DeleteMismatch,
                            mismatch_note("delete", *ptr, expected, actual),
                        ));
                    }
                    *ptr += 1;
                }
                PatchLine::Add(text) => {
                    if let Some(region) = self.regions.iter().find(|r| r.guards_insert_at(*ptr)) {
                        return Err(Rejection::new(
                            WarningKind::KeepRegion,
                            format!(
                                "insert before line {} falls inside keep region {}-{}",
                                *ptr, region.start, region.end
                            ),
                        ));
                    }
                    out.push(text.as_str());
                }
            }
        }
        Ok(())
    }
}

fn current<'l>(lines: &[&'l str], ptr: usize) -> Option<&'l str> {
    ptr.checked_sub(1).and_then(|i| lines.get(i)).copied()
}

fn mismatch_note(what: &str, line: usize, expected: &str, actual: Option<&str>) -> String {
    let found = match actual {
        Some(actual) => format!("{actual:?}"),
        None => "end of file".to_string(),
    };
    format!("{what} mismatch at line {line}: expected {expected:?}, found {found}")
}

/// Convenience wrapper for one file's hunks.
pub fn apply_hunks(
    path: &str,
    original: &str,
    hunks: &[PatchHunk],
    options: &ApplyOptions,
    warnings: &mut Vec<Warning>,
) -> HunkOutcome {
    HunkApplier::new(path, original, options).apply(original, hunks, warnings)
}
