//! Fixed-format, full-file diff used for previews and logs.
//!
//! The output is not meant to be re-applied: modified files list only the
//! differing line pairs, each prefixed with its line number.

const MAX_DIFF_LINES: usize = 5000;
pub const BINARY_MARKER: &str = " (binary file)";

/// Renders the change from `before` to `after`. `None` on one side means the
/// file is absent there.
pub fn render(path: &str, before: Option<&str>, after: Option<&str>) -> String {
    match (before, after) {
        (None, None) => header(&format!("a/{path}"), &format!("b/{path}")) + " (no changes)\n",
        (None, Some(after)) => {
            let mut out = header("/dev/null", &format!("b/{path}"));
            push_lines(&mut out, after, '+');
            out
        }
        (Some(before), None) => {
            let mut out = header(&format!("a/{path}"), "/dev/null");
            push_lines(&mut out, before, '-');
            out
        }
        (Some(before), Some(after)) if before == after => {
            header(&format!("a/{path}"), &format!("b/{path}")) + " (no changes)\n"
        }
        (Some(before), Some(after)) => modified(path, before, after),
    }
}

/// Stub diff for binary content.
pub fn render_binary(path: &str) -> String {
    header(&format!("a/{path}"), &format!("b/{path}")) + BINARY_MARKER
}

fn header(old: &str, new: &str) -> String {
    format!("--- {old}\n+++ {new}\n@@\n")
}

fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
}

fn push_lines(out: &mut String, text: &str, sign: char) {
    let body: Vec<String> = split_lines(text).map(|line| format!("{sign} {line}")).collect();
    out.push_str(&body.join("\n"));
}

fn modified(path: &str, before: &str, after: &str) -> String {
    let a: Vec<&str> = split_lines(before).collect();
    let b: Vec<&str> = split_lines(after).collect();
    let mut out = vec![
        format!("--- a/{path}"),
        format!("+++ b/{path}"),
        "@@".to_string(),
    ];

    for index in 0..a.len().max(b.len()) {
        let (left, right) = (a.get(index), b.get(index));
        if left == right {
            continue;
        }
        if let Some(line) = left {
            out.push(format!("- {}: {}", index + 1, line));
        }
        if let Some(line) = right {
            out.push(format!("+ {}: {}", index + 1, line));
        }
        if out.len() > MAX_DIFF_LINES {
            out.push("... (truncated)".to_string());
            break;
        }
    }
    out.join("\n")
}
