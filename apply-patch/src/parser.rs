//! Parses a normalized unified diff into a list of per-file patches.
//!
//! The accepted grammar is the common `diff -u` output:
//!
//! ```text
//! --- a/path/to/old
//! +++ b/path/to/new
//! @@ -start,len +start,len @@ optional section
//!  context line
//! -removed line
//! +added line
//! ```
//!
//! `/dev/null` on either side marks file creation or deletion. Line numbers
//! in hunk headers are treated as hints only; the rectifier recomputes them
//! against the real file before anything is applied.

use thiserror::Error;

#[derive(Debug, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid patch: {0}")]
    InvalidPatch(String),
    #[error("invalid hunk header on line {line_number}: {text}")]
    InvalidHunkHeader { line_number: usize, text: String },
    #[error("unexpected line {line_number} inside hunk: {text}")]
    UnexpectedLine { line_number: usize, text: String },
}

/// A whole diff: one entry per touched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSet {
    pub files: Vec<FilePatch>,
}

/// All hunks addressed to a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// `None` when the diff creates the file (`--- /dev/null`).
    pub source: Option<String>,
    /// `None` when the diff deletes the file (`+++ /dev/null`).
    pub target: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    /// The path this patch ultimately addresses on disk.
    pub fn effective_path(&self) -> &str {
        match (&self.target, &self.source) {
            (Some(target), _) => target,
            (None, Some(source)) => source,
            // Unreachable by construction: parse_patch rejects null->null.
            (None, None) => "",
        }
    }

    pub fn is_creation(&self) -> bool {
        self.source.is_none()
    }

    pub fn is_deletion(&self) -> bool {
        self.target.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based start line in the source file.
    pub src_start: usize,
    pub src_len: usize,
    /// 1-based start line in the target file.
    pub dst_start: usize,
    pub dst_len: usize,
    pub lines: Vec<HunkLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

impl Hunk {
    /// The lines this hunk expects to find in the source file, in order.
    pub fn pre_image(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.clone()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    /// The lines that replace the pre-image in the target file.
    pub fn post_image(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.clone()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }
}

/// Coerce line endings to `\n` and strip trailing whitespace from each line.
/// Model-generated diffs routinely arrive with CRLF endings and padded
/// context lines; both defeat exact matching.
pub fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out: String = unified
        .split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    if unified.ends_with('\n') && !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn parse_file_header(line: &str, marker: &str) -> Option<Option<String>> {
    let rest = line.strip_prefix(marker)?;
    // `diff -u` appends a tab plus mtime after the path.
    let path = rest.split('\t').next().unwrap_or(rest).trim();
    if path == "/dev/null" {
        return Some(None);
    }
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(Some(path.to_string()))
}

fn parse_hunk_header(line: &str, line_number: usize) -> Result<Hunk, ParseError> {
    let invalid = || ParseError::InvalidHunkHeader {
        line_number,
        text: line.to_string(),
    };
    let body = line
        .strip_prefix("@@ -")
        .and_then(|rest| rest.split_once(" @@").map(|(ranges, _)| ranges))
        .ok_or_else(invalid)?;
    let (src, dst) = body.split_once(" +").ok_or_else(invalid)?;

    let parse_range = |range: &str| -> Option<(usize, usize)> {
        match range.split_once(',') {
            Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
            None => Some((range.parse().ok()?, 1)),
        }
    };
    let (src_start, src_len) = parse_range(src).ok_or_else(invalid)?;
    let (dst_start, dst_len) = parse_range(dst).ok_or_else(invalid)?;
    Ok(Hunk {
        src_start,
        src_len,
        dst_start,
        dst_len,
        lines: Vec::new(),
    })
}

/// Parse a normalized diff. The input must contain at least one
/// `---`/`+++` header pair followed by at least one hunk.
pub fn parse_patch(text: &str) -> Result<PatchSet, ParseError> {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut files: Vec<FilePatch> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if line.is_empty() || line.starts_with("diff ") || line.starts_with("index ") {
            i += 1;
            continue;
        }
        let Some(source) = parse_file_header(line, "--- ") else {
            return Err(ParseError::InvalidPatch(format!(
                "expected '--- ' header, found: {line}"
            )));
        };
        i += 1;
        let target = match lines.get(i).and_then(|l| parse_file_header(l, "+++ ")) {
            Some(target) => target,
            None => {
                return Err(ParseError::InvalidPatch(format!(
                    "'--- ' header on line {i} has no matching '+++ ' header"
                )));
            }
        };
        if source.is_none() && target.is_none() {
            return Err(ParseError::InvalidPatch(
                "patch maps /dev/null to /dev/null".to_string(),
            ));
        }
        i += 1;

        let mut hunks: Vec<Hunk> = Vec::new();
        while i < lines.len() && lines[i].starts_with("@@") {
            let mut hunk = parse_hunk_header(lines[i], i + 1)?;
            i += 1;
            while i < lines.len() {
                let body_line = lines[i];
                if body_line.starts_with("@@")
                    || body_line.starts_with("--- ")
                    || body_line.starts_with("diff ")
                {
                    break;
                }
                if let Some(rest) = body_line.strip_prefix('+') {
                    hunk.lines.push(HunkLine::Add(rest.to_string()));
                } else if let Some(rest) = body_line.strip_prefix('-') {
                    hunk.lines.push(HunkLine::Remove(rest.to_string()));
                } else if let Some(rest) = body_line.strip_prefix(' ') {
                    hunk.lines.push(HunkLine::Context(rest.to_string()));
                } else if body_line.starts_with('\\') {
                    // "\ No newline at end of file" - informational only.
                } else if body_line.is_empty() {
                    // Normalization strips a context line that held only
                    // whitespace down to nothing; treat it as empty context,
                    // unless it is the trailing newline of the patch itself.
                    if i + 1 < lines.len() {
                        hunk.lines.push(HunkLine::Context(String::new()));
                    }
                } else {
                    return Err(ParseError::UnexpectedLine {
                        line_number: i + 1,
                        text: body_line.to_string(),
                    });
                }
                i += 1;
            }
            hunks.push(hunk);
        }
        if hunks.is_empty() && source.is_some() && target.is_some() {
            return Err(ParseError::InvalidPatch(format!(
                "no hunks for file {}",
                target.as_deref().unwrap_or_default()
            )));
        }
        files.push(FilePatch {
            source,
            target,
            hunks,
        });
    }

    if files.is_empty() {
        return Err(ParseError::InvalidPatch(
            "patch contains no file headers".to_string(),
        ));
    }
    Ok(PatchSet { files })
}
