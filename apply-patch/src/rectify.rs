//! Re-anchors hunks against the real file before application.
//!
//! Hunk headers produced by a language model are wrong often enough that
//! taking them literally would reject most otherwise-good patches. Instead
//! of trusting `@@ -a,b +c,d @@`, each hunk is located by scanning the
//! source for its pre-image, with decreasing strictness: exact match first,
//! then ignoring trailing whitespace, then ignoring surrounding whitespace.
//! Once found, the header's start lines and both counts are rewritten to
//! match the hunk body. A pre-image that cannot be found anywhere at or
//! after the previous hunk is a hard failure.

use crate::PatchError;
use crate::parser::FilePatch;
use crate::parser::Hunk;
use crate::parser::HunkLine;

#[derive(Clone, Copy)]
enum MatchPass {
    Exact,
    IgnoreTrailing,
    IgnoreSurrounding,
}

impl MatchPass {
    fn lines_equal(self, haystack: &str, needle: &str) -> bool {
        match self {
            MatchPass::Exact => haystack == needle,
            MatchPass::IgnoreTrailing => haystack.trim_end() == needle.trim_end(),
            MatchPass::IgnoreSurrounding => haystack.trim() == needle.trim(),
        }
    }
}

/// Find `needle` within `haystack` at or after index `from`, trying the
/// match passes in order of decreasing strictness. Returns the start index.
fn seek_lines(haystack: &[String], needle: &[String], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from);
    }
    if needle.len() > haystack.len() || from + needle.len() > haystack.len() {
        return None;
    }
    let last_start = haystack.len() - needle.len();
    for pass in [
        MatchPass::Exact,
        MatchPass::IgnoreTrailing,
        MatchPass::IgnoreSurrounding,
    ] {
        for start in from..=last_start {
            let matches = needle
                .iter()
                .enumerate()
                .all(|(offset, line)| pass.lines_equal(&haystack[start + offset], line));
            if matches {
                return Some(start);
            }
        }
    }
    None
}

fn locate_pre_image(
    source_lines: &[String],
    hunk: &Hunk,
    cursor: usize,
) -> Option<(usize, usize)> {
    let mut pre = hunk.pre_image();
    if let Some(start) = seek_lines(source_lines, &pre, cursor) {
        return Some((start, pre.len()));
    }
    // A diff touching end-of-file often carries the file's trailing newline
    // as one extra empty pre-image line that the line split does not produce.
    if pre.last().is_some_and(|s| s.is_empty()) {
        pre.pop();
        if let Some(start) = seek_lines(source_lines, &pre, cursor) {
            return Some((start, pre.len()));
        }
    }
    None
}

/// Rewrite every hunk header of `patch` so that it matches where the hunk's
/// pre-image actually occurs in `source_lines`. Hunks are located in order;
/// each search starts where the previous hunk ended.
pub(crate) fn rectify_file_patch(
    patch: &mut FilePatch,
    source_lines: &[String],
) -> Result<(), PatchError> {
    let mut cursor = 0usize;
    let mut delta = 0isize;

    for hunk in &mut patch.hunks {
        let (start, pre_len) = match locate_pre_image(source_lines, hunk, cursor) {
            Some(found) => found,
            None => {
                let first = hunk
                    .pre_image()
                    .into_iter()
                    .find(|line| !line.trim().is_empty())
                    .unwrap_or_default();
                return Err(PatchError::NotApplicable(format!(
                    "hunk pre-image starting with '{first}' not found in {}",
                    patch.source.as_deref().unwrap_or("(new file)")
                )));
            }
        };
        if pre_len < hunk.pre_image().len() {
            drop_extra_trailing_context(hunk, pre_len);
        }
        hunk.src_start = start + 1;
        hunk.src_len = pre_len;
        hunk.dst_start = usize::try_from(start as isize + 1 + delta).unwrap_or(1);
        hunk.dst_len = hunk.post_image().len();
        delta += hunk.dst_len as isize - hunk.src_len as isize;
        cursor = start + pre_len;
    }
    Ok(())
}

/// When the trailing empty pre-image line was dropped during location, the
/// hunk body still carries it; trim the matching trailing context/remove
/// line (and its `Add` twin, if the post-image mirrors it).
fn drop_extra_trailing_context(hunk: &mut Hunk, pre_len: usize) {
    let mut seen = 0usize;
    let keep_until = hunk
        .lines
        .iter()
        .position(|line| {
            if matches!(line, HunkLine::Context(_) | HunkLine::Remove(_)) {
                seen += 1;
                seen > pre_len
            } else {
                false
            }
        })
        .unwrap_or(hunk.lines.len());
    hunk.lines.truncate(keep_until);
}

/// Apply rectified hunks to `source_lines`, producing the new file body.
/// Context and remove lines consume the *actual* source line (so lenient
/// whitespace matches keep the file's original bytes); add lines insert the
/// patch text.
pub(crate) fn apply_hunks(
    source_lines: &[String],
    hunks: &[Hunk],
) -> Result<Vec<String>, PatchError> {
    let mut out: Vec<String> = Vec::with_capacity(source_lines.len());
    let mut cursor = 0usize;

    for hunk in hunks {
        let start = hunk.src_start - 1;
        if start < cursor || start > source_lines.len() {
            return Err(PatchError::NotApplicable(format!(
                "hunk at line {} overlaps a previous hunk",
                hunk.src_start
            )));
        }
        out.extend_from_slice(&source_lines[cursor..start]);
        cursor = start;
        let mut consumed = 0usize;
        for line in &hunk.lines {
            match line {
                HunkLine::Context(_) => {
                    if consumed < hunk.src_len && cursor < source_lines.len() {
                        out.push(source_lines[cursor].clone());
                        cursor += 1;
                        consumed += 1;
                    }
                }
                HunkLine::Remove(_) => {
                    if consumed < hunk.src_len && cursor < source_lines.len() {
                        cursor += 1;
                        consumed += 1;
                    }
                }
                HunkLine::Add(text) => out.push(text.clone()),
            }
        }
    }
    out.extend_from_slice(&source_lines[cursor..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::parser::parse_patch;
    use pretty_assertions::assert_eq;

    fn to_lines(text: &str) -> Vec<String> {
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        if lines.last().is_some_and(|s| s.is_empty()) {
            lines.pop();
        }
        lines
    }

    #[test]
    fn seek_prefers_exact_over_lenient() {
        let haystack = to_lines("fn main() {\n    let x = 1;\nlet x = 1;\n");
        let needle = vec!["let x = 1;".to_string()];
        assert_eq!(seek_lines(&haystack, &needle, 0), Some(2));
    }

    #[test]
    fn seek_falls_back_to_whitespace_insensitive() {
        let haystack = to_lines("  alpha  \n  beta\n");
        let needle = vec!["alpha".to_string(), "beta".to_string()];
        assert_eq!(seek_lines(&haystack, &needle, 0), Some(0));
    }

    #[test]
    fn rectify_repairs_a_header_that_is_off_by_two() {
        let source = to_lines("l1\nl2\nl3\nl4\nl5\nl6\nl7\nl8\nl9\nl10\nl11\nl12\nl13\nl14\n");
        let diff = "--- a/f\n+++ b/f\n@@ -10,3 +10,3 @@\n l12\n-l13\n+L13\n";
        let mut patch = parse_patch(diff).unwrap().files.remove(0);
        rectify_file_patch(&mut patch, &source).unwrap();
        let hunk = &patch.hunks[0];
        assert_eq!((hunk.src_start, hunk.src_len), (12, 2));
        assert_eq!((hunk.dst_start, hunk.dst_len), (12, 2));

        let patched = apply_hunks(&source, &patch.hunks).unwrap();
        assert_eq!(patched[12], "L13");
        assert_eq!(patched.len(), source.len());
    }

    #[test]
    fn rectify_recomputes_wrong_counts_from_the_body() {
        let source = to_lines("a\nb\nc\n");
        // Counts in the header are nonsense; the body is authoritative.
        let diff = "--- a/f\n+++ b/f\n@@ -1,9 +1,9 @@\n a\n-b\n+b2\n+b3\n c\n";
        let mut patch = parse_patch(diff).unwrap().files.remove(0);
        rectify_file_patch(&mut patch, &source).unwrap();
        let hunk = &patch.hunks[0];
        assert_eq!(hunk.src_len, 3);
        assert_eq!(hunk.dst_len, 4);
        let patched = apply_hunks(&source, &patch.hunks).unwrap();
        assert_eq!(patched, to_lines("a\nb2\nb3\nc\n"));
    }

    #[test]
    fn missing_pre_image_is_rejected() {
        let source = to_lines("a\nb\n");
        let diff = "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n-zzz\n+y\n";
        let mut patch = parse_patch(diff).unwrap().files.remove(0);
        let err = rectify_file_patch(&mut patch, &source).unwrap_err();
        assert!(matches!(err, PatchError::NotApplicable(_)));
    }

    #[test]
    fn later_hunks_search_after_earlier_ones() {
        let source = to_lines("x\ny\nx\ny\n");
        let diff = "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n x\n-y\n+Y1\n@@ -3,2 +3,2 @@\n x\n-y\n+Y2\n";
        let mut patch = parse_patch(diff).unwrap().files.remove(0);
        rectify_file_patch(&mut patch, &source).unwrap();
        let patched = apply_hunks(&source, &patch.hunks).unwrap();
        assert_eq!(patched, to_lines("x\nY1\nx\nY2\n"));
    }
}
