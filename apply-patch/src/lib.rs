//! Resilient unified-diff application.
//!
//! The pipeline is: normalize the diff text, parse it, re-anchor every hunk
//! against the current file contents (see [`rectify`]), apply the corrected
//! hunks to a staged copy in a throwaway temporary directory, and only then
//! commit each result to its real path with a write-to-sibling-then-rename.
//! If anything fails, the staging directory is discarded and every target
//! file is left byte-for-byte unchanged.

mod parser;
mod rectify;

use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

pub use parser::FilePatch;
pub use parser::Hunk;
pub use parser::HunkLine;
pub use parser::ParseError;
pub use parser::PatchSet;
pub use parser::normalize;
pub use parser::parse_patch;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The diff does not apply to the file as it exists on disk.
    #[error("patch not applicable: {0}")]
    NotApplicable(String),
    /// A path named in the diff headers was refused by the caller's resolver.
    #[error("patch path rejected: {0}")]
    PathRejected(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> PatchError {
    let context = context.into();
    move |source| PatchError::Io { context, source }
}

/// Which files a committed patch touched.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AffectedPaths {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

impl AffectedPaths {
    /// Git-style one-line-per-file summary for tool output.
    pub fn summary(&self) -> String {
        let mut out = String::from("Patch applied. Affected files:\n");
        for path in &self.added {
            out.push_str(&format!("A {}\n", path.display()));
        }
        for path in &self.modified {
            out.push_str(&format!("M {}\n", path.display()));
        }
        for path in &self.deleted {
            out.push_str(&format!("D {}\n", path.display()));
        }
        out
    }
}

enum PlannedChange {
    Write { path: PathBuf, contents: String, created: bool },
    Delete { path: PathBuf },
}

fn split_lines(contents: &str) -> Vec<String> {
    let mut lines: Vec<String> = contents.split('\n').map(str::to_string).collect();
    // Drop the empty slice produced by a trailing newline so line counts
    // match `diff` semantics.
    if contents.ends_with('\n') {
        lines.pop();
    }
    lines
}

fn join_lines(mut lines: Vec<String>) -> String {
    lines.push(String::new());
    lines.join("\n")
}

/// Parse `diff_text` and apply it. `resolve` maps each header path to an
/// absolute on-disk location (this is where sandbox containment is
/// enforced); returning `Err` aborts the whole patch before staging.
pub fn apply_patch(
    diff_text: &str,
    resolve: &dyn Fn(&str) -> Result<PathBuf, String>,
) -> Result<AffectedPaths, PatchError> {
    let normalized = normalize(diff_text);
    let patch_set = parse_patch(&normalized)?;

    // Resolve every path up front: a patch that strays outside the sandbox
    // must fail before any staging work happens.
    let mut resolved: Vec<(FilePatch, PathBuf)> = Vec::with_capacity(patch_set.files.len());
    for file in patch_set.files {
        let path = resolve(file.effective_path()).map_err(PatchError::PathRejected)?;
        resolved.push((file, path));
    }

    let staging = TempDir::new().map_err(io_err("failed to create staging directory"))?;
    let mut planned: Vec<PlannedChange> = Vec::with_capacity(resolved.len());

    for (index, (file, path)) in resolved.iter().enumerate() {
        if file.is_creation() {
            if path.exists() {
                return Err(PatchError::NotApplicable(format!(
                    "cannot create {}: file already exists",
                    path.display()
                )));
            }
            let mut lines: Vec<String> = Vec::new();
            for hunk in &file.hunks {
                lines.extend(hunk.post_image());
            }
            planned.push(PlannedChange::Write {
                path: path.clone(),
                contents: join_lines(lines),
                created: true,
            });
        } else if file.is_deletion() {
            if !path.is_file() {
                return Err(PatchError::NotApplicable(format!(
                    "cannot delete {}: no such file",
                    path.display()
                )));
            }
            planned.push(PlannedChange::Delete { path: path.clone() });
        } else {
            // Stage a copy and run the whole rectify/apply pass against it;
            // the real file is not read again after this point.
            let staged = staging.path().join(format!("stage-{index}"));
            fs::copy(path, &staged)
                .map_err(io_err(format!("failed to stage {}", path.display())))?;
            let contents = fs::read_to_string(&staged)
                .map_err(io_err(format!("failed to read {}", path.display())))?;
            let source_lines = split_lines(&contents);

            let mut file = file.clone();
            rectify::rectify_file_patch(&mut file, &source_lines)?;
            let new_lines = rectify::apply_hunks(&source_lines, &file.hunks)?;
            let new_contents = join_lines(new_lines);
            fs::write(&staged, &new_contents)
                .map_err(io_err(format!("failed to write staged copy of {}", path.display())))?;
            debug!(path = %path.display(), hunks = file.hunks.len(), "staged patch");
            planned.push(PlannedChange::Write {
                path: path.clone(),
                contents: new_contents,
                created: false,
            });
        }
    }

    // Every file staged cleanly; commit. Each write goes to a sibling temp
    // file and is renamed into place so readers never observe a torn file.
    let mut affected = AffectedPaths::default();
    for change in planned {
        match change {
            PlannedChange::Write { path, contents, created } => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    fs::create_dir_all(parent).map_err(io_err(format!(
                        "failed to create parent directories for {}",
                        path.display()
                    )))?;
                }
                commit_atomically(&path, &contents)?;
                if created {
                    affected.added.push(path);
                } else {
                    affected.modified.push(path);
                }
            }
            PlannedChange::Delete { path } => {
                fs::remove_file(&path)
                    .map_err(io_err(format!("failed to delete {}", path.display())))?;
                affected.deleted.push(path);
            }
        }
    }
    Ok(affected)
}

fn commit_atomically(path: &Path, contents: &str) -> Result<(), PatchError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(io_err(format!("failed to create temp file next to {}", path.display())))?;
    tmp.write_all(contents.as_bytes())
        .map_err(io_err(format!("failed to write {}", path.display())))?;
    tmp.persist(path)
        .map_err(|e| PatchError::Io {
            context: format!("failed to replace {}", path.display()),
            source: e.error,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use similar::TextDiff;
    use tempfile::tempdir;

    fn resolver(root: &Path) -> impl Fn(&str) -> Result<PathBuf, String> + '_ {
        move |rel: &str| Ok(root.join(rel))
    }

    #[test]
    fn clean_patch_matches_a_reference_diff_tool() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");
        let old = "alpha\nbeta\ngamma\n";
        let new = "alpha\nBETA\ngamma\ndelta\n";
        fs::write(&path, old).unwrap();

        let diff = TextDiff::from_lines(old, new)
            .unified_diff()
            .header("a/f.txt", "b/f.txt")
            .to_string();
        let affected = apply_patch(&diff, &resolver(dir.path())).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), new);
        assert_eq!(affected.modified, vec![path]);
    }

    #[test]
    fn failed_patch_leaves_the_file_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "one\ntwo\n").unwrap();

        let diff = "--- a/f.txt\n+++ b/f.txt\n@@ -1,2 +1,2 @@\n one\n-THREE\n+3\n";
        let err = apply_patch(diff, &resolver(dir.path())).unwrap_err();
        assert!(matches!(err, PatchError::NotApplicable(_)));
        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn off_by_two_header_self_corrects() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prog.py");
        let body: String = (1..=14).map(|n| format!("line{n}\n")).collect();
        fs::write(&path, &body).unwrap();

        // The header says 10 but the hunk body matches lines 12-14.
        let diff = "--- a/prog.py\n+++ b/prog.py\n@@ -10,3 +10,3 @@\n line12\n-line13\n+LINE13\n line14\n";
        apply_patch(diff, &resolver(dir.path())).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("line12\nLINE13\nline14\n"));
    }

    #[test]
    fn second_application_is_rejected_without_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "a\nb\n").unwrap();

        let diff = "--- a/f.txt\n+++ b/f.txt\n@@ -1,2 +1,2 @@\n a\n-b\n+B\n";
        apply_patch(diff, &resolver(dir.path())).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nB\n");

        let err = apply_patch(diff, &resolver(dir.path())).unwrap_err();
        assert!(matches!(err, PatchError::NotApplicable(_)));
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nB\n");
    }

    #[test]
    fn creation_and_deletion_round_trip() {
        let dir = tempdir().unwrap();

        let create = "--- /dev/null\n+++ b/sub/new.txt\n@@ -0,0 +1,2 @@\n+hello\n+world\n";
        let affected = apply_patch(create, &resolver(dir.path())).unwrap();
        let path = dir.path().join("sub/new.txt");
        assert_eq!(affected.added, vec![path.clone()]);
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello\nworld\n");

        let delete = "--- a/sub/new.txt\n+++ /dev/null\n@@ -1,2 +0,0 @@\n-hello\n-world\n";
        let affected = apply_patch(delete, &resolver(dir.path())).unwrap();
        assert_eq!(affected.deleted, vec![path.clone()]);
        assert!(!path.exists());
    }

    #[test]
    fn rejected_path_fails_before_staging() {
        let dir = tempdir().unwrap();
        let diff = "--- a/../evil.txt\n+++ b/../evil.txt\n@@ -1 +1 @@\n-x\n+y\n";
        let deny = |p: &str| -> Result<PathBuf, String> { Err(format!("path escapes sandbox: {p}")) };
        let err = apply_patch(diff, &deny).unwrap_err();
        assert!(matches!(err, PatchError::PathRejected(_)));
        let _ = dir;
    }

    #[test]
    fn multi_file_patch_fails_atomically_before_commit() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.txt");
        let bad = dir.path().join("bad.txt");
        fs::write(&good, "g\n").unwrap();
        fs::write(&bad, "unrelated\n").unwrap();

        let diff = "--- a/good.txt\n+++ b/good.txt\n@@ -1 +1 @@\n-g\n+G\n\
                    --- a/bad.txt\n+++ b/bad.txt\n@@ -1 +1 @@\n-missing\n+m\n";
        let err = apply_patch(diff, &resolver(dir.path())).unwrap_err();
        assert!(matches!(err, PatchError::NotApplicable(_)));
        // Neither file changed: the failure happened during staging.
        assert_eq!(fs::read_to_string(&good).unwrap(), "g\n");
        assert_eq!(fs::read_to_string(&bad).unwrap(), "unrelated\n");
    }

    #[test]
    fn crlf_and_padded_diffs_still_apply() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "first\nsecond\n").unwrap();

        let diff = "--- a/f.txt\r\n+++ b/f.txt\r\n@@ -1,2 +1,2 @@\r\n first\r\n-second   \r\n+2nd\r\n";
        apply_patch(diff, &resolver(dir.path())).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\n2nd\n");
    }
}
