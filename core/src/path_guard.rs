//! Sandbox path containment.
//!
//! Every user- or model-supplied path is funneled through [`safe_path`]
//! before any filesystem handler touches it. The base directory is created
//! on first use and canonicalized; the candidate path is resolved through
//! its deepest existing ancestor so that symlinks cannot smuggle a write
//! outside the sandbox, and the canonical result must still start with the
//! canonical base.

use std::fs;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::error::PhoenixErr;
use crate::error::Result;

/// Resolve `user_path` inside `base_dir`.
///
/// Fails with `InvalidArgument` for empty or whitespace-only input and with
/// `PathEscape` for absolute paths, `..` components, or any resolution
/// (including via symlink) that leaves the base directory.
pub fn safe_path(user_path: &str, base_dir: &Path) -> Result<PathBuf> {
    let trimmed = user_path.trim();
    if trimmed.is_empty() {
        return Err(PhoenixErr::InvalidArgument(
            "path must not be empty".to_string(),
        ));
    }

    let relative = Path::new(trimmed);
    if relative.is_absolute() {
        return Err(PhoenixErr::PathEscape(relative.to_path_buf()));
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(PhoenixErr::PathEscape(relative.to_path_buf())),
        }
    }

    fs::create_dir_all(base_dir)?;
    let canonical_base = base_dir.canonicalize()?;
    let joined = canonical_base.join(relative);
    let resolved = resolve_through_existing_ancestor(&joined)?;

    if resolved.starts_with(&canonical_base) {
        Ok(resolved)
    } else {
        Err(PhoenixErr::PathEscape(relative.to_path_buf()))
    }
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// non-existing remainder. This resolves symlinks in the existing part
/// while still validating paths that are about to be created.
fn resolve_through_existing_ancestor(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();

    loop {
        if existing.exists() {
            let canonical = existing.canonicalize()?;
            let mut resolved = canonical;
            for part in remainder.iter().rev() {
                resolved.push(part);
            }
            return Ok(resolved);
        }
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                remainder.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return Err(PhoenixErr::PathEscape(path.to_path_buf())),
        }
    }
}
