//! Filesystem handlers. Every path is resolved through the path guard
//! before any I/O; reads and writes happen on the blocking pool.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use phoenix_protocol::command::ToolResult;
use serde_json::json;
use tracing::warn;

use crate::error::PhoenixErr;
use crate::error::Result;
use crate::path_guard::safe_path;

use super::ToolContext;
use super::run_blocking;

/// Directories skipped by `list_directory`: dependency/build trees that
/// would drown the model in noise. Hidden entries are skipped separately.
const VENDOR_DIRS: &[&str] = &["node_modules", "target", "__pycache__", "venv", "vendor"];

fn resolve(ctx: &ToolContext, user_path: &str) -> Result<PathBuf> {
    match safe_path(user_path, &ctx.config.sandbox_dir) {
        Ok(path) => Ok(path),
        Err(err) => {
            if matches!(err, PhoenixErr::PathEscape(_)) {
                warn!(
                    session_id = %ctx.session.session_id(),
                    user_path,
                    "rejected path outside the sandbox"
                );
            }
            Err(err)
        }
    }
}

pub async fn create_file(ctx: &ToolContext, filename: &str, content: &str) -> Result<ToolResult> {
    let path = resolve(ctx, filename)?;
    let content = content.to_string();
    let display_name = filename.to_string();
    let memory = ctx.session.memory();
    run_blocking(move || {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content.as_bytes())?;
        // Indexing is best-effort: the file is on disk either way.
        if let Err(err) = memory.record_code_artifact(&display_name, &content) {
            warn!("failed to index code artifact '{}': {}", display_name, err);
        }
        Ok(ToolResult::ok(format!(
            "Created '{display_name}' ({} bytes)",
            content.len()
        )))
    })
    .await
}

pub async fn read_file(ctx: &ToolContext, filename: &str) -> Result<ToolResult> {
    let path = resolve(ctx, filename)?;
    let display = filename.to_string();
    run_blocking(move || {
        if !path.is_file() {
            return Err(PhoenixErr::NotFound(format!("no such file: {display}")));
        }
        let contents = fs::read_to_string(&path)?;
        Ok(ToolResult::ok_with(
            format!("Read '{display}' ({} bytes)", contents.len()),
            json!(contents),
        ))
    })
    .await
}

pub async fn delete_file(ctx: &ToolContext, filename: &str) -> Result<ToolResult> {
    let path = resolve(ctx, filename)?;
    let display = filename.to_string();
    run_blocking(move || {
        if !path.is_file() {
            return Err(PhoenixErr::NotFound(format!("no such file: {display}")));
        }
        fs::remove_file(&path)?;
        Ok(ToolResult::ok(format!("Deleted '{display}'")))
    })
    .await
}

pub async fn list_directory(ctx: &ToolContext, path: Option<&str>) -> Result<ToolResult> {
    let root = match path {
        Some(p) => resolve(ctx, p)?,
        None => {
            fs::create_dir_all(&ctx.config.sandbox_dir)?;
            ctx.config.sandbox_dir.canonicalize()?
        }
    };
    run_blocking(move || {
        let mut entries = Vec::new();
        walk(&root, &root, &mut entries)?;
        entries.sort();
        Ok(ToolResult::ok_with(
            format!("{} entries", entries.len()),
            json!(entries),
        ))
    })
    .await
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            if VENDOR_DIRS.contains(&name.as_ref()) {
                continue;
            }
            walk(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// Read one of the server's own files. Only exact entries of the
/// configured allow-list are reachable; the sandbox guard does not apply
/// because these files live outside the sandbox by definition.
pub async fn read_project_file(ctx: &ToolContext, filename: &str) -> Result<ToolResult> {
    let requested = Path::new(filename.trim());
    let allowed = ctx
        .config
        .project_file_allow_list
        .iter()
        .any(|entry| entry == requested);
    if !allowed {
        return Err(PhoenixErr::NotFound(format!(
            "'{filename}' is not on the project file allow-list"
        )));
    }
    let path = requested.to_path_buf();
    let display = filename.to_string();
    run_blocking(move || {
        let contents = fs::read_to_string(&path)
            .map_err(|_| PhoenixErr::NotFound(format!("allow-listed file missing: {display}")))?;
        Ok(ToolResult::ok_with(
            format!("Read project file '{display}'"),
            json!(contents),
        ))
    })
    .await
}

pub fn list_allowed_project_files(ctx: &ToolContext) -> Result<ToolResult> {
    let listing: Vec<String> = ctx
        .config
        .project_file_allow_list
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    Ok(ToolResult::ok_with(
        format!("{} allowed project files", listing.len()),
        json!(listing),
    ))
}
