//! Bridges the `apply_patch` action to the diff engine. Paths named in the
//! diff headers are resolved through the sandbox guard before any staging
//! happens; everything else is the engine's job.

use std::cell::RefCell;

use phoenix_apply_patch::PatchError;
use phoenix_protocol::command::ToolResult;
use serde_json::json;
use tracing::warn;

use crate::error::PhoenixErr;
use crate::error::Result;
use crate::path_guard::safe_path;

use super::ToolContext;
use super::run_blocking;

pub async fn apply_patch(ctx: &ToolContext, diff_content: &str) -> Result<ToolResult> {
    if diff_content.trim().is_empty() {
        return Err(PhoenixErr::InvalidArgument(
            "diff_content must not be empty".to_string(),
        ));
    }
    let diff = diff_content.to_string();
    let sandbox = ctx.config.sandbox_dir.clone();
    let session_id = ctx.session.session_id().to_string();

    run_blocking(move || {
        // The engine only carries a string for rejected paths, so the guard
        // error is parked here to keep its kind (PathEscape vs
        // InvalidArgument) intact across the resolver boundary.
        let guard_error: RefCell<Option<PhoenixErr>> = RefCell::new(None);
        let resolve = |header_path: &str| {
            safe_path(header_path, &sandbox).map_err(|err| {
                if matches!(err, PhoenixErr::PathEscape(_)) {
                    warn!(
                        session_id = %session_id,
                        header_path,
                        "rejected patch path outside the sandbox"
                    );
                }
                let message = err.to_string();
                *guard_error.borrow_mut() = Some(err);
                message
            })
        };
        match phoenix_apply_patch::apply_patch(&diff, &resolve) {
            Ok(affected) => {
                let paths = |v: &Vec<std::path::PathBuf>| -> Vec<String> {
                    v.iter().map(|p| p.display().to_string()).collect()
                };
                Ok(ToolResult::ok_with(
                    affected.summary(),
                    json!({
                        "added": paths(&affected.added),
                        "modified": paths(&affected.modified),
                        "deleted": paths(&affected.deleted),
                    }),
                ))
            }
            Err(PatchError::PathRejected(message)) => Err(guard_error
                .borrow_mut()
                .take()
                .unwrap_or_else(|| PhoenixErr::Unknown(message))),
            Err(err) => Err(PhoenixErr::PatchNotApplicable(err)),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::tools::testkit::test_context;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn patches_apply_inside_the_sandbox() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = test_context(&dir);
        fs::create_dir_all(&ctx.config.sandbox_dir).unwrap();
        fs::write(ctx.config.sandbox_dir.join("app.py"), "x = 1\ny = 2\n").unwrap();

        let diff = "--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,2 @@\n x = 1\n-y = 2\n+y = 3\n";
        let result = apply_patch(&ctx, diff).await.unwrap();
        assert!(!result.is_error());
        assert_eq!(
            fs::read_to_string(ctx.config.sandbox_dir.join("app.py")).unwrap(),
            "x = 1\ny = 3\n"
        );
    }

    #[tokio::test]
    async fn escaping_patches_fail_with_path_escape() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = test_context(&dir);
        let diff = "--- a/../outside.txt\n+++ b/../outside.txt\n@@ -1 +1 @@\n-a\n+b\n";
        let err = apply_patch(&ctx, diff).await.unwrap_err();
        assert!(matches!(err, PhoenixErr::PathEscape(_)));
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[tokio::test]
    async fn unmatched_patches_fail_as_not_applicable() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = test_context(&dir);
        fs::create_dir_all(&ctx.config.sandbox_dir).unwrap();
        fs::write(ctx.config.sandbox_dir.join("app.py"), "x = 1\n").unwrap();

        let diff = "--- a/app.py\n+++ b/app.py\n@@ -1 +1 @@\n-not in the file\n+y\n";
        let err = apply_patch(&ctx, diff).await.unwrap_err();
        assert!(matches!(err, PhoenixErr::PatchNotApplicable(_)));
    }
}
