//! Python script execution.
//!
//! The script string runs in a fresh `python3` interpreter with the sandbox
//! as its working directory, stdin closed, and stdout/stderr captured and
//! size-capped. Execution time is bounded by the reasoning loop, not here:
//! when the loop's tool timeout expires it drops this future and
//! `kill_on_drop` reaps the interpreter.

use std::process::Stdio;

use phoenix_protocol::command::ToolResult;
use serde_json::json;
use tokio::process::Command;

use crate::error::PhoenixErr;
use crate::error::Result;

use super::ToolContext;

// Caps on captured output so one chatty script cannot blow up the
// observation fed back to the model.
const MAX_CAPTURED_BYTES: usize = 10 * 1024;

pub async fn execute_python_script(ctx: &ToolContext, script: &str) -> Result<ToolResult> {
    if script.trim().is_empty() {
        return Err(PhoenixErr::InvalidArgument(
            "script must not be empty".to_string(),
        ));
    }
    std::fs::create_dir_all(&ctx.config.sandbox_dir)?;

    let child = Command::new("python3")
        .arg("-c")
        .arg(script)
        .current_dir(&ctx.config.sandbox_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // Unbounded on purpose: the loop owns the timeout and drops this
    // future on expiry.
    let output = child.wait_with_output().await?;

    let stdout = truncate_capture(&output.stdout);
    let stderr = truncate_capture(&output.stderr);
    let exit_code = output.status.code().unwrap_or(-1);

    if output.status.success() {
        Ok(ToolResult::ok_with(
            "script finished".to_string(),
            json!({ "stdout": stdout, "exit_code": exit_code }),
        ))
    } else {
        Ok(ToolResult {
            status: phoenix_protocol::command::ToolStatus::Error,
            message: format!("script exited with code {exit_code}"),
            content: Some(json!({ "stdout": stdout, "stderr": stderr, "exit_code": exit_code })),
        })
    }
}

fn truncate_capture(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_CAPTURED_BYTES {
        return text.into_owned();
    }
    let mut cut = MAX_CAPTURED_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[output truncated]", &text[..cut])
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::tools::testkit::test_context;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn captures_stdout_of_a_passing_script() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = test_context(&dir);
        let result = execute_python_script(&ctx, "print(21 * 2)").await.unwrap();
        assert!(!result.is_error());
        let content = result.content.unwrap();
        assert_eq!(content["stdout"], "42\n");
        assert_eq!(content["exit_code"], 0);
    }

    #[tokio::test]
    async fn reports_failures_with_stderr() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = test_context(&dir);
        let result = execute_python_script(&ctx, "raise SystemExit('boom')")
            .await
            .unwrap();
        assert!(result.is_error());
        let content = result.content.unwrap();
        assert!(content["stderr"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn scripts_run_inside_the_sandbox() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = test_context(&dir);
        execute_python_script(&ctx, "open('made-here.txt', 'w').write('x')")
            .await
            .unwrap();
        assert!(ctx.config.sandbox_dir.join("made-here.txt").is_file());
    }

    #[tokio::test]
    async fn empty_scripts_are_invalid() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = test_context(&dir);
        assert!(matches!(
            execute_python_script(&ctx, "   ").await,
            Err(PhoenixErr::InvalidArgument(_))
        ));
    }
}
