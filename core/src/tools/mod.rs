//! Tool dispatch: declarative commands in, `ToolResult`s out.
//!
//! Handlers never let an internal error cross the registry boundary; every
//! failure is folded into `ToolResult { status: error }` so the reasoning
//! loop can hand it to the model as an observation. Blocking filesystem,
//! store and subprocess work runs on the blocking pool.

mod files;
mod patch;
mod script;
pub mod sessions;

use std::sync::Arc;

use phoenix_protocol::command::ToolCommand;
use phoenix_protocol::command::ToolResult;

use crate::config::Config;
use crate::error::Result;
use crate::haven::ModelHost;
use crate::session::ActiveSession;
use crate::store::VectorStore;

/// Everything a handler may touch: the sandbox root (via config), the
/// vector store, the model host, and the session for UI side-channel emits.
pub struct ToolContext {
    pub config: Arc<Config>,
    pub store: Arc<VectorStore>,
    pub haven: Arc<dyn ModelHost>,
    pub session: Arc<ActiveSession>,
}

/// Run one command. `request_confirmation` and `task_complete` are loop
/// terminators/suspension points and are intercepted before dispatch; their
/// arms here only guard against a mis-wired caller.
pub async fn dispatch(command: &ToolCommand, ctx: &ToolContext) -> ToolResult {
    let outcome = match command {
        ToolCommand::CreateFile { filename, content } => {
            files::create_file(ctx, filename, content).await
        }
        ToolCommand::ReadFile { filename } => files::read_file(ctx, filename).await,
        ToolCommand::ReadProjectFile { filename } => files::read_project_file(ctx, filename).await,
        ToolCommand::ListAllowedProjectFiles => files::list_allowed_project_files(ctx),
        ToolCommand::ListDirectory { path } => files::list_directory(ctx, path.as_deref()).await,
        ToolCommand::DeleteFile { filename } => files::delete_file(ctx, filename).await,
        ToolCommand::ExecutePythonScript { script } => script::execute_python_script(ctx, script).await,
        ToolCommand::ApplyPatch { diff_content } => patch::apply_patch(ctx, diff_content).await,
        ToolCommand::ListSessions => sessions::list_sessions(ctx).await,
        ToolCommand::LoadSession { session_name } => sessions::load_session(ctx, session_name).await,
        ToolCommand::SaveSession { session_name } => sessions::save_session(ctx, session_name).await,
        ToolCommand::DeleteSession { session_name } => {
            sessions::delete_session(ctx, session_name).await
        }
        ToolCommand::RequestConfirmation { .. } | ToolCommand::TaskComplete { .. } => {
            Ok(ToolResult::err(format!(
                "action '{}' is handled by the reasoning loop",
                command.action()
            )))
        }
    };
    fold(outcome)
}

/// Collapse handler errors into an error `ToolResult`.
fn fold(outcome: Result<ToolResult>) -> ToolResult {
    match outcome {
        Ok(result) => result,
        Err(err) => ToolResult::err(err.to_string()),
    }
}

/// Run `f` on the blocking pool and fold a cancelled pool into an error.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| crate::error::PhoenixErr::Unknown(format!("worker pool failure: {e}")))?
}

#[cfg(test)]
pub(crate) mod testkit {
    #![allow(clippy::unwrap_used)]

    //! Shared fixtures for handler and loop tests.

    use std::sync::Arc;

    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::ToolContext;
    use crate::config::Config;
    use crate::embedding;
    use crate::haven::ModelHost;
    use crate::haven::testing::ScriptedHost;
    use crate::memory::MemoryManager;
    use crate::session::ActiveSession;
    use crate::session::CHANNEL_CAPACITY;
    use crate::store::VectorStore;
    use phoenix_protocol::protocol::ServerEvent;

    /// A full tool context over throwaway directories, plus the receiving
    /// end of the session's event channel.
    pub(crate) fn test_context_with_host(
        dir: &TempDir,
        haven: Arc<dyn ModelHost>,
    ) -> (ToolContext, mpsc::Receiver<ServerEvent>) {
        let config = Arc::new(Config::with_roots(
            dir.path().join("sandbox"),
            dir.path().join("store"),
        ));
        let store = Arc::new(VectorStore::new(&config.store_dir).unwrap());
        let memory = Arc::new(
            MemoryManager::new_scratch(
                Arc::clone(&store),
                embedding::global(&config),
                "test",
                config.segment_threshold,
            )
            .unwrap(),
        );
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let session = Arc::new(ActiveSession::new("test", memory, tx));
        (
            ToolContext {
                config,
                store,
                haven,
                session,
            },
            rx,
        )
    }

    pub(crate) fn test_context(dir: &TempDir) -> (ToolContext, mpsc::Receiver<ServerEvent>) {
        test_context_with_host(dir, Arc::new(ScriptedHost::default()))
    }
}
