//! The bounded reasoning loop: one cooperative task per active prompt.
//!
//! Each iteration sends the current prompt to the model host, parses the
//! reply, renders prose, and either terminates (`task_complete`), suspends
//! on a confirmation slot (`request_confirmation`), or dispatches a tool
//! and feeds the serialized result back as the next observation. Tool
//! execution is bounded here by the tool timeout, never inside handlers.
//! The loop never retries tool calls on its own, and the model is
//! prompted at most `absolute_max_iterations` times per task.

use std::collections::HashMap;
use std::sync::Arc;

use phoenix_protocol::command::ToolCommand;
use phoenix_protocol::command::ToolResult;
use phoenix_protocol::protocol::DisplayUserPromptEvent;
use phoenix_protocol::protocol::LogMessageKind;
use phoenix_protocol::protocol::ServerEvent;
use phoenix_protocol::records::META_AUGMENTED_PROMPT;
use phoenix_protocol::records::META_TOOL_NAME;
use phoenix_protocol::records::Role;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::error::PhoenixErr;
use crate::error::Result;
use crate::haven::ModelHost;
use crate::memory::MemoryManager;
use crate::parser::parse_agent_response;
use crate::session::ActiveSession;
use crate::store::VectorStore;
use crate::tools;
use crate::tools::ToolContext;

/// Shared dependencies a loop run needs besides the session itself.
#[derive(Clone)]
pub struct TaskContext {
    pub config: Arc<Config>,
    pub store: Arc<VectorStore>,
    pub haven: Arc<dyn ModelHost>,
}

/// Bridge entry point: validate, enforce one-loop-per-session, spawn.
pub async fn start_task(ctx: TaskContext, session: Arc<ActiveSession>, prompt: String) {
    if prompt.trim().is_empty() {
        session
            .send_event(ServerEvent::log(
                LogMessageKind::Info,
                "invalid argument: prompt must not be empty",
            ))
            .await;
        return;
    }
    if session.task_running() {
        session
            .send_event(ServerEvent::log(
                LogMessageKind::Info,
                "A task is already running for this session; wait for it to finish.",
            ))
            .await;
        return;
    }
    let handle = tokio::spawn(run_task(ctx, Arc::clone(&session), prompt)).abort_handle();
    session.set_task(handle);
}

/// The loop body. Every exit path emits exactly one terminal `log_message`
/// (`final_answer` or `info`) unless the session is being torn down.
pub async fn run_task(ctx: TaskContext, session: Arc<ActiveSession>, prompt: String) {
    session
        .send_event(ServerEvent::DisplayUserPrompt(DisplayUserPromptEvent {
            prompt: prompt.clone(),
        }))
        .await;

    let outcome = drive_loop(&ctx, &session, prompt).await;
    if let Err(err) = outcome {
        warn!(session_id = %session.session_id(), "task ended with error: {err}");
        session
            .send_event(ServerEvent::log(LogMessageKind::Info, err.to_string()))
            .await;
    }
    session.finish_task();
}

async fn drive_loop(
    ctx: &TaskContext,
    session: &Arc<ActiveSession>,
    prompt: String,
) -> Result<()> {
    let memory = session.memory();
    let augmented = offload_memory(&memory, {
        let prompt = prompt.clone();
        move |m| m.prepare_augmented_prompt(&prompt)
    })
    .await?;

    // Snapshot the history before recording the new turn: if the host does
    // not know this session yet it gets seeded with the prior turns only,
    // and the send below appends the current prompt exactly once.
    let history = history_snapshot(&memory);

    let mut user_meta = HashMap::new();
    if augmented != prompt {
        user_meta.insert(META_AUGMENTED_PROMPT.to_string(), augmented.clone());
    }
    offload_memory(&memory, {
        let prompt = prompt.clone();
        move |m| m.add_turn(Role::User, &prompt, Some(user_meta)).map(|_| ())
    })
    .await?;

    let host_key = session.host_key();

    let tool_ctx = ToolContext {
        config: Arc::clone(&ctx.config),
        store: Arc::clone(&ctx.store),
        haven: Arc::clone(&ctx.haven),
        session: Arc::clone(session),
    };

    let mut current_prompt = augmented;
    let mut registered = false;
    let absolute_cap = ctx.config.absolute_max_iterations;
    let nominal_cap = ctx.config.nominal_max_iterations;

    for iteration in 1..=absolute_cap {
        if iteration == nominal_cap + 1 {
            current_prompt.push_str(
                "\n\nSYSTEM NOTE: several iterations have passed without a final \
                 answer. Wrap up and finish with the task_complete action.",
            );
        }

        // Registration gets the same treatment as the send below: a
        // timeout becomes an observation and consumes an iteration; only
        // an unreachable host ends the task.
        if !registered {
            match ctx.haven.get_or_create_session(&host_key, &history).await {
                Ok(_) => registered = true,
                Err(err) => {
                    let observation = host_error_to_observation(err)?;
                    session.send_event(ServerEvent::tool_log(&*observation)).await;
                    record_observation(&memory, &observation, None).await?;
                    current_prompt = format!("OBSERVATION: {observation}");
                    continue;
                }
            }
        }

        let reply = match ctx.haven.send_message(&host_key, &current_prompt).await {
            Ok(reply) => reply,
            Err(err) => {
                let observation = host_error_to_observation(err)?;
                session.send_event(ServerEvent::tool_log(&*observation)).await;
                record_observation(&memory, &observation, None).await?;
                current_prompt = format!("OBSERVATION: {observation}");
                continue;
            }
        };

        offload_memory(&memory, {
            let reply = reply.clone();
            move |m| m.add_turn(Role::Model, &reply, None).map(|_| ())
        })
        .await?;

        let parsed = parse_agent_response(&reply);
        if !parsed.prose.is_empty() {
            session
                .send_event(ServerEvent::log(LogMessageKind::Info, parsed.prose.clone()))
                .await;
        }

        let command = match (parsed.command, parsed.command_error) {
            (Some(command), _) => command,
            (None, maybe_error) => {
                let message = maybe_error.unwrap_or_else(|| {
                    "reply contained no actionable command; respond with exactly one \
                     JSON command object"
                        .to_string()
                });
                let result = ToolResult::err(&*message);
                current_prompt = feed_result(session, &memory, None, &result).await?;
                continue;
            }
        };

        debug!(action = command.action(), iteration, "model issued command");
        match command {
            ToolCommand::TaskComplete { answer } => {
                session
                    .send_event(ServerEvent::log(LogMessageKind::FinalAnswer, answer))
                    .await;
                return Ok(());
            }
            ToolCommand::RequestConfirmation { prompt: question } => {
                session
                    .send_event(ServerEvent::log(
                        LogMessageKind::SystemConfirm,
                        question.clone(),
                    ))
                    .await;
                let rx = session.request_confirmation(&question).await;
                let response = match rx.await {
                    Ok(response) => response,
                    Err(_) => {
                        // Slot dropped without an answer: the session is
                        // being torn down, leave without emitting.
                        info!("confirmation slot dropped; exiting loop");
                        return Ok(());
                    }
                };
                let observation = format!("USER_CONFIRMATION: '{response}'");
                record_observation(&memory, &observation, Some("request_confirmation")).await?;
                current_prompt = observation;
            }
            command => {
                session
                    .send_event(ServerEvent::tool_log(format!(
                        "executing {}",
                        command.action()
                    )))
                    .await;
                // The loop, not the handler, bounds tool execution.
                // Dropping the dispatch future kills a timed-out
                // subprocess; other in-flight blocking work finishes on
                // the pool and its result is discarded.
                let result = match tokio::time::timeout(
                    ctx.config.tool_timeout,
                    tools::dispatch(&command, &tool_ctx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => ToolResult::err(format!(
                        "tool '{}' timed out after {}s",
                        command.action(),
                        ctx.config.tool_timeout.as_secs()
                    )),
                };
                current_prompt =
                    feed_result(session, &memory, Some(command.action()), &result).await?;
            }
        }
    }

    session
        .send_event(ServerEvent::log(
            LogMessageKind::Info,
            format!(
                "Reached the iteration limit ({absolute_cap}) without a final answer; stopping."
            ),
        ))
        .await;
    Ok(())
}

/// Fold a model-host error into the observation fed back to the model.
/// Unavailability is the one error the loop cannot recover from and is
/// handed back up instead.
fn host_error_to_observation(err: PhoenixErr) -> Result<String> {
    match err {
        PhoenixErr::ModelHostTimeout => Ok("model call timed out".to_string()),
        err @ PhoenixErr::ModelHostUnavailable(_) => Err(err),
        err => Ok(format!("model call failed: {err}")),
    }
}

/// Serialize a tool result, record it as an observation turn, render it,
/// and return the next prompt for the model.
async fn feed_result(
    session: &Arc<ActiveSession>,
    memory: &Arc<MemoryManager>,
    action: Option<&str>,
    result: &ToolResult,
) -> Result<String> {
    let serialized = serde_json::to_string(result)?;
    record_observation(memory, &serialized, action).await?;

    session.send_event(ServerEvent::tool_log(&*serialized)).await;
    let summary = match action {
        Some(action) => format!(
            "{action}: {}",
            if result.is_error() { "error" } else { "success" }
        ),
        None => format!("command rejected: {}", result.message),
    };
    session
        .send_event(ServerEvent::log(LogMessageKind::Info, summary))
        .await;

    Ok(format!("TOOL_RESULT: {serialized}"))
}

async fn record_observation(
    memory: &Arc<MemoryManager>,
    content: &str,
    tool_name: Option<&str>,
) -> Result<()> {
    let mut metadata = HashMap::new();
    if let Some(tool_name) = tool_name {
        metadata.insert(META_TOOL_NAME.to_string(), tool_name.to_string());
    }
    offload_memory(memory, {
        let content = content.to_string();
        move |m| {
            m.add_turn(Role::ToolObservation, &content, Some(metadata))
                .map(|_| ())
        }
    })
    .await
}

/// Run a memory operation on the blocking pool.
async fn offload_memory<T, F>(memory: &Arc<MemoryManager>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&MemoryManager) -> Result<T> + Send + 'static,
{
    let memory = Arc::clone(memory);
    tokio::task::spawn_blocking(move || f(&memory))
        .await
        .map_err(|e| PhoenixErr::Unknown(format!("worker pool failure: {e}")))?
}

fn history_snapshot(memory: &Arc<MemoryManager>) -> Vec<crate::haven::HistoryEntry> {
    memory
        .get_conversational_buffer()
        .into_iter()
        .map(|turn| crate::haven::HistoryEntry {
            role: match turn.role {
                Role::User => "user".to_string(),
                Role::Model => "model".to_string(),
                Role::ToolObservation => "tool".to_string(),
            },
            content: turn.augmented.unwrap_or(turn.content),
        })
        .collect()
}
