//! Named-session lifecycle: list, save, load, delete, and history replay.
//!
//! A saved session is a pair of vector collections (turns + code) plus a
//! registration with the model host under the raw session name. Loading
//! prefers the persisted records and overwrites the host-side history with
//! them, so the collections are always the source of truth.

use std::sync::Arc;

use phoenix_protocol::command::ToolCommand;
use phoenix_protocol::command::ToolResult;
use phoenix_protocol::protocol::DisplayUserPromptEvent;
use phoenix_protocol::protocol::EmptyPayload;
use phoenix_protocol::protocol::LogMessageKind;
use phoenix_protocol::protocol::ServerEvent;
use phoenix_protocol::protocol::SessionEntry;
use phoenix_protocol::protocol::SessionListUpdateEvent;
use phoenix_protocol::protocol::SessionNameUpdateEvent;
use phoenix_protocol::records::MemoryRecord;
use phoenix_protocol::records::Role;
use serde_json::json;
use tracing::warn;

use crate::embedding;
use crate::error::PhoenixErr;
use crate::error::Result;
use crate::haven::HistoryEntry;
use crate::memory::MemoryManager;
use crate::memory::Turn;
use crate::memory::collection_names;
use crate::memory::collection_namespace_prefix;
use crate::memory::sanitize_session_name;
use crate::parser::parse_agent_response;
use crate::session::DEFAULT_SESSION_NAME;

use super::ToolContext;
use super::run_blocking;

const TURNS_SUFFIX: &str = "_turns";

/// Names of every saved session visible to this server: the union of
/// host-registered sessions and on-disk collections in our namespace.
async fn gather_session_names(ctx: &ToolContext) -> Vec<String> {
    let host_names: Vec<String> = match ctx.haven.list_sessions().await {
        Ok(names) => names,
        Err(err) => {
            warn!("model host did not answer list_sessions: {err}");
            Vec::new()
        }
    }
    .into_iter()
    // Per-connection scratch registrations are not saved sessions.
    .filter(|name| !name.starts_with("scratch-"))
    .collect();

    let store = Arc::clone(&ctx.store);
    let disk_names: Vec<String> = run_blocking(move || store.list_collections())
        .await
        .unwrap_or_default()
        .into_iter()
        .filter_map(|collection| {
            collection
                .strip_prefix(&collection_namespace_prefix())
                .and_then(|rest| rest.strip_suffix(TURNS_SUFFIX))
                .map(str::to_string)
        })
        .collect();

    let mut names = host_names.clone();
    for disk in disk_names {
        let registered = host_names
            .iter()
            .any(|h| sanitize_session_name(h) == disk);
        if !registered && !names.contains(&disk) {
            names.push(disk);
        }
    }
    names.sort();
    names.dedup();
    names
}

/// Push a fresh `session_list_update` to this session's client.
pub async fn emit_session_list(ctx: &ToolContext) {
    let names = gather_session_names(ctx).await;
    let content = names.into_iter().map(|name| SessionEntry { name }).collect();
    ctx.session
        .send_event(ServerEvent::SessionListUpdate(SessionListUpdateEvent {
            status: "success".to_string(),
            content,
        }))
        .await;
}

pub async fn list_sessions(ctx: &ToolContext) -> Result<ToolResult> {
    let names = gather_session_names(ctx).await;
    emit_session_list(ctx).await;
    let entries: Vec<_> = names.iter().map(|name| json!({ "name": name })).collect();
    Ok(ToolResult::ok_with(
        format!("{} saved sessions", names.len()),
        json!(entries),
    ))
}

pub async fn save_session(ctx: &ToolContext, name: &str) -> Result<ToolResult> {
    let (target_turns, target_code) = collection_names(name)?;

    // Two distinct raw names that sanitize to the same collection would
    // silently share state; refuse the save instead.
    let sanitized = sanitize_session_name(name);
    let host_names = ctx.haven.list_sessions().await.unwrap_or_default();
    if let Some(taken) = host_names
        .iter()
        .find(|h| h.as_str() != name && sanitize_session_name(h) == sanitized)
    {
        return Err(PhoenixErr::InvalidArgument(format!(
            "session name '{name}' collides with existing session '{taken}'"
        )));
    }

    let memory = ctx.session.memory();
    let source_turns = memory.turns_collection().to_string();
    let source_code = memory.code_collection().to_string();

    let store = Arc::clone(&ctx.store);
    let embedder = embedding::global(&ctx.config);
    let target_turns_clone = target_turns.clone();
    let copied = run_blocking(move || {
        let mut copied = 0usize;
        if source_turns != target_turns_clone {
            copy_collection(&store, embedder, &source_turns, &target_turns_clone, &mut copied)?;
            copy_collection(&store, embedder, &source_code, &target_code, &mut 0)?;
        } else {
            copied = store.count(&source_turns)?;
        }
        Ok(copied)
    })
    .await?;

    // Register with the host, seeding its history from the live buffer.
    let history = history_from_turns(&memory.get_conversational_buffer());
    ctx.haven.get_or_create_session(name, &history).await?;

    rebind_session_memory(ctx, name).await?;

    // The scratch collections this connection was working in are obsolete
    // once their contents live under the saved name.
    if source_turns_is_scratch(&memory) {
        let store = Arc::clone(&ctx.store);
        let turns = memory.turns_collection().to_string();
        let code = memory.code_collection().to_string();
        run_blocking(move || {
            store.delete_collection(&turns)?;
            store.delete_collection(&code)?;
            Ok(())
        })
        .await?;
    }

    announce_session(ctx, name).await;
    Ok(ToolResult::ok(format!(
        "Saved session '{name}' ({copied} records)"
    )))
}

pub async fn load_session(ctx: &ToolContext, name: &str) -> Result<ToolResult> {
    let (turns_collection, _) = collection_names(name)?;
    if !ctx.store.collection_exists(&turns_collection) {
        return Err(PhoenixErr::NotFound(format!("no saved session '{name}'")));
    }

    let store = Arc::clone(&ctx.store);
    let collection = turns_collection.clone();
    let records = run_blocking(move || store.get_all_records(&collection)).await?;

    // The persisted records win: drop whatever history the host still holds
    // under this name, then re-register seeded from the collection.
    if let Err(err) = ctx.haven.delete_session(name).await {
        warn!("model host did not drop stale session '{name}': {err}");
    }
    let history = history_from_records(&records);
    ctx.haven.get_or_create_session(name, &history).await?;

    rebind_session_memory(ctx, name).await?;
    ctx.session
        .send_event(ServerEvent::ClearChatHistory(EmptyPayload {}))
        .await;
    replay_records(ctx, &records).await;
    announce_session(ctx, name).await;
    Ok(ToolResult::ok(format!(
        "Loaded session '{name}' ({} records)",
        records.len()
    )))
}

pub async fn delete_session(ctx: &ToolContext, name: &str) -> Result<ToolResult> {
    let (turns_collection, code_collection) = collection_names(name)?;
    let store = Arc::clone(&ctx.store);
    run_blocking(move || {
        store.delete_collection(&turns_collection)?;
        store.delete_collection(&code_collection)?;
        Ok(())
    })
    .await?;

    if let Err(err) = ctx.haven.delete_session(name).await {
        warn!("model host did not delete session '{name}': {err}");
    }

    // Deleting the session we are sitting on drops us back to a fresh
    // unnamed one.
    if ctx.session.session_name() == name {
        rebind_to_scratch(ctx).await?;
        announce_session(ctx, DEFAULT_SESSION_NAME).await;
    } else {
        emit_session_list(ctx).await;
    }
    Ok(ToolResult::ok(format!("Deleted session '{name}'")))
}

/// Point the active session's memory at `name`'s collections.
async fn rebind_session_memory(ctx: &ToolContext, name: &str) -> Result<()> {
    let store = Arc::clone(&ctx.store);
    let embedder = embedding::global(&ctx.config);
    let threshold = ctx.config.segment_threshold;
    let owned_name = name.to_string();
    let memory = run_blocking(move || {
        Ok(Arc::new(MemoryManager::new(
            store,
            embedder,
            &owned_name,
            threshold,
        )?))
    })
    .await?;
    ctx.session.set_memory(memory);
    ctx.session.set_session_name(name);
    Ok(())
}

/// Back to a fresh per-connection scratch memory and the default label.
async fn rebind_to_scratch(ctx: &ToolContext) -> Result<()> {
    let store = Arc::clone(&ctx.store);
    let embedder = embedding::global(&ctx.config);
    let threshold = ctx.config.segment_threshold;
    let session_id = ctx.session.session_id().to_string();
    let memory = run_blocking(move || {
        Ok(Arc::new(MemoryManager::new_scratch(
            store,
            embedder,
            &session_id,
            threshold,
        )?))
    })
    .await?;
    ctx.session.set_memory(memory);
    ctx.session.set_session_name(DEFAULT_SESSION_NAME);
    Ok(())
}

fn source_turns_is_scratch(memory: &MemoryManager) -> bool {
    memory.turns_collection().starts_with("scratch_")
}

async fn announce_session(ctx: &ToolContext, name: &str) {
    ctx.session
        .send_event(ServerEvent::SessionNameUpdate(SessionNameUpdateEvent {
            name: name.to_string(),
        }))
        .await;
    emit_session_list(ctx).await;
}

fn copy_collection(
    store: &crate::store::VectorStore,
    embedder: &embedding::Embedder,
    source: &str,
    target: &str,
    copied: &mut usize,
) -> Result<()> {
    store.delete_collection(target)?;
    if !store.collection_exists(source) {
        return Ok(());
    }
    for record in store.get_all_records(source)? {
        let vector = embedder.embed(&record.content);
        store.add_record(target, &record, &vector)?;
        *copied += 1;
    }
    Ok(())
}

fn history_from_turns(turns: &[Turn]) -> Vec<HistoryEntry> {
    turns
        .iter()
        .map(|turn| HistoryEntry {
            role: history_role(turn.role),
            // The host should see what the model saw: the augmented prompt
            // where one was recorded.
            content: turn
                .augmented
                .clone()
                .unwrap_or_else(|| turn.content.clone()),
        })
        .collect()
}

fn history_from_records(records: &[MemoryRecord]) -> Vec<HistoryEntry> {
    records
        .iter()
        .map(|record| HistoryEntry {
            role: history_role(record.role),
            content: record
                .metadata
                .get(phoenix_protocol::records::META_AUGMENTED_PROMPT)
                .cloned()
                .unwrap_or_else(|| record.content.clone()),
        })
        .collect()
}

fn history_role(role: Role) -> String {
    match role {
        Role::User => "user".to_string(),
        Role::Model => "model".to_string(),
        Role::ToolObservation => "tool".to_string(),
    }
}

/// Re-emit the rendering events a client would have seen when these records
/// were first produced. Nothing is re-executed; model turns are re-parsed
/// so confirmations and final answers replay with their own message kinds.
pub async fn replay_records(ctx: &ToolContext, records: &[MemoryRecord]) {
    for record in records {
        match record.role {
            Role::User => {
                ctx.session
                    .send_event(ServerEvent::DisplayUserPrompt(DisplayUserPromptEvent {
                        prompt: record.content.clone(),
                    }))
                    .await;
            }
            Role::Model => {
                let parsed = parse_agent_response(&record.content);
                if !parsed.prose.is_empty() {
                    ctx.session
                        .send_event(ServerEvent::log(LogMessageKind::Info, parsed.prose))
                        .await;
                }
                match parsed.command {
                    Some(ToolCommand::RequestConfirmation { prompt }) => {
                        ctx.session
                            .send_event(ServerEvent::log(
                                LogMessageKind::SystemConfirmReplayed,
                                prompt,
                            ))
                            .await;
                    }
                    Some(ToolCommand::TaskComplete { answer }) => {
                        ctx.session
                            .send_event(ServerEvent::log(LogMessageKind::FinalAnswer, answer))
                            .await;
                    }
                    Some(command) => {
                        ctx.session
                            .send_event(ServerEvent::tool_log(format!(
                                "[replayed] {}",
                                command.action()
                            )))
                            .await;
                    }
                    None => {}
                }
            }
            Role::ToolObservation => {
                ctx.session
                    .send_event(ServerEvent::tool_log(record.content.clone()))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::tools::testkit::test_context;
    use phoenix_protocol::records::META_AUGMENTED_PROMPT;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::sync::mpsc::Receiver;

    fn drain(rx: &mut Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn seed_conversation(ctx: &ToolContext) {
        let memory = ctx.session.memory();
        let mut meta = HashMap::new();
        meta.insert(
            META_AUGMENTED_PROMPT.to_string(),
            "Relevant prior context:\n- none\n\nhello".to_string(),
        );
        memory.add_turn(Role::User, "hello", Some(meta)).unwrap();
        memory
            .add_turn(
                Role::Model,
                "Hi there!\n```json\n{\"action\": \"task_complete\", \"parameters\": {\"answer\": \"Hi.\"}}\n```",
                None,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn save_then_load_reproduces_the_buffer() {
        let dir = TempDir::new().unwrap();
        let (ctx, mut rx) = test_context(&dir);
        seed_conversation(&ctx);
        let original: Vec<(Role, String)> = ctx
            .session
            .memory()
            .get_conversational_buffer()
            .into_iter()
            .map(|t| (t.role, t.content))
            .collect();

        let saved = save_session(&ctx, "demo").await.unwrap();
        assert!(!saved.is_error());
        drain(&mut rx);

        let loaded = load_session(&ctx, "demo").await.unwrap();
        assert!(!loaded.is_error());

        let restored: Vec<(Role, String)> = ctx
            .session
            .memory()
            .get_conversational_buffer()
            .into_iter()
            .map(|t| (t.role, t.content))
            .collect();
        assert_eq!(restored, original);
        assert_eq!(ctx.session.session_name(), "demo");
    }

    #[tokio::test]
    async fn load_replays_the_original_rendering() {
        let dir = TempDir::new().unwrap();
        let (ctx, mut rx) = test_context(&dir);
        seed_conversation(&ctx);
        save_session(&ctx, "replayed").await.unwrap();
        drain(&mut rx);

        load_session(&ctx, "replayed").await.unwrap();
        let events = drain(&mut rx);

        assert!(matches!(events[0], ServerEvent::ClearChatHistory(_)));
        assert!(matches!(
            &events[1],
            ServerEvent::DisplayUserPrompt(e) if e.prompt == "hello"
        ));
        let final_answer = events.iter().any(|e| {
            matches!(e, ServerEvent::LogMessage(m)
                if m.kind == LogMessageKind::FinalAnswer && m.data == "Hi.")
        });
        assert!(final_answer);
    }

    #[tokio::test]
    async fn deleted_sessions_disappear_from_the_list() {
        let dir = TempDir::new().unwrap();
        let (ctx, mut rx) = test_context(&dir);
        seed_conversation(&ctx);
        save_session(&ctx, "doomed").await.unwrap();

        let listing = list_sessions(&ctx).await.unwrap();
        assert!(listing.message.starts_with("1 "));

        delete_session(&ctx, "doomed").await.unwrap();
        let listing = list_sessions(&ctx).await.unwrap();
        assert_eq!(listing.content, Some(json!([])));
        drain(&mut rx);
    }

    #[tokio::test]
    async fn loading_a_missing_session_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = test_context(&dir);
        assert!(matches!(
            load_session(&ctx, "ghost").await,
            Err(PhoenixErr::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn colliding_sanitized_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = test_context(&dir);
        seed_conversation(&ctx);
        save_session(&ctx, "demo!").await.unwrap();

        let err = save_session(&ctx, "demo?").await.unwrap_err();
        assert!(matches!(err, PhoenixErr::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn unusable_session_names_are_invalid() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = test_context(&dir);
        assert!(matches!(
            save_session(&ctx, "!!!").await,
            Err(PhoenixErr::InvalidArgument(_))
        ));
    }
}
