//! WebSocket event bridge.
//!
//! One socket = one session. The select loop below is the session's single
//! outbound writer, which is what makes per-session event order a
//! guarantee rather than an accident. Inbound frames are handled inline
//! and in arrival order; `start_task` spawns the reasoning loop instead of
//! awaiting it, so confirmations keep flowing while a task runs.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use phoenix_core::embedding;
use phoenix_core::memory::MemoryManager;
use phoenix_core::reasoning;
use phoenix_core::reasoning::TaskContext;
use phoenix_core::session::ActiveSession;
use phoenix_core::session::CHANNEL_CAPACITY;
use phoenix_core::session::DEFAULT_SESSION_NAME;
use phoenix_core::store::is_valid_collection_name;
use phoenix_core::tools::ToolContext;
use phoenix_core::tools::sessions::emit_session_list;
use phoenix_protocol::protocol::ClientEvent;
use phoenix_protocol::protocol::DbCollectionDataUpdateEvent;
use phoenix_protocol::protocol::DbCollectionsUpdateEvent;
use phoenix_protocol::protocol::HavenTraceLogUpdateEvent;
use phoenix_protocol::protocol::LogMessageKind;
use phoenix_protocol::protocol::ServerEvent;
use phoenix_protocol::protocol::SessionNameUpdateEvent;
use phoenix_protocol::protocol::TraceLogUpdateEvent;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4().to_string();
    let (tx_event, mut rx_event) = mpsc::channel::<ServerEvent>(CHANNEL_CAPACITY);

    let session = match build_session(&state, &session_id, tx_event).await {
        Ok(session) => session,
        Err(err) => {
            warn!(%session_id, "failed to set up session: {err}");
            return;
        }
    };
    state.registry.insert(Arc::clone(&session));
    info!(%session_id, "client connected");

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                state.trace.record("in", &session_id, &event.to_string());
                                handle_client_event(&state, &session, event).await;
                            }
                            Err(err) => {
                                debug!(%session_id, "undecodable frame: {err}");
                                session
                                    .send_event(ServerEvent::log(
                                        LogMessageKind::Info,
                                        format!("invalid event: {err}"),
                                    ))
                                    .await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(err)) => {
                        debug!(%session_id, "socket error: {err}");
                        break;
                    }
                }
            }
            outbound = rx_event.recv() => {
                match outbound {
                    Some(event) => {
                        state.trace.record("out", &session_id, &event.to_string());
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if socket.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!(%session_id, "unserializable event: {err}"),
                        }
                    }
                    None => break,
                }
            }
        }
    }

    teardown(&state, &session_id).await;
    info!(%session_id, "client disconnected");
}

async fn build_session(
    state: &AppState,
    session_id: &str,
    tx_event: mpsc::Sender<ServerEvent>,
) -> anyhow::Result<Arc<ActiveSession>> {
    let store = Arc::clone(&state.store);
    let embedder = embedding::global(&state.config);
    let threshold = state.config.segment_threshold;
    let id = session_id.to_string();
    let memory = tokio::task::spawn_blocking(move || {
        MemoryManager::new_scratch(store, embedder, &id, threshold)
    })
    .await??;
    Ok(Arc::new(ActiveSession::new(
        session_id,
        Arc::new(memory),
        tx_event,
    )))
}

/// Remove the session and clean up its transient state. Saved sessions
/// keep their collections; an unnamed session's scratch collections go
/// with it.
async fn teardown(state: &AppState, session_id: &str) {
    let Some(session) = state.registry.get(session_id) else {
        return;
    };
    let unnamed = session.session_name() == DEFAULT_SESSION_NAME;
    let memory = session.memory();
    state.registry.remove(session_id);

    if unnamed {
        let host_key = session.host_key();
        let haven = Arc::clone(&state.haven);
        tokio::spawn(async move {
            if let Err(err) = haven.delete_session(&host_key).await {
                debug!("scratch host session cleanup failed: {err}");
            }
        });
        let cleanup = tokio::task::spawn_blocking(move || memory.delete_memory_collection());
        if let Ok(Err(err)) = cleanup.await {
            debug!("scratch collection cleanup failed: {err}");
        }
    }
}

fn tool_context(state: &AppState, session: &Arc<ActiveSession>) -> ToolContext {
    ToolContext {
        config: Arc::clone(&state.config),
        store: Arc::clone(&state.store),
        haven: Arc::clone(&state.haven),
        session: Arc::clone(session),
    }
}

pub async fn handle_client_event(state: &AppState, session: &Arc<ActiveSession>, event: ClientEvent) {
    match event {
        ClientEvent::StartTask(payload) => {
            let ctx = TaskContext {
                config: Arc::clone(&state.config),
                store: Arc::clone(&state.store),
                haven: Arc::clone(&state.haven),
            };
            reasoning::start_task(ctx, Arc::clone(session), payload.prompt).await;
        }
        ClientEvent::UserConfirmation(payload) => {
            session.notify_confirmation(payload.response);
        }
        ClientEvent::RequestSessionList(_) => {
            emit_session_list(&tool_context(state, session)).await;
        }
        ClientEvent::RequestSessionName(_) => {
            session
                .send_event(ServerEvent::SessionNameUpdate(SessionNameUpdateEvent {
                    name: session.session_name(),
                }))
                .await;
        }
        ClientEvent::LogAuditEvent(audit) => {
            info!(
                target: "audit",
                event = %audit.event,
                details = %audit.details,
                source = %audit.source,
                destination = %audit.destination,
                control_flow = audit.control_flow.as_deref().unwrap_or(""),
                "audit event"
            );
        }
        ClientEvent::RequestDbCollections(_) => {
            let store = Arc::clone(&state.store);
            let (status, content) =
                match tokio::task::spawn_blocking(move || store.list_collections()).await {
                    Ok(Ok(names)) => ("success".to_string(), names),
                    Ok(Err(err)) => (format!("error: {err}"), Vec::new()),
                    Err(err) => (format!("error: {err}"), Vec::new()),
                };
            session
                .send_event(ServerEvent::DbCollectionsUpdate(DbCollectionsUpdateEvent {
                    status,
                    content,
                }))
                .await;
        }
        ClientEvent::RequestDbCollectionData(payload) => {
            let collection = payload.collection;
            let event = if !is_valid_collection_name(&collection) {
                DbCollectionDataUpdateEvent {
                    status: "error: invalid collection name".to_string(),
                    collection,
                    content: Vec::new(),
                }
            } else {
                let store = Arc::clone(&state.store);
                let name = collection.clone();
                match tokio::task::spawn_blocking(move || store.get_all_records(&name)).await {
                    Ok(Ok(records)) => DbCollectionDataUpdateEvent {
                        status: "success".to_string(),
                        collection,
                        content: records
                            .iter()
                            .filter_map(|r| serde_json::to_value(r).ok())
                            .collect(),
                    },
                    Ok(Err(err)) => DbCollectionDataUpdateEvent {
                        status: format!("error: {err}"),
                        collection,
                        content: Vec::new(),
                    },
                    Err(err) => DbCollectionDataUpdateEvent {
                        status: format!("error: {err}"),
                        collection,
                        content: Vec::new(),
                    },
                }
            };
            session
                .send_event(ServerEvent::DbCollectionDataUpdate(event))
                .await;
        }
        ClientEvent::RequestTraceLog(_) => {
            session
                .send_event(ServerEvent::TraceLogUpdate(TraceLogUpdateEvent {
                    content: state.trace.snapshot(),
                }))
                .await;
        }
        ClientEvent::RequestHavenTraceLog(_) => {
            let content = match state.haven.get_trace_log().await {
                Ok(events) => events,
                Err(err) => {
                    warn!("model host trace log unavailable: {err}");
                    Vec::new()
                }
            };
            session
                .send_event(ServerEvent::HavenTraceLogUpdate(HavenTraceLogUpdateEvent {
                    content,
                }))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use phoenix_core::config::Config;
    use phoenix_protocol::protocol::EmptyPayload;
    use phoenix_protocol::protocol::StartTaskEvent;
    use tempfile::TempDir;

    async fn test_state(dir: &TempDir) -> (AppState, Arc<ActiveSession>, mpsc::Receiver<ServerEvent>) {
        let config = Config::with_roots(
            dir.path().join("sandbox"),
            dir.path().join("store"),
        );
        let state = AppState::from_config(config).unwrap();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let session = build_session(&state, "conn-1", tx).await.unwrap();
        state.registry.insert(Arc::clone(&session));
        (state, session, rx)
    }

    #[tokio::test]
    async fn session_name_request_is_answered() {
        let dir = TempDir::new().unwrap();
        let (state, session, mut rx) = test_state(&dir).await;

        handle_client_event(
            &state,
            &session,
            ClientEvent::RequestSessionName(EmptyPayload {}),
        )
        .await;
        match rx.recv().await.unwrap() {
            ServerEvent::SessionNameUpdate(e) => assert_eq!(e.name, DEFAULT_SESSION_NAME),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn db_collections_are_listed() {
        let dir = TempDir::new().unwrap();
        let (state, session, mut rx) = test_state(&dir).await;

        handle_client_event(
            &state,
            &session,
            ClientEvent::RequestDbCollections(EmptyPayload {}),
        )
        .await;
        match rx.recv().await.unwrap() {
            ServerEvent::DbCollectionsUpdate(e) => assert_eq!(e.status, "success"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_collection_names_are_refused() {
        let dir = TempDir::new().unwrap();
        let (state, session, mut rx) = test_state(&dir).await;

        handle_client_event(
            &state,
            &session,
            ClientEvent::RequestDbCollectionData(
                phoenix_protocol::protocol::CollectionDataRequest {
                    collection: "../etc".to_string(),
                },
            ),
        )
        .await;
        match rx.recv().await.unwrap() {
            ServerEvent::DbCollectionDataUpdate(e) => assert!(e.status.starts_with("error")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_start_task_is_rejected_inline() {
        let dir = TempDir::new().unwrap();
        let (state, session, mut rx) = test_state(&dir).await;

        handle_client_event(
            &state,
            &session,
            ClientEvent::StartTask(StartTaskEvent {
                prompt: "  ".to_string(),
            }),
        )
        .await;
        match rx.recv().await.unwrap() {
            ServerEvent::LogMessage(m) => assert!(m.data.contains("invalid argument")),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!session.task_running());
    }
}
