//! Per-connection session state and the registry that owns it.
//!
//! The registry is the sole owner of [`ActiveSession`] values; everything
//! else (bridge, loop, tool handlers) works through an `Arc` borrow.
//! Outbound events for one session flow through a single bounded channel
//! whose receiver lives in the connection's writer task, which is what
//! guarantees per-session ordering.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use phoenix_protocol::protocol::ConfirmationResponse;
use phoenix_protocol::protocol::RequestUserConfirmationEvent;
use phoenix_protocol::protocol::ServerEvent;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::info;

use crate::memory::MemoryManager;

/// Label shown for a session that was never saved under a name.
pub const DEFAULT_SESSION_NAME: &str = "[New Session]";

/// Bounded per-connection event queue; plenty for an interactive client.
pub const CHANNEL_CAPACITY: usize = 128;

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct TaskState {
    current_task: Option<AbortHandle>,
    pending_confirmation: Option<oneshot::Sender<ConfirmationResponse>>,
}

pub struct ActiveSession {
    session_id: String,
    session_name: Mutex<String>,
    memory: Mutex<Arc<MemoryManager>>,
    tx_event: mpsc::Sender<ServerEvent>,
    state: Mutex<TaskState>,
}

impl ActiveSession {
    pub fn new(
        session_id: impl Into<String>,
        memory: Arc<MemoryManager>,
        tx_event: mpsc::Sender<ServerEvent>,
    ) -> Self {
        ActiveSession {
            session_id: session_id.into(),
            session_name: Mutex::new(DEFAULT_SESSION_NAME.to_string()),
            memory: Mutex::new(memory),
            tx_event,
            state: Mutex::new(TaskState::default()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_name(&self) -> String {
        lock(&self.session_name).clone()
    }

    /// The key this session uses with the model host. Unnamed sessions get
    /// a per-connection scratch key so concurrent clients never share
    /// host-side history.
    pub fn host_key(&self) -> String {
        let name = self.session_name();
        if name == DEFAULT_SESSION_NAME {
            format!("scratch-{}", self.session_id)
        } else {
            name
        }
    }

    pub fn set_session_name(&self, name: &str) {
        *lock(&self.session_name) = name.to_string();
    }

    pub fn memory(&self) -> Arc<MemoryManager> {
        Arc::clone(&lock(&self.memory))
    }

    /// Swap in a different memory (used by `load_session`).
    pub fn set_memory(&self, memory: Arc<MemoryManager>) {
        *lock(&self.memory) = memory;
    }

    /// Send an event to this session's client. A send failure means the
    /// connection writer is gone; the event is dropped on purpose.
    pub async fn send_event(&self, event: ServerEvent) {
        if self.tx_event.send(event).await.is_err() {
            debug!(session_id = %self.session_id, "dropped event for disconnected client");
        }
    }

    /// Emit a confirmation request and install the single-shot slot the
    /// loop will wait on. Installing a new slot drops any stale one, which
    /// resolves the old receiver as cancelled.
    pub async fn request_confirmation(
        &self,
        prompt: &str,
    ) -> oneshot::Receiver<ConfirmationResponse> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = lock(&self.state);
            state.pending_confirmation = Some(tx);
        }
        self.send_event(ServerEvent::RequestUserConfirmation(
            RequestUserConfirmationEvent {
                prompt: prompt.to_string(),
            },
        ))
        .await;
        rx
    }

    /// Resolve the outstanding confirmation slot, if any.
    pub fn notify_confirmation(&self, response: ConfirmationResponse) {
        let slot = lock(&self.state).pending_confirmation.take();
        match slot {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(
                session_id = %self.session_id,
                "confirmation arrived with no outstanding slot"
            ),
        }
    }

    /// Whether a reasoning loop is currently running for this session.
    pub fn task_running(&self) -> bool {
        lock(&self.state)
            .current_task
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn set_task(&self, handle: AbortHandle) {
        lock(&self.state).current_task = Some(handle);
    }

    pub fn finish_task(&self) {
        lock(&self.state).current_task = None;
    }

    /// Disconnect path: the outstanding confirmation (if any) resolves as
    /// `no` and the loop task is aborted; the abort lands at the loop's
    /// next suspension point, so in-flight blocking work finishes and its
    /// result is discarded.
    pub fn abort(&self) {
        let mut state = lock(&self.state);
        if let Some(tx) = state.pending_confirmation.take() {
            let _ = tx.send(ConfirmationResponse::No);
        }
        if let Some(handle) = state.current_task.take() {
            handle.abort();
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.abort();
    }
}

/// `session_id -> ActiveSession`; one entry per live connection.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<ActiveSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    pub fn insert(&self, session: Arc<ActiveSession>) {
        let id = session.session_id().to_string();
        info!(session_id = %id, "session connected");
        lock(&self.sessions).insert(id, session);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ActiveSession>> {
        lock(&self.sessions).get(session_id).cloned()
    }

    /// Remove and shut down a session. Any running loop observes the abort
    /// at its next suspension point and exits without further emits.
    pub fn remove(&self, session_id: &str) {
        if let Some(session) = lock(&self.sessions).remove(session_id) {
            info!(%session_id, "session disconnected");
            session.abort();
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        lock(&self.sessions).contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::Config;
    use crate::embedding;
    use crate::store::VectorStore;
    use tempfile::tempdir;

    fn test_session(tx: mpsc::Sender<ServerEvent>) -> Arc<ActiveSession> {
        let dir = tempdir().unwrap();
        let config = Config::with_roots(
            dir.path().join("sandbox"),
            dir.path().join("store"),
        );
        let store = Arc::new(VectorStore::new(&config.store_dir).unwrap());
        let memory = Arc::new(
            MemoryManager::new_scratch(
                store,
                embedding::global(&config),
                "test-conn",
                config.segment_threshold,
            )
            .unwrap(),
        );
        Arc::new(ActiveSession::new("test-conn", memory, tx))
    }

    #[tokio::test]
    async fn confirmation_slot_is_single_shot() {
        let (tx, mut rx_events) = mpsc::channel(CHANNEL_CAPACITY);
        let session = test_session(tx);

        let rx = session.request_confirmation("proceed?").await;
        assert!(matches!(
            rx_events.recv().await,
            Some(ServerEvent::RequestUserConfirmation(_))
        ));

        session.notify_confirmation(ConfirmationResponse::Yes);
        assert_eq!(rx.await.unwrap(), ConfirmationResponse::Yes);

        // A second notification with no slot is a no-op, not a panic.
        session.notify_confirmation(ConfirmationResponse::No);
    }

    #[tokio::test]
    async fn abort_resolves_confirmation_as_no() {
        let (tx, _rx_events) = mpsc::channel(CHANNEL_CAPACITY);
        let session = test_session(tx);
        let rx = session.request_confirmation("still there?").await;
        session.abort();
        assert_eq!(rx.await.unwrap(), ConfirmationResponse::No);
    }

    #[tokio::test]
    async fn registry_removal_aborts_the_session() {
        let (tx, _rx_events) = mpsc::channel(CHANNEL_CAPACITY);
        let registry = SessionRegistry::new();
        let session = test_session(tx);
        registry.insert(Arc::clone(&session));
        assert!(registry.contains("test-conn"));

        let rx = session.request_confirmation("?").await;
        registry.remove("test-conn");
        assert!(!registry.contains("test-conn"));
        assert_eq!(rx.await.unwrap(), ConfirmationResponse::No);
    }
}
