//! Tiered session memory.
//!
//! Tier 1 is a bounded in-memory list of recent turns, rebuilt from the
//! vector store whenever a session is (re)constructed. Tier 2 is the
//! session's `turns` collection in the vector store; a sibling `code`
//! collection holds code artifacts and shares the session's lifecycle.
//! Prompt construction runs a similarity query over tier 2 and prefixes the
//! retrieved snippets to the user's prompt.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use phoenix_protocol::records::META_AUGMENTED_PROMPT;
use phoenix_protocol::records::META_FILENAME;
use phoenix_protocol::records::MemoryRecord;
use phoenix_protocol::records::Role;
use tracing::debug;

use crate::embedding::Embedder;
use crate::error::PhoenixErr;
use crate::error::Result;
use crate::store::VectorStore;

/// How many prior turns a retrieval query pulls in.
const RETRIEVAL_K: usize = 5;

const COLLECTION_NAMESPACE: &str = "phoenix";

/// One tier-1 entry. `content` is always the raw text; for user turns the
/// retrieval-augmented prompt the model actually saw travels alongside.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub augmented: Option<String>,
}

/// Strip a human session name down to the characters legal in a collection
/// name. Distinct names can collide after sanitization; callers must treat
/// an unexpected collision as an error rather than silently sharing state.
pub fn sanitize_session_name(name: &str) -> String {
    name.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// The `turns` and `code` collection names for a saved session.
pub fn collection_names(session_name: &str) -> Result<(String, String)> {
    let sanitized = sanitize_session_name(session_name);
    if sanitized.is_empty() {
        return Err(PhoenixErr::InvalidArgument(format!(
            "session name '{session_name}' contains no usable characters"
        )));
    }
    Ok((
        format!("{COLLECTION_NAMESPACE}_{sanitized}_turns"),
        format!("{COLLECTION_NAMESPACE}_{sanitized}_code"),
    ))
}

/// Working collections for a connection that has not been saved under a
/// name yet. Kept outside the saved-session namespace so transient state
/// never shows up in `list_sessions` and never collides across connections.
pub fn scratch_collection_names(session_id: &str) -> Result<(String, String)> {
    let sanitized = sanitize_session_name(session_id);
    if sanitized.is_empty() {
        return Err(PhoenixErr::InvalidArgument(format!(
            "session id '{session_id}' contains no usable characters"
        )));
    }
    Ok((
        format!("scratch_{sanitized}_turns"),
        format!("scratch_{sanitized}_code"),
    ))
}

/// Prefix shared by every *saved* collection this server manages.
pub fn collection_namespace_prefix() -> String {
    format!("{COLLECTION_NAMESPACE}_")
}

pub struct MemoryManager {
    store: Arc<VectorStore>,
    embedder: &'static Embedder,
    turns_collection: String,
    code_collection: String,
    segment_threshold: usize,
    buffer: Mutex<VecDeque<Turn>>,
    last_timestamp: Mutex<f64>,
}

impl MemoryManager {
    /// Build the memory for the saved session `session_name`, re-reading
    /// the trailing `segment_threshold` turns into the tier-1 buffer.
    pub fn new(
        store: Arc<VectorStore>,
        embedder: &'static Embedder,
        session_name: &str,
        segment_threshold: usize,
    ) -> Result<Self> {
        let collections = collection_names(session_name)?;
        Self::with_collections(store, embedder, collections, segment_threshold)
    }

    /// Build a scratch memory for an unnamed connection.
    pub fn new_scratch(
        store: Arc<VectorStore>,
        embedder: &'static Embedder,
        session_id: &str,
        segment_threshold: usize,
    ) -> Result<Self> {
        let collections = scratch_collection_names(session_id)?;
        Self::with_collections(store, embedder, collections, segment_threshold)
    }

    fn with_collections(
        store: Arc<VectorStore>,
        embedder: &'static Embedder,
        (turns_collection, code_collection): (String, String),
        segment_threshold: usize,
    ) -> Result<Self> {
        let mut buffer = VecDeque::new();
        let mut last_timestamp = 0.0f64;
        if store.collection_exists(&turns_collection) {
            let records = store.get_all_records(&turns_collection)?;
            last_timestamp = records.last().map(|r| r.timestamp).unwrap_or(0.0);
            let tail_start = records.len().saturating_sub(segment_threshold);
            for record in &records[tail_start..] {
                buffer.push_back(turn_from_record(record));
            }
            debug!(
                collection = %turns_collection,
                restored = buffer.len(),
                "rebuilt conversational buffer"
            );
        }

        Ok(MemoryManager {
            store,
            embedder,
            turns_collection,
            code_collection,
            segment_threshold,
            buffer: Mutex::new(buffer),
            last_timestamp: Mutex::new(last_timestamp),
        })
    }

    pub fn turns_collection(&self) -> &str {
        &self.turns_collection
    }

    pub fn code_collection(&self) -> &str {
        &self.code_collection
    }

    /// Monotonic per-session timestamp: wall clock, bumped forward when two
    /// turns land within the same millisecond.
    fn next_timestamp(&self) -> f64 {
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let mut last = match self.last_timestamp.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = if now <= *last { *last + 0.001 } else { now };
        *last = next;
        next
    }

    /// Append to the buffer and persist to the `turns` collection.
    pub fn add_turn(
        &self,
        role: Role,
        content: &str,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<MemoryRecord> {
        let timestamp = self.next_timestamp();
        let mut record = MemoryRecord::new(role, content, timestamp);
        if let Some(metadata) = metadata {
            record = record.with_metadata(metadata);
        }

        let embedding = self.embedder.embed(content);
        self.store
            .add_record(&self.turns_collection, &record, &embedding)?;

        let mut buffer = match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffer.push_back(turn_from_record(&record));
        while buffer.len() > self.segment_threshold {
            buffer.pop_front();
        }
        Ok(record)
    }

    /// Build the retrieval-augmented prompt for a fresh user request.
    /// Exact matches of the prompt itself are filtered out; with nothing
    /// left the raw prompt is returned unchanged.
    pub fn prepare_augmented_prompt(&self, user_prompt: &str) -> Result<String> {
        if !self.store.collection_exists(&self.turns_collection) {
            return Ok(user_prompt.to_string());
        }
        let embedding = self.embedder.embed(user_prompt);
        let retrieved = self
            .store
            .query(&self.turns_collection, &embedding, RETRIEVAL_K)?;
        let snippets: Vec<&MemoryRecord> = retrieved
            .iter()
            .filter(|record| record.content != user_prompt)
            .collect();
        if snippets.is_empty() {
            return Ok(user_prompt.to_string());
        }

        let mut prompt = String::from("Relevant prior context:\n");
        for record in snippets {
            prompt.push_str(&format!("- [{}] {}\n", record.role, record.content));
        }
        prompt.push('\n');
        prompt.push_str(user_prompt);
        Ok(prompt)
    }

    /// The tier-1 list handed to the model host as history.
    pub fn get_conversational_buffer(&self) -> Vec<Turn> {
        match self.buffer.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Index a file the agent wrote into the `code` collection, so code
    /// artifacts are retrievable alongside conversation turns and travel
    /// with the session on save/load.
    pub fn record_code_artifact(&self, filename: &str, content: &str) -> Result<MemoryRecord> {
        let timestamp = self.next_timestamp();
        let mut metadata = HashMap::new();
        metadata.insert(META_FILENAME.to_string(), filename.to_string());
        let record =
            MemoryRecord::new(Role::ToolObservation, content, timestamp).with_metadata(metadata);
        let embedding = self.embedder.embed(content);
        self.store
            .add_record(&self.code_collection, &record, &embedding)?;
        Ok(record)
    }

    /// Drop both of this session's collections.
    pub fn delete_memory_collection(&self) -> Result<()> {
        self.store.delete_collection(&self.turns_collection)?;
        self.store.delete_collection(&self.code_collection)?;
        Ok(())
    }
}

fn turn_from_record(record: &MemoryRecord) -> Turn {
    Turn {
        role: record.role,
        content: record.content.clone(),
        augmented: record.metadata.get(META_AUGMENTED_PROMPT).cloned(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::embedding::Embedder;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn embedder() -> &'static Embedder {
        static HASHING: Embedder = Embedder::Hashing;
        &HASHING
    }

    fn manager(store: &Arc<VectorStore>, name: &str, threshold: usize) -> MemoryManager {
        MemoryManager::new(Arc::clone(store), embedder(), name, threshold).unwrap()
    }

    #[test]
    fn sanitization_drops_non_alphanumerics() {
        assert_eq!(sanitize_session_name("[New Session]"), "NewSession");
        assert_eq!(sanitize_session_name("demo-1!"), "demo1");
        assert!(collection_names("!!!").is_err());
    }

    #[test]
    fn timestamps_are_strictly_increasing() {
        let dir = tempdir().unwrap();
        let store = Arc::new(VectorStore::new(dir.path()).unwrap());
        let memory = manager(&store, "mono", 20);
        for i in 0..5 {
            memory.add_turn(Role::User, &format!("turn {i}"), None).unwrap();
        }
        let records = store.get_all_records(memory.turns_collection()).unwrap();
        for pair in records.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[test]
    fn buffer_is_bounded_and_rebuilt_from_the_tail() {
        let dir = tempdir().unwrap();
        let store = Arc::new(VectorStore::new(dir.path()).unwrap());
        let memory = manager(&store, "bounded", 3);
        for i in 0..6 {
            memory.add_turn(Role::User, &format!("turn {i}"), None).unwrap();
        }
        let live: Vec<String> = memory
            .get_conversational_buffer()
            .into_iter()
            .map(|t| t.content)
            .collect();
        assert_eq!(live, vec!["turn 3", "turn 4", "turn 5"]);

        // A fresh manager over the same collection sees the same tail.
        let rebuilt = manager(&store, "bounded", 3);
        let restored: Vec<String> = rebuilt
            .get_conversational_buffer()
            .into_iter()
            .map(|t| t.content)
            .collect();
        assert_eq!(restored, live);
    }

    #[test]
    fn augmented_prompt_filters_exact_matches() {
        let dir = tempdir().unwrap();
        let store = Arc::new(VectorStore::new(dir.path()).unwrap());
        let memory = manager(&store, "aug", 20);
        memory
            .add_turn(Role::User, "what files exist in the sandbox", None)
            .unwrap();
        memory
            .add_turn(Role::Model, "The sandbox holds notes.txt", None)
            .unwrap();

        let augmented = memory
            .prepare_augmented_prompt("what files exist in the sandbox")
            .unwrap();
        assert!(augmented.starts_with("Relevant prior context:"));
        assert!(augmented.contains("notes.txt"));
        // The exact repeat of the prompt itself must not be retrieved.
        assert_eq!(augmented.matches("what files exist in the sandbox").count(), 1);
    }

    #[test]
    fn empty_collection_yields_the_raw_prompt() {
        let dir = tempdir().unwrap();
        let store = Arc::new(VectorStore::new(dir.path()).unwrap());
        let memory = manager(&store, "fresh", 20);
        let augmented = memory.prepare_augmented_prompt("hello world").unwrap();
        assert_eq!(augmented, "hello world");
    }

    #[test]
    fn augmented_prompt_metadata_survives_the_buffer() {
        let dir = tempdir().unwrap();
        let store = Arc::new(VectorStore::new(dir.path()).unwrap());
        let memory = manager(&store, "meta", 20);
        let mut metadata = HashMap::new();
        metadata.insert(
            META_AUGMENTED_PROMPT.to_string(),
            "context + hello".to_string(),
        );
        memory.add_turn(Role::User, "hello", Some(metadata)).unwrap();

        let rebuilt = manager(&store, "meta", 20);
        let buffer = rebuilt.get_conversational_buffer();
        assert_eq!(buffer[0].content, "hello");
        assert_eq!(buffer[0].augmented.as_deref(), Some("context + hello"));
    }

    #[test]
    fn code_artifacts_land_in_the_code_collection() {
        let dir = tempdir().unwrap();
        let store = Arc::new(VectorStore::new(dir.path()).unwrap());
        let memory = manager(&store, "code", 20);
        memory
            .record_code_artifact("lib.py", "def f():\n    return 1\n")
            .unwrap();

        let records = store.get_all_records(memory.code_collection()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].metadata.get(META_FILENAME).map(String::as_str),
            Some("lib.py")
        );
        // The conversational collection is untouched.
        assert!(!store.collection_exists(memory.turns_collection()));
    }

    #[test]
    fn delete_memory_collection_drops_both_tiers() {
        let dir = tempdir().unwrap();
        let store = Arc::new(VectorStore::new(dir.path()).unwrap());
        let memory = manager(&store, "doomed", 20);
        memory.add_turn(Role::User, "x", None).unwrap();
        memory.delete_memory_collection().unwrap();
        assert!(!store.collection_exists(memory.turns_collection()));
        assert!(!store.collection_exists(memory.code_collection()));
    }
}
