//! Persistent vector collections.
//!
//! One SQLite file per collection under the store root. Embeddings are
//! stored next to each record as little-endian `f32` blobs and similarity
//! is computed in process; at the scale of one conversation per collection
//! a linear scan beats maintaining an index. Cross-process access (the
//! server plus the CLI inspector) is serialized by SQLite's own locking.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use phoenix_protocol::records::MemoryRecord;
use phoenix_protocol::records::Role;
use rusqlite::Connection;
use rusqlite::params;
use tracing::debug;
use tracing::warn;

use crate::embedding::cosine_similarity;
use crate::error::PhoenixErr;
use crate::error::Result;

const COLLECTION_FILE_SUFFIX: &str = ".sqlite3";

#[derive(Debug)]
pub struct VectorStore {
    root: PathBuf,
}

/// Collection names are produced by the session-name sanitizer, but the
/// inspection API accepts arbitrary client strings; both go through here.
pub fn is_valid_collection_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl VectorStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(VectorStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn db_path(&self, collection: &str) -> Result<PathBuf> {
        if !is_valid_collection_name(collection) {
            return Err(PhoenixErr::InvalidArgument(format!(
                "invalid collection name: {collection}"
            )));
        }
        Ok(self.root.join(format!("{collection}{COLLECTION_FILE_SUFFIX}")))
    }

    fn open(&self, collection: &str) -> Result<Connection> {
        let conn = Connection::open(self.db_path(collection)?)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                id        TEXT PRIMARY KEY,
                role      TEXT NOT NULL,
                content   TEXT NOT NULL,
                timestamp REAL NOT NULL,
                metadata  TEXT NOT NULL,
                embedding BLOB NOT NULL
            )",
            [],
        )?;
        Ok(conn)
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(name) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(COLLECTION_FILE_SUFFIX))
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn collection_exists(&self, collection: &str) -> bool {
        self.db_path(collection)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Dropping a collection that does not exist is not an error; delete is
    /// idempotent so session cleanup can always run.
    pub fn delete_collection(&self, collection: &str) -> Result<()> {
        let path = self.db_path(collection)?;
        if path.is_file() {
            fs::remove_file(&path)?;
            debug!(collection, "deleted collection");
        }
        Ok(())
    }

    pub fn add_record(
        &self,
        collection: &str,
        record: &MemoryRecord,
        embedding: &[f32],
    ) -> Result<()> {
        let conn = self.open(collection)?;
        let metadata = serde_json::to_string(&record.metadata)?;
        conn.execute(
            "INSERT INTO records (id, role, content, timestamp, metadata, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.role.to_string(),
                record.content,
                record.timestamp,
                metadata,
                encode_embedding(embedding),
            ],
        )?;
        Ok(())
    }

    /// All records sorted by timestamp ascending. Rows that fail validation
    /// back into [`MemoryRecord`] are dropped, with the count logged.
    pub fn get_all_records(&self, collection: &str) -> Result<Vec<MemoryRecord>> {
        Ok(self
            .load_rows(collection)?
            .into_iter()
            .map(|(record, _)| record)
            .collect())
    }

    /// Nearest-neighbor query: at most `min(k, count)` records, most similar
    /// first, ties broken by timestamp.
    pub fn query(&self, collection: &str, embedding: &[f32], k: usize) -> Result<Vec<MemoryRecord>> {
        let rows = self.load_rows(collection)?;
        let mut scored: Vec<(f32, MemoryRecord)> = rows
            .into_iter()
            .map(|(record, stored)| (cosine_similarity(embedding, &stored), record))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.1.timestamp
                        .partial_cmp(&b.1.timestamp)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        Ok(scored.into_iter().take(k).map(|(_, r)| r).collect())
    }

    pub fn update_records_metadata(
        &self,
        collection: &str,
        ids: &[String],
        metadata: &[HashMap<String, String>],
    ) -> Result<()> {
        if ids.len() != metadata.len() {
            return Err(PhoenixErr::InvalidArgument(
                "ids and metadata lists must have equal length".to_string(),
            ));
        }
        let conn = self.open(collection)?;
        for (id, meta) in ids.iter().zip(metadata) {
            let encoded = serde_json::to_string(meta)?;
            let updated = conn.execute(
                "UPDATE records SET metadata = ?1 WHERE id = ?2",
                params![encoded, id],
            )?;
            if updated == 0 {
                return Err(PhoenixErr::NotFound(format!(
                    "record {id} not in collection {collection}"
                )));
            }
        }
        Ok(())
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        let conn = self.open(collection)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn load_rows(&self, collection: &str) -> Result<Vec<(MemoryRecord, Vec<f32>)>> {
        let conn = self.open(collection)?;
        let mut stmt = conn.prepare(
            "SELECT id, role, content, timestamp, metadata, embedding
             FROM records ORDER BY timestamp ASC",
        )?;
        let raw_rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Vec<u8>>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        let mut dropped = 0usize;
        for raw in raw_rows {
            let (id, role, content, timestamp, metadata, blob) = raw?;
            match validate_row(id, &role, content, timestamp, &metadata) {
                Some(record) => records.push((record, decode_embedding(&blob))),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            warn!(collection, dropped, "dropped invalid records during load");
        }
        Ok(records)
    }
}

fn validate_row(
    id: String,
    role: &str,
    content: String,
    timestamp: f64,
    metadata: &str,
) -> Option<MemoryRecord> {
    if id.is_empty() || !timestamp.is_finite() {
        return None;
    }
    let role: Role = role.parse().ok()?;
    let metadata: HashMap<String, String> = serde_json::from_str(metadata).ok()?;
    Some(MemoryRecord {
        id,
        role,
        content,
        timestamp,
        metadata,
    })
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
