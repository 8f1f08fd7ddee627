//! Persisted conversation records.
//!
//! A [`MemoryRecord`] is immutable once stored. Within a collection, records
//! are totally ordered by `timestamp` and `id` is unique.

use std::collections::HashMap;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use uuid::Uuid;

/// Metadata key under which a user turn remembers the retrieval-augmented
/// prompt the model actually saw.
pub const META_AUGMENTED_PROMPT: &str = "augmented_prompt";
/// Metadata key naming the tool that produced an observation turn.
pub const META_TOOL_NAME: &str = "tool_name";
/// Metadata key flagging a summarization record.
pub const META_IS_SUMMARY: &str = "is_summary";
/// Metadata key naming the sandbox file a code-artifact record captures.
pub const META_FILENAME: &str = "filename";

/// Who produced a turn.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    User,
    Model,
    ToolObservation,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "model" => Ok(Role::Model),
            "tool_observation" => Ok(Role::ToolObservation),
            other => Err(format!("unrecognized role: {other}")),
        }
    }
}

/// One stored turn of a session.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MemoryRecord {
    /// Opaque unique id within the collection.
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Seconds since the epoch; strictly increasing within a session so the
    /// stored order is recoverable.
    pub timestamp: f64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl MemoryRecord {
    pub fn new(role: Role, content: impl Into<String>, timestamp: f64) -> Self {
        MemoryRecord {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn role_round_trips_through_str() {
        for role in [Role::User, Role::Model, Role::ToolObservation] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
        assert!("narrator".parse::<Role>().is_err());
    }

    #[test]
    fn records_get_unique_ids() {
        let a = MemoryRecord::new(Role::User, "x", 1.0);
        let b = MemoryRecord::new(Role::User, "x", 1.0);
        assert_ne!(a.id, b.id);
    }
}
