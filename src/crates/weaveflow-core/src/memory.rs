//! Pluggable memory adapter.
//!
//! The engine treats memory as an externally synchronized collaborator:
//! agent nodes may query it for context and store their turns, but the
//! engine never owns its persistence. [`InMemoryMemory`] is the testing
//! implementation; semantic/vector backends plug in behind the same trait.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A stored memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: None,
            text: text.into(),
            metadata: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Query over stored memories.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    /// Text to match; semantics are adapter-defined (the in-memory adapter
    /// does case-insensitive substring matching).
    pub text: Option<String>,
    pub limit: Option<usize>,
    /// Metadata filter; adapter-defined semantics.
    pub filter: Option<Value>,
    pub session_id: Option<String>,
}

/// Memory collaborator interface.
#[async_trait]
pub trait MemoryAdapter: Send + Sync {
    async fn store(&self, entry: MemoryEntry);

    async fn query(&self, query: MemoryQuery) -> Vec<MemoryEntry>;

    async fn delete(&self, id: &str);

    /// Clear one session's entries, or everything when `session_id` is None.
    async fn clear(&self, session_id: Option<&str>);
}

/// Vec-backed adapter for tests and small sessions.
#[derive(Debug, Default)]
pub struct InMemoryMemory {
    entries: RwLock<Vec<MemoryEntry>>,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryAdapter for InMemoryMemory {
    async fn store(&self, entry: MemoryEntry) {
        self.entries.write().unwrap().push(entry);
    }

    async fn query(&self, query: MemoryQuery) -> Vec<MemoryEntry> {
        let entries = self.entries.read().unwrap();
        let needle = query.text.as_deref().map(str::to_lowercase);
        let mut hits: Vec<MemoryEntry> = entries
            .iter()
            .filter(|e| match (&query.session_id, &e.session_id) {
                (Some(wanted), Some(actual)) => wanted == actual,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .filter(|e| match &needle {
                Some(text) => e.text.to_lowercase().contains(text),
                None => true,
            })
            .cloned()
            .collect();

        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        hits
    }

    async fn delete(&self, id: &str) {
        self.entries.write().unwrap().retain(|e| e.id != id);
    }

    async fn clear(&self, session_id: Option<&str>) {
        let mut entries = self.entries.write().unwrap();
        match session_id {
            Some(session) => entries.retain(|e| e.session_id.as_deref() != Some(session)),
            None => entries.clear(),
        }
    }
}
