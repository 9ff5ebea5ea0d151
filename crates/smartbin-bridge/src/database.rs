//! Remote database seam
//!
//! The bridge needs exactly two operations from its real-time database:
//! a shallow merge into the bin's state node and an append that generates a
//! child id under the logs node. [`RemoteDatabase`] captures those, and
//! adapters decide how they map to a vendor API.
//!
//! [`MemoryDatabase`] keeps a document tree in process with the same merge,
//! append and path rules as a Firebase realtime database. The node binary
//! uses it as a local sink and the tests use it as a fake.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::reading::LogEntry;

/// Characters a path segment may not contain
const FORBIDDEN_PATH_CHARS: &[char] = &['.', '$', '#', '[', ']'];

/// Remote real-time database used by the uplink
///
/// Implementations report retryable conditions as
/// [`BridgeError::TransientRemote`] and everything else as
/// [`BridgeError::PermanentRemote`].
#[async_trait]
pub trait RemoteDatabase: Send + Sync {
    /// Overwrite the given top-level children of `path`, leaving others
    async fn merge_update(&self, path: &str, partial: &Map<String, Value>) -> Result<()>;

    /// Append a record under `path` and return its generated id
    async fn append_log_entry(&self, path: &str, record: &LogEntry) -> Result<String>;

    /// Backend name (for logging)
    fn name(&self) -> &str;
}

#[async_trait]
impl<D: RemoteDatabase + ?Sized> RemoteDatabase for Arc<D> {
    async fn merge_update(&self, path: &str, partial: &Map<String, Value>) -> Result<()> {
        (**self).merge_update(path, partial).await
    }

    async fn append_log_entry(&self, path: &str, record: &LogEntry) -> Result<String> {
        (**self).append_log_entry(path, record).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Split and check a database path
pub fn validate_path(path: &str) -> Result<Vec<&str>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(BridgeError::PermanentRemote(
            "database path is empty".to_string(),
        ));
    }

    let segments: Vec<&str> = trimmed.split('/').collect();
    for segment in &segments {
        if segment.is_empty() {
            return Err(BridgeError::PermanentRemote(format!(
                "empty segment in path {:?}",
                path
            )));
        }
        if segment.contains(FORBIDDEN_PATH_CHARS) {
            return Err(BridgeError::PermanentRemote(format!(
                "illegal character in path {:?}",
                path
            )));
        }
    }
    Ok(segments)
}

/// In-process document store with realtime-database semantics
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    root: RwLock<Map<String, Value>>,
    /// Append order per logs path, since generated ids are not sortable
    appended: RwLock<BTreeMap<String, Vec<String>>>,
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored at `path`, if any
    pub fn get(&self, path: &str) -> Option<Value> {
        let segments = validate_path(path).ok()?;
        let root = self.root.read();
        let mut node = root.get(segments[0])?;
        for segment in &segments[1..] {
            node = node.as_object()?.get(*segment)?;
        }
        Some(node.clone())
    }

    /// Whole tree as a JSON value
    pub fn snapshot(&self) -> Value {
        Value::Object(self.root.read().clone())
    }

    /// Records appended under `path`, oldest first
    pub fn log_entries(&self, path: &str) -> Vec<LogEntry> {
        let Some(Value::Object(children)) = self.get(path) else {
            return Vec::new();
        };
        let order = self.appended.read();
        order
            .get(path.trim_matches('/'))
            .into_iter()
            .flatten()
            .filter_map(|id| children.get(id))
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect()
    }

    /// Object node at `segments`, replacing leaves along the way
    fn node_mut<'a>(
        root: &'a mut Map<String, Value>,
        segments: &[&str],
    ) -> Result<&'a mut Map<String, Value>> {
        let mut node = root;
        for segment in segments {
            let child = node
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            node = child.as_object_mut().ok_or_else(|| {
                BridgeError::Internal(format!("node {:?} is not an object", segment))
            })?;
        }
        Ok(node)
    }
}

#[async_trait]
impl RemoteDatabase for MemoryDatabase {
    async fn merge_update(&self, path: &str, partial: &Map<String, Value>) -> Result<()> {
        let segments = validate_path(path)?;
        for key in partial.keys() {
            validate_path(key)?;
        }

        let mut root = self.root.write();
        let node = Self::node_mut(&mut root, &segments)?;
        for (key, value) in partial {
            node.insert(key.clone(), value.clone());
        }
        debug!(path, keys = partial.len(), "Merged state update");
        Ok(())
    }

    async fn append_log_entry(&self, path: &str, record: &LogEntry) -> Result<String> {
        let segments = validate_path(path)?;
        let value = serde_json::to_value(record)
            .map_err(|e| BridgeError::PermanentRemote(format!("unserializable record: {}", e)))?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        {
            let mut root = self.root.write();
            let node = Self::node_mut(&mut root, &segments)?;
            node.insert(id.clone(), value);
        }
        self.appended
            .write()
            .entry(segments.join("/"))
            .or_default()
            .push(id.clone());

        debug!(path, id = %id, "Appended log entry");
        Ok(id)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
