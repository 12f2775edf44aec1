//! Remote hierarchical document store.
//!
//! The remote replica is a realtime key/value tree: every node is addressed
//! by a [`RemotePath`] and clients can watch a node's children or its value.
//! Entity documents live at `lists/{listId}/{segment}/{remoteId}` and are
//! JSON objects.

mod memory;
mod path;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RemoteError;

pub use memory::MemoryRemoteStore;
pub use path::RemotePath;

/// Result type for remote operations
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Body of a remote document
pub type FieldMap = serde_json::Map<String, Value>;

/// A child node of a watched collection
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    /// Child key (the remote id)
    pub key: String,
    pub fields: FieldMap,
}

impl RemoteDocument {
    pub fn new(key: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }
}

/// Child-level change of a watched node
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    Added(RemoteDocument),
    Changed(RemoteDocument),
    /// Carries the last known value of the removed child
    Removed(RemoteDocument),
}

impl ChildEvent {
    pub const fn document(&self) -> &RemoteDocument {
        match self {
            Self::Added(document) | Self::Changed(document) | Self::Removed(document) => document,
        }
    }
}

/// Receives child events. Must not block or call back into the store.
pub trait ChildListener: Send + Sync {
    fn on_child(&self, event: ChildEvent);
}

impl<F> ChildListener for F
where
    F: Fn(ChildEvent) + Send + Sync,
{
    fn on_child(&self, event: ChildEvent) {
        self(event);
    }
}

/// Receives value changes of a node (`None` once the node is gone).
/// Must not block or call back into the store.
pub trait ValueListener: Send + Sync {
    fn on_value(&self, value: Option<Value>);
}

impl<F> ValueListener for F
where
    F: Fn(Option<Value>) + Send + Sync,
{
    fn on_value(&self, value: Option<Value>) {
        self(value);
    }
}

/// Handle of a registered remote listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub(crate) u64);

/// Operations the synchronizer needs from the remote replica.
///
/// Child listeners receive an `Added` event for every existing child when
/// they are registered; value listeners receive the current value.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read a node; `None` when absent
    async fn get(&self, path: &RemotePath) -> RemoteResult<Option<Value>>;

    /// Replace a node. Writing `null` or an empty object removes it.
    async fn set(&self, path: &RemotePath, value: Value) -> RemoteResult<()>;

    /// Remove a node and everything below it
    async fn remove(&self, path: &RemotePath) -> RemoteResult<()>;

    /// Snapshot of a node's children, ordered by key
    async fn children(&self, path: &RemotePath) -> RemoteResult<Vec<RemoteDocument>>;

    /// Children whose `field` equals `value`, ordered by key
    async fn query_by_child(
        &self,
        path: &RemotePath,
        field: &str,
        value: &Value,
    ) -> RemoteResult<Vec<RemoteDocument>>;

    /// Fresh, time-ordered child key
    fn new_key(&self) -> String;

    fn listen_children(
        &self,
        path: &RemotePath,
        listener: Arc<dyn ChildListener>,
    ) -> RemoteResult<WatchId>;

    fn listen_value(
        &self,
        path: &RemotePath,
        listener: Arc<dyn ValueListener>,
    ) -> RemoteResult<WatchId>;

    /// Cancel a listener. Unknown ids are ignored.
    fn unlisten(&self, id: WatchId);
}
