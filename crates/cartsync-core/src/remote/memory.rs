//! In-process realtime tree implementing [`RemoteStore`].
//!
//! Used by tests and the CLI demo to stand in for a hosted realtime
//! database. Listeners are invoked synchronously while the tree lock is held,
//! which keeps delivery order identical to write order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{
    ChildEvent, ChildListener, RemoteDocument, RemotePath, RemoteResult, RemoteStore,
    ValueListener, WatchId,
};
use crate::error::RemoteError;

struct ChildWatcher {
    id: WatchId,
    path: RemotePath,
    listener: Arc<dyn ChildListener>,
}

struct ValueWatcher {
    id: WatchId,
    path: RemotePath,
    listener: Arc<dyn ValueListener>,
}

#[derive(Default)]
struct Inner {
    root: Value,
    child_watchers: Vec<ChildWatcher>,
    value_watchers: Vec<ValueWatcher>,
    next_watch: u64,
    offline: bool,
    denied: Vec<RemotePath>,
    writes: u64,
}

/// Shared in-memory remote replica
#[derive(Default)]
pub struct MemoryRemoteStore {
    inner: Mutex<Inner>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate losing or regaining connectivity
    pub fn set_online(&self, online: bool) {
        self.lock().offline = !online;
    }

    pub fn is_online(&self) -> bool {
        !self.lock().offline
    }

    /// Reject every operation at or below `path`
    pub fn deny(&self, path: RemotePath) {
        self.lock().denied.push(path);
    }

    /// Lift a previous [`deny`](Self::deny)
    pub fn allow(&self, path: &RemotePath) {
        self.lock().denied.retain(|denied| denied != path);
    }

    /// Number of successful `set`/`remove` calls so far
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    /// Number of registered listeners whose path overlaps `path`
    pub fn listener_count(&self, path: &RemotePath) -> usize {
        let inner = self.lock();
        inner
            .child_watchers
            .iter()
            .filter(|watcher| watcher.path.overlaps(path))
            .count()
            + inner
                .value_watchers
                .iter()
                .filter(|watcher| watcher.path.overlaps(path))
                .count()
    }

    /// Read a node ignoring connectivity and permissions
    pub fn peek(&self, path: &RemotePath) -> Option<Value> {
        node(&self.lock().root, path).cloned()
    }

    fn write(&self, path: &RemotePath, value: Option<Value>) -> RemoteResult<()> {
        let mut inner = self.lock();
        inner.check_access(path)?;

        let child_before = inner
            .child_watchers
            .iter()
            .filter(|watcher| watcher.path.overlaps(path))
            .map(|watcher| {
                (
                    Arc::clone(&watcher.listener),
                    watcher.path.clone(),
                    children_of(&inner.root, &watcher.path),
                )
            })
            .collect::<Vec<_>>();
        let value_before = inner
            .value_watchers
            .iter()
            .filter(|watcher| watcher.path.overlaps(path))
            .map(|watcher| {
                (
                    Arc::clone(&watcher.listener),
                    watcher.path.clone(),
                    node(&inner.root, &watcher.path).cloned(),
                )
            })
            .collect::<Vec<_>>();

        write_node(&mut inner.root, path.segments(), value.and_then(prune));
        inner.writes += 1;

        for (listener, watched, before) in child_before {
            let after = children_of(&inner.root, &watched);
            for event in diff_children(&watched, &before, &after) {
                listener.on_child(event);
            }
        }
        for (listener, watched, before) in value_before {
            let after = node(&inner.root, &watched).cloned();
            if after != before {
                listener.on_value(after);
            }
        }
        Ok(())
    }
}

impl Inner {
    fn check_access(&self, path: &RemotePath) -> RemoteResult<()> {
        if self.offline {
            return Err(RemoteError::Unavailable);
        }
        self.check_permission(path)
    }

    fn check_permission(&self, path: &RemotePath) -> RemoteResult<()> {
        if self.denied.iter().any(|denied| path.starts_with(denied)) {
            return Err(RemoteError::PermissionDenied(path.to_string()));
        }
        Ok(())
    }

    fn next_watch_id(&mut self) -> WatchId {
        self.next_watch += 1;
        WatchId(self.next_watch)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, path: &RemotePath) -> RemoteResult<Option<Value>> {
        let inner = self.lock();
        inner.check_access(path)?;
        Ok(node(&inner.root, path).cloned())
    }

    async fn set(&self, path: &RemotePath, value: Value) -> RemoteResult<()> {
        self.write(path, Some(value))
    }

    async fn remove(&self, path: &RemotePath) -> RemoteResult<()> {
        self.write(path, None)
    }

    async fn children(&self, path: &RemotePath) -> RemoteResult<Vec<RemoteDocument>> {
        let inner = self.lock();
        inner.check_access(path)?;
        children_of(&inner.root, path)
            .into_iter()
            .map(|(key, value)| into_document(path, key, value))
            .collect()
    }

    async fn query_by_child(
        &self,
        path: &RemotePath,
        field: &str,
        value: &Value,
    ) -> RemoteResult<Vec<RemoteDocument>> {
        let documents = self.children(path).await?;
        Ok(documents
            .into_iter()
            .filter(|document| document.fields.get(field) == Some(value))
            .collect())
    }

    fn new_key(&self) -> String {
        Uuid::now_v7().to_string()
    }

    fn listen_children(
        &self,
        path: &RemotePath,
        listener: Arc<dyn ChildListener>,
    ) -> RemoteResult<WatchId> {
        let mut inner = self.lock();
        inner.check_permission(path)?;
        let id = inner.next_watch_id();

        for (key, value) in children_of(&inner.root, path) {
            if let Some(document) = as_document(key, value) {
                listener.on_child(ChildEvent::Added(document));
            }
        }
        inner.child_watchers.push(ChildWatcher {
            id,
            path: path.clone(),
            listener,
        });
        Ok(id)
    }

    fn listen_value(
        &self,
        path: &RemotePath,
        listener: Arc<dyn ValueListener>,
    ) -> RemoteResult<WatchId> {
        let mut inner = self.lock();
        inner.check_permission(path)?;
        let id = inner.next_watch_id();

        listener.on_value(node(&inner.root, path).cloned());
        inner.value_watchers.push(ValueWatcher {
            id,
            path: path.clone(),
            listener,
        });
        Ok(id)
    }

    fn unlisten(&self, id: WatchId) {
        let mut inner = self.lock();
        inner.child_watchers.retain(|watcher| watcher.id != id);
        inner.value_watchers.retain(|watcher| watcher.id != id);
    }
}

fn node<'a>(root: &'a Value, path: &RemotePath) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.segments() {
        current = current.as_object()?.get(segment)?;
    }
    if is_empty(current) {
        None
    } else {
        Some(current)
    }
}

fn children_of(root: &Value, path: &RemotePath) -> Map<String, Value> {
    node(root, path)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Drop nulls and empty objects; `None` when nothing is left
fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let map = map
                .into_iter()
                .filter_map(|(key, value)| prune(value).map(|value| (key, value)))
                .collect::<Map<_, _>>();
            if map.is_empty() {
                None
            } else {
                Some(Value::Object(map))
            }
        }
        other => Some(other),
    }
}

fn write_node(current: &mut Value, segments: &[String], value: Option<Value>) {
    let Some((head, rest)) = segments.split_first() else {
        *current = value.unwrap_or(Value::Null);
        return;
    };

    if !current.is_object() {
        if value.is_none() {
            return;
        }
        *current = Value::Object(Map::new());
    }
    let Value::Object(map) = current else {
        return;
    };

    if rest.is_empty() {
        match value {
            Some(value) => {
                map.insert(head.clone(), value);
            }
            None => {
                map.remove(head);
            }
        }
        return;
    }

    if value.is_none() && !map.contains_key(head) {
        return;
    }
    let child = map
        .entry(head.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    write_node(child, rest, value);
    if is_empty(child) {
        map.remove(head);
    }
}

fn as_document(key: String, value: Value) -> Option<RemoteDocument> {
    match value {
        Value::Object(fields) => Some(RemoteDocument::new(key, fields)),
        other => {
            tracing::warn!("Ignoring non-document child {key}: {other}");
            None
        }
    }
}

fn into_document(parent: &RemotePath, key: String, value: Value) -> RemoteResult<RemoteDocument> {
    match value {
        Value::Object(fields) => Ok(RemoteDocument::new(key, fields)),
        _ => Err(RemoteError::Malformed {
            path: format!("{parent}/{key}"),
            reason: "expected an object".to_string(),
        }),
    }
}

fn diff_children(
    watched: &RemotePath,
    before: &Map<String, Value>,
    after: &Map<String, Value>,
) -> Vec<ChildEvent> {
    let mut events = Vec::new();
    for (key, old) in before {
        match after.get(key) {
            None => {
                if let Some(document) = as_document(key.clone(), old.clone()) {
                    events.push(ChildEvent::Removed(document));
                }
            }
            Some(new) if new != old => {
                if let Some(document) = as_document(key.clone(), new.clone()) {
                    events.push(ChildEvent::Changed(document));
                }
            }
            Some(_) => {}
        }
    }
    for (key, new) in after {
        if !before.contains_key(key) {
            if let Some(document) = as_document(key.clone(), new.clone()) {
                events.push(ChildEvent::Added(document));
            }
        }
    }
    if !events.is_empty() {
        tracing::trace!("{} child event(s) under {watched}", events.len());
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn path(raw: &str) -> RemotePath {
        RemotePath::parse(raw).unwrap()
    }

    fn collect_children(store: &MemoryRemoteStore, at: &str) -> Arc<Mutex<Vec<ChildEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store
            .listen_children(
                &path(at),
                Arc::new(move |event: ChildEvent| sink.lock().unwrap().push(event)),
            )
            .unwrap();
        seen
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_get_and_prune_on_remove() {
        let store = MemoryRemoteStore::new();
        store
            .set(&path("lists/l1/categories/a"), json!({"name": "Fruit"}))
            .await
            .unwrap();
        assert_eq!(
            store.get(&path("lists/l1/categories/a/name")).await.unwrap(),
            Some(json!("Fruit"))
        );

        store.remove(&path("lists/l1/categories/a")).await.unwrap();
        assert_eq!(store.get(&path("lists/l1")).await.unwrap(), None);
        assert_eq!(store.peek(&path("lists")), None);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn child_listener_sees_replay_then_changes() {
        let store = MemoryRemoteStore::new();
        store
            .set(&path("lists/l1/products/a"), json!({"name": "Milk"}))
            .await
            .unwrap();

        let seen = collect_children(&store, "lists/l1/products");
        store
            .set(&path("lists/l1/products/b"), json!({"name": "Eggs"}))
            .await
            .unwrap();
        store
            .set(&path("lists/l1/products/a/name"), json!("Oat milk"))
            .await
            .unwrap();
        store.remove(&path("lists/l1/products/b")).await.unwrap();

        let keys = seen
            .lock()
            .unwrap()
            .iter()
            .map(|event| match event {
                ChildEvent::Added(doc) => format!("+{}", doc.key),
                ChildEvent::Changed(doc) => format!("~{}", doc.key),
                ChildEvent::Removed(doc) => format!("-{}", doc.key),
            })
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["+a", "+b", "~a", "-b"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removing_parent_reports_removed_children() {
        let store = MemoryRemoteStore::new();
        store
            .set(&path("lists/l1/products/a"), json!({"name": "Milk"}))
            .await
            .unwrap();
        let seen = collect_children(&store, "lists/l1/products");

        store.remove(&path("lists/l1")).await.unwrap();

        let events = seen.lock().unwrap();
        assert!(matches!(events.last(), Some(ChildEvent::Removed(doc)) if doc.key == "a"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn value_listener_fires_on_change_only() {
        let store = MemoryRemoteStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = store
            .listen_value(
                &path("users/u1/listId"),
                Arc::new(move |value: Option<Value>| sink.lock().unwrap().push(value)),
            )
            .unwrap();

        store.set(&path("users/u1/listId"), json!("l1")).await.unwrap();
        store.set(&path("users/u1/listId"), json!("l1")).await.unwrap();
        store.set(&path("users/u1/listId"), json!("l2")).await.unwrap();
        store.unlisten(id);
        store.set(&path("users/u1/listId"), json!("l3")).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![None, Some(json!("l1")), Some(json!("l2"))]
        );
        assert_eq!(store.listener_count(&path("users/u1")), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_and_denied_paths_fail() {
        let store = MemoryRemoteStore::new();
        store.set_online(false);
        assert_eq!(
            store.get(&path("lists/l1")).await,
            Err(RemoteError::Unavailable)
        );
        store.set_online(true);

        store.deny(path("lists/secret"));
        assert!(matches!(
            store.set(&path("lists/secret/products/a"), json!({"x": 1})).await,
            Err(RemoteError::PermissionDenied(_))
        ));
        assert!(store.get(&path("lists/open")).await.is_ok());
        store.allow(&path("lists/secret"));
        assert!(store.get(&path("lists/secret")).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn query_by_child_filters_in_key_order() {
        let store = MemoryRemoteStore::new();
        for (key, natural_id) in [("c", "milk"), ("a", "milk"), ("b", "eggs")] {
            store
                .set(
                    &path(&format!("lists/l1/products/{key}")),
                    json!({ "naturalId": natural_id }),
                )
                .await
                .unwrap();
        }

        let matches = store
            .query_by_child(&path("lists/l1/products"), "naturalId", &json!("milk"))
            .await
            .unwrap();
        let keys = matches.iter().map(|doc| doc.key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn new_keys_are_unique() {
        let store = MemoryRemoteStore::new();
        let first = store.new_key();
        let second = store.new_key();
        assert_ne!(first, second);
    }
}
