//! In-flight suppression markers.
//!
//! When the remote worker writes to the local store, the store notifies the
//! local listener, which would push the same change straight back. The
//! remote worker sets a marker before each such write and the local worker
//! consumes it when the echo arrives. Markers are counted so that two quick
//! writes to one entity suppress exactly two echoes.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use crate::models::{EntityKind, EntityRef};

#[derive(Debug, Default)]
pub struct SuppressionMarkers {
    written_from_remote: Mutex<HashMap<EntityRef, usize>>,
    created_from_remote: Mutex<HashMap<(EntityKind, String), usize>>,
    removing: Mutex<HashSet<(EntityKind, String)>>,
}

impl SuppressionMarkers {
    pub fn mark_written(&self, entity: EntityRef) {
        increment(&self.written_from_remote, entity);
    }

    /// Consume one written-from-remote marker
    pub fn take_written(&self, entity: EntityRef) -> bool {
        decrement(&self.written_from_remote, &entity)
    }

    pub fn mark_created(&self, kind: EntityKind, natural_id: &str) {
        increment(&self.created_from_remote, (kind, natural_id.to_string()));
    }

    /// Consume one created-from-remote marker
    pub fn take_created(&self, kind: EntityKind, natural_id: &str) -> bool {
        decrement(&self.created_from_remote, &(kind, natural_id.to_string()))
    }

    pub fn mark_removing(&self, kind: EntityKind, remote_id: &str) {
        lock(&self.removing).insert((kind, remote_id.to_string()));
    }

    pub fn is_removing(&self, kind: EntityKind, remote_id: &str) -> bool {
        lock(&self.removing).contains(&(kind, remote_id.to_string()))
    }

    /// Consume the removal-in-progress tag of a remote document
    pub fn take_removing(&self, kind: EntityKind, remote_id: &str) -> bool {
        lock(&self.removing).remove(&(kind, remote_id.to_string()))
    }

    pub fn clear(&self) {
        lock(&self.written_from_remote).clear();
        lock(&self.created_from_remote).clear();
        lock(&self.removing).clear();
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.written_from_remote).is_empty()
            && lock(&self.created_from_remote).is_empty()
            && lock(&self.removing).is_empty()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn increment<K: Eq + Hash>(counts: &Mutex<HashMap<K, usize>>, key: K) {
    *lock(counts).entry(key).or_insert(0) += 1;
}

fn decrement<K: Eq + Hash>(counts: &Mutex<HashMap<K, usize>>, key: &K) -> bool {
    let mut counts = lock(counts);
    match counts.get_mut(key) {
        Some(count) if *count > 1 => {
            *count -= 1;
            true
        }
        Some(_) => {
            counts.remove(key);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LocalId;

    #[test]
    fn written_markers_are_counted() {
        let markers = SuppressionMarkers::default();
        let entity = EntityRef::new(EntityKind::Product, LocalId::new(3));
        markers.mark_written(entity);
        markers.mark_written(entity);
        assert!(markers.take_written(entity));
        assert!(markers.take_written(entity));
        assert!(!markers.take_written(entity));
        assert!(markers.is_empty());
    }

    #[test]
    fn created_markers_are_scoped_by_kind() {
        let markers = SuppressionMarkers::default();
        markers.mark_created(EntityKind::Category, "fruit");
        assert!(!markers.take_created(EntityKind::Product, "fruit"));
        assert!(markers.take_created(EntityKind::Category, "fruit"));
    }

    #[test]
    fn clear_drops_everything() {
        let markers = SuppressionMarkers::default();
        markers.mark_removing(EntityKind::ShopItem, "k1");
        markers.mark_created(EntityKind::Category, "fruit");
        assert!(markers.is_removing(EntityKind::ShopItem, "k1"));
        markers.clear();
        assert!(markers.is_empty());
        assert!(!markers.take_removing(EntityKind::ShopItem, "k1"));
    }
}
