//! Change notifications emitted by the local store

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::models::{EntityKind, EntityRef};

/// What happened to a local entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    Added,
    Changed,
    Removed,
}

/// A committed mutation of one local entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalChange {
    pub entity: EntityRef,
    pub op: ChangeOp,
}

impl LocalChange {
    #[must_use]
    pub const fn new(entity: EntityRef, op: ChangeOp) -> Self {
        Self { entity, op }
    }
}

/// Receives local store notifications.
///
/// Called on whatever thread performed the mutation, after the connection
/// lock has been released. Implementations must not block.
pub trait EntityListener: Send + Sync {
    fn on_change(&self, change: LocalChange);
}

impl<F> EntityListener for F
where
    F: Fn(LocalChange) + Send + Sync,
{
    fn on_change(&self, change: LocalChange) {
        self(change);
    }
}

/// Handle returned when registering a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    kind: EntityKind,
    listener: Arc<dyn EntityListener>,
}

/// Per-kind listener table owned by a store
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    registrations: Mutex<Vec<Registration>>,
}

impl ListenerRegistry {
    pub fn add(&self, kind: EntityKind, listener: Arc<dyn EntityListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration { id, kind, listener });
        id
    }

    /// Returns false when the id was not registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|registration| registration.id != id);
        registrations.len() != before
    }

    pub fn notify(&self, change: LocalChange) {
        let listeners = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|registration| registration.kind == change.entity.kind)
            .map(|registration| Arc::clone(&registration.listener))
            .collect::<Vec<_>>();

        for listener in listeners {
            listener.on_change(change);
        }
    }
}
