//! Failure reporting to the host

use crate::error::Error;
use crate::models::EntityRef;

/// Receives synchronization failures. Called from the synchronizer's
/// background tasks; implementations must not block.
pub trait FailureListener: Send + Sync {
    /// The active list could not be resolved or bulk reconciliation failed
    fn synchronization_start_failed(&self, error: &Error);

    /// Writing one entity to the remote store failed
    fn update_server_entity_failed(&self, entity: EntityRef, error: &Error);

    /// Applying one remote notification failed
    fn server_notification_failed(&self, error: &Error);
}

/// Default listener that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFailureListener;

impl FailureListener for LoggingFailureListener {
    fn synchronization_start_failed(&self, error: &Error) {
        tracing::error!("Synchronization failed to start: {error}");
    }

    fn update_server_entity_failed(&self, entity: EntityRef, error: &Error) {
        tracing::error!("Failed to update remote copy of {entity}: {error}");
    }

    fn server_notification_failed(&self, error: &Error) {
        tracing::error!("Failed to apply remote change: {error}");
    }
}
