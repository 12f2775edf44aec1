//! Subscription state shared with hosts.

use std::fmt;

/// Lifecycle of the synchronizer's subscription to the active list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncState {
    /// No identity, no list, or the last start attempt failed
    #[default]
    Unsubscribed,
    /// Resolving the list and running bulk reconciliation
    Initializing,
    /// Reconciled; incremental listeners installed
    Subscribed,
}

impl SyncState {
    pub const fn is_subscribed(self) -> bool {
        matches!(self, Self::Subscribed)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unsubscribed => "unsubscribed",
            Self::Initializing => "initializing",
            Self::Subscribed => "subscribed",
        })
    }
}
