//! Signed-in identity as seen by the synchronizer.
//!
//! Authentication itself happens elsewhere; the synchronizer only needs to
//! know who is signed in, whether that identity is verified, and when either
//! changes.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::util::normalize_text_option;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user id, used as the `users/{uid}` key
    pub uid: String,
    pub email: Option<String>,
    /// False while e.g. an email confirmation is pending
    pub verified: bool,
}

impl Identity {
    pub fn new(uid: impl Into<String>) -> Result<Self> {
        let uid = normalize_text_option(Some(uid.into()))
            .ok_or_else(|| Error::InvalidInput("identity uid must not be empty".to_string()))?;
        if uid.contains('/') {
            return Err(Error::InvalidInput(format!(
                "identity uid must not contain '/': {uid}"
            )));
        }
        Ok(Self {
            uid,
            email: None,
            verified: true,
        })
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = normalize_text_option(Some(email.into()));
        self
    }

    #[must_use]
    pub const fn unverified(mut self) -> Self {
        self.verified = false;
        self
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Identity")
            .field("uid", &self.uid)
            .field("email", &self.email.as_ref().map(|_| "[REDACTED]"))
            .field("verified", &self.verified)
            .finish()
    }
}

/// Source of the current identity
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Currently signed-in identity, if any
    fn current(&self) -> Option<Identity>;

    /// Observe sign-in, sign-out and verification changes
    fn subscribe(&self) -> watch::Receiver<Option<Identity>>;

    /// Re-fetch the identity from its authority (used to poll for
    /// verification) and publish the result
    async fn refresh(&self) -> Result<Option<Identity>>;
}

/// In-process identity provider driven by the host application
pub struct LocalIdentityProvider {
    sender: watch::Sender<Option<Identity>>,
}

impl Default for LocalIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalIdentityProvider {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    pub fn sign_in(&self, identity: Identity) {
        tracing::info!("Identity {} signed in", identity.uid);
        self.sender.send_replace(Some(identity));
    }

    pub fn sign_out(&self) {
        if let Some(previous) = self.sender.send_replace(None) {
            tracing::info!("Identity {} signed out", previous.uid);
        }
    }

    /// Mark the current identity verified. Returns false when nobody is
    /// signed in.
    pub fn mark_verified(&self) -> bool {
        self.sender.send_if_modified(|current| match current {
            Some(identity) if !identity.verified => {
                identity.verified = true;
                true
            }
            _ => false,
        });
        self.sender.borrow().is_some()
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    fn current(&self) -> Option<Identity> {
        self.sender.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.sender.subscribe()
    }

    async fn refresh(&self) -> Result<Option<Identity>> {
        Ok(self.current())
    }
}
