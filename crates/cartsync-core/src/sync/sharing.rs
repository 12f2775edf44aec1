//! Sharing a list between identities.
//!
//! An offer lives at `share/{recipient}/{sender}` and holds the sender's list
//! id. Accepting it moves the recipient's `users/{uid}/listId` pointer; a
//! running synchronizer sees the pointer move and re-synchronizes against
//! the shared list.

use serde_json::Value;

use crate::error::{Error, RemoteError, Result};
use crate::remote::{RemotePath, RemoteStore};

/// A list another identity offered to share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffer {
    pub from_uid: String,
    pub list_id: String,
}

/// List the identity is currently attached to, if any
pub async fn current_list(remote: &dyn RemoteStore, uid: &str) -> Result<Option<String>> {
    let pointer = RemotePath::list_pointer(uid)?;
    match remote.get(&pointer).await? {
        None => Ok(None),
        Some(Value::String(list_id)) => Ok(Some(list_id)),
        Some(other) => Err(malformed(&pointer, &other)),
    }
}

/// Offer `from_uid`'s current list to `to_uid`. Returns the offered list id.
pub async fn offer_list(remote: &dyn RemoteStore, from_uid: &str, to_uid: &str) -> Result<String> {
    if from_uid == to_uid {
        return Err(Error::InvalidInput(
            "Cannot share a list with yourself".to_string(),
        ));
    }
    let list_id = current_list(remote, from_uid)
        .await?
        .ok_or_else(|| Error::NotFound(format!("{from_uid} has no list to share")))?;
    let entry = RemotePath::share_inbox(to_uid)?.child(from_uid)?;
    remote.set(&entry, Value::String(list_id.clone())).await?;
    tracing::info!("{from_uid} offered list {list_id} to {to_uid}");
    Ok(list_id)
}

/// Offers waiting for `uid`, ordered by sender
pub async fn pending_offers(remote: &dyn RemoteStore, uid: &str) -> Result<Vec<ListOffer>> {
    let inbox = RemotePath::share_inbox(uid)?;
    let entries = match remote.get(&inbox).await? {
        None => return Ok(Vec::new()),
        Some(Value::Object(entries)) => entries,
        Some(other) => return Err(malformed(&inbox, &other)),
    };
    let mut offers: Vec<ListOffer> = entries
        .into_iter()
        .filter_map(|(from_uid, value)| match value {
            Value::String(list_id) => Some(ListOffer { from_uid, list_id }),
            other => {
                tracing::warn!("Ignoring malformed share offer from {from_uid}: {other}");
                None
            }
        })
        .collect();
    offers.sort_by(|a, b| a.from_uid.cmp(&b.from_uid));
    Ok(offers)
}

/// Point `uid` at the list offered by `from_uid` and consume the offer.
/// Returns the list id now in use.
pub async fn accept_offer(remote: &dyn RemoteStore, uid: &str, from_uid: &str) -> Result<String> {
    let entry = RemotePath::share_inbox(uid)?.child(from_uid)?;
    let list_id = match remote.get(&entry).await? {
        Some(Value::String(list_id)) => list_id,
        Some(other) => return Err(malformed(&entry, &other)),
        None => return Err(Error::NotFound(format!("No offer from {from_uid}"))),
    };
    remote
        .set(&RemotePath::list_pointer(uid)?, Value::String(list_id.clone()))
        .await?;
    remote.remove(&entry).await?;
    tracing::info!("{uid} joined list {list_id} shared by {from_uid}");
    Ok(list_id)
}

pub async fn decline_offer(remote: &dyn RemoteStore, uid: &str, from_uid: &str) -> Result<()> {
    let entry = RemotePath::share_inbox(uid)?.child(from_uid)?;
    remote.remove(&entry).await?;
    Ok(())
}

fn malformed(path: &RemotePath, value: &Value) -> Error {
    RemoteError::Malformed {
        path: path.to_string(),
        reason: format!("expected a list id, found {value}"),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::remote::MemoryRemoteStore;

    async fn with_list(remote: &MemoryRemoteStore, uid: &str, list_id: &str) {
        remote
            .set(
                &RemotePath::list_pointer(uid).unwrap(),
                Value::String(list_id.to_string()),
            )
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offer_then_accept_moves_pointer() {
        let remote = MemoryRemoteStore::new();
        with_list(&remote, "alice", "list-a").await;
        with_list(&remote, "bob", "list-b").await;

        assert_eq!(offer_list(&remote, "alice", "bob").await.unwrap(), "list-a");
        assert_eq!(
            pending_offers(&remote, "bob").await.unwrap(),
            vec![ListOffer {
                from_uid: "alice".to_string(),
                list_id: "list-a".to_string(),
            }]
        );

        assert_eq!(accept_offer(&remote, "bob", "alice").await.unwrap(), "list-a");
        assert_eq!(
            current_list(&remote, "bob").await.unwrap(),
            Some("list-a".to_string())
        );
        assert!(pending_offers(&remote, "bob").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offer_without_list_fails() {
        let remote = MemoryRemoteStore::new();
        let error = offer_list(&remote, "alice", "bob").await.unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offer_to_self_is_rejected() {
        let remote = MemoryRemoteStore::new();
        with_list(&remote, "alice", "list-a").await;
        let error = offer_list(&remote, "alice", "alice").await.unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn decline_keeps_pointer() {
        let remote = MemoryRemoteStore::new();
        with_list(&remote, "alice", "list-a").await;
        with_list(&remote, "bob", "list-b").await;
        offer_list(&remote, "alice", "bob").await.unwrap();

        decline_offer(&remote, "bob", "alice").await.unwrap();
        assert!(pending_offers(&remote, "bob").await.unwrap().is_empty());
        assert_eq!(
            current_list(&remote, "bob").await.unwrap(),
            Some("list-b".to_string())
        );
        let error = accept_offer(&remote, "bob", "alice").await.unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_offers_are_skipped() {
        let remote = MemoryRemoteStore::new();
        let inbox = RemotePath::share_inbox("bob").unwrap();
        remote
            .set(&inbox.child("carol").unwrap(), serde_json::json!(7))
            .await
            .unwrap();
        remote
            .set(&inbox.child("alice").unwrap(), Value::String("list-a".to_string()))
            .await
            .unwrap();
        let offers = pending_offers(&remote, "bob").await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].from_uid, "alice");
    }
}
