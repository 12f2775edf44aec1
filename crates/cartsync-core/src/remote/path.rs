//! Paths into the remote tree

use std::fmt;

use crate::error::RemoteError;
use crate::models::EntityKind;

const USERS: &str = "users";
const LISTS: &str = "lists";
const SHARE: &str = "share";
const LIST_POINTER: &str = "listId";

/// A slash-separated location in the remote tree.
///
/// Segments are never empty and never contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RemotePath(Vec<String>);

impl RemotePath {
    /// The tree root
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse `a/b/c`; leading, trailing and doubled slashes are ignored
    pub fn parse(raw: &str) -> Result<Self, RemoteError> {
        raw.split('/')
            .filter(|segment| !segment.trim().is_empty())
            .try_fold(Self::root(), |path, segment| path.child(segment))
    }

    /// Append one segment
    pub fn child(&self, segment: impl AsRef<str>) -> Result<Self, RemoteError> {
        let segment = segment.as_ref().trim();
        if segment.is_empty() || segment.contains('/') {
            return Err(RemoteError::InvalidPath(format!("{self}/{segment}")));
        }
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Last segment, `None` for the root
    pub fn key(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// True when `self` equals `other` or lies below it
    pub fn starts_with(&self, other: &Self) -> bool {
        self.0.starts_with(&other.0)
    }

    /// True when one path contains the other
    pub fn overlaps(&self, other: &Self) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }

    /// `users/{uid}/listId`
    pub fn list_pointer(uid: &str) -> Result<Self, RemoteError> {
        Self::root().child(USERS)?.child(uid)?.child(LIST_POINTER)
    }

    /// `lists/{listId}`
    pub fn list(list_id: &str) -> Result<Self, RemoteError> {
        Self::root().child(LISTS)?.child(list_id)
    }

    /// `lists/{listId}/{categories|products|shopItems}`
    pub fn collection(list_id: &str, kind: EntityKind) -> Result<Self, RemoteError> {
        Self::list(list_id)?.child(kind.remote_segment())
    }

    /// `lists/{listId}/{segment}/{remoteId}`
    pub fn document(list_id: &str, kind: EntityKind, remote_id: &str) -> Result<Self, RemoteError> {
        Self::collection(list_id, kind)?.child(remote_id)
    }

    /// `share/{uid}`: list offers addressed to a user
    pub fn share_inbox(uid: &str) -> Result<Self, RemoteError> {
        Self::root().child(SHARE)?.child(uid)
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}
