//! Last-writer-wins conflict resolution

/// Which side of a linked pair should be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Write the local fields to the remote document
    PushLocal,
    /// Copy the remote fields into the local entity
    PullRemote,
    /// Both sides already agree
    Unchanged,
}

/// Compare the remote document's `lastChangeDate` with the local record's.
///
/// A side without a timestamp never wins against one that has it, except
/// that an unstamped local record is pushed so it gets a timestamp.
#[must_use]
pub const fn decide(remote: Option<i64>, local: Option<i64>) -> Resolution {
    match (remote, local) {
        (None | Some(_), None) | (None, Some(_)) => Resolution::PushLocal,
        (Some(remote), Some(local)) => {
            if local > remote {
                Resolution::PushLocal
            } else if local < remote {
                Resolution::PullRemote
            } else {
                Resolution::Unchanged
            }
        }
    }
}
