//! Push notifications for the UI layer.
//!
//! `GroupManager::subscribe` hands out a tokio broadcast receiver. Each
//! event names the group and carries a [`UserNotice`], which is the only
//! outcome the UI ever sees. Internal error codes stay inside the core.

use std::fmt;

use crate::crdt::ids::{GroupId, MemberKey, MessageId};
use crate::crdt::membership::MemberChange;
use crate::crdt::metadata::MetadataKey;
use crate::message::MessageView;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserNotice {
    GroupCreated,
    /// This device was invited to the group.
    InvitedToGroup { by: MemberKey },
    MemberInvited(MemberKey),
    MemberAdded(MemberKey),
    MemberLeft(MemberKey),
    MemberRemoved(MemberKey),
    MemberPromoted(MemberKey),
    GroupDetailsChanged(MetadataKey),
    /// This device was removed and no longer receives group traffic.
    RemovedFromGroup,
    /// The group key arrived; earlier messages may now be readable.
    KeyReceived,
    MessageReceived(MessageView),
    MessageUnreadable(MessageId),
    /// An edit, delete or reaction changed how this message renders.
    MessageUpdated(MessageId),
    /// Held ops were dropped and a resync was requested.
    ResyncRequested,
    GroupDeleted,
}

impl UserNotice {
    /// Map a membership change to what the local user should see.
    pub fn from_change(change: &MemberChange, me: &MemberKey, issuer: &MemberKey) -> Self {
        match *change {
            MemberChange::Created(_) => UserNotice::GroupCreated,
            MemberChange::Invited(target) if target == *me => {
                UserNotice::InvitedToGroup { by: *issuer }
            }
            MemberChange::Invited(target) => UserNotice::MemberInvited(target),
            MemberChange::Accepted(member) => UserNotice::MemberAdded(member),
            MemberChange::Removed { target, .. } if target == *me => UserNotice::RemovedFromGroup,
            MemberChange::Removed { target, .. } => UserNotice::MemberRemoved(target),
            MemberChange::Left(member) => UserNotice::MemberLeft(member),
            MemberChange::Promoted(member) => UserNotice::MemberPromoted(member),
            MemberChange::MetadataChanged(key) => UserNotice::GroupDetailsChanged(key),
        }
    }
}

impl fmt::Display for UserNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserNotice::GroupCreated => write!(f, "group created"),
            UserNotice::InvitedToGroup { by } => write!(f, "invited by {}", by.short()),
            UserNotice::MemberInvited(k) => write!(f, "member invited: {}", k.short()),
            UserNotice::MemberAdded(k) => write!(f, "member added: {}", k.short()),
            UserNotice::MemberLeft(k) => write!(f, "member left: {}", k.short()),
            UserNotice::MemberRemoved(k) => write!(f, "member removed: {}", k.short()),
            UserNotice::MemberPromoted(k) => write!(f, "member promoted: {}", k.short()),
            UserNotice::GroupDetailsChanged(key) => write!(f, "group {:?} changed", key),
            UserNotice::RemovedFromGroup => write!(f, "removed: you no longer have access"),
            UserNotice::KeyReceived => write!(f, "group key received"),
            UserNotice::MessageReceived(m) => write!(f, "new message from {}", m.sender.short()),
            UserNotice::MessageUnreadable(_) => write!(f, "message unreadable"),
            UserNotice::MessageUpdated(_) => write!(f, "message updated"),
            UserNotice::ResyncRequested => write!(f, "resynchronizing group"),
            UserNotice::GroupDeleted => write!(f, "group deleted"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupEvent {
    pub group_id: GroupId,
    pub notice: UserNotice,
}

impl GroupEvent {
    pub fn new(group_id: GroupId, notice: UserNotice) -> Self {
        GroupEvent { group_id, notice }
    }
}
