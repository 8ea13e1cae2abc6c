use thiserror::Error;

use crate::config::ConfigError;
use crate::crdt::ids::GroupId;
use crate::crdt::membership::IgnoreReason;
use crate::crdt::ops::OpError;
use crate::gateway::{TransportError, WireError};
use crate::group_key::KeyError;
use crate::message::{DecryptError, MessageError};
use crate::store::StoreError;

/// Crate-level error returned by `GroupManager`.
#[derive(Error, Debug)]
pub enum GroupError {
    #[error(transparent)]
    Op(#[from] OpError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Decrypt(#[from] DecryptError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Wire(#[from] WireError),

    /// A local mutation that would be ignored by every replica.
    #[error("Not permitted: {0}")]
    NotPermitted(#[from] IgnoreReason),

    #[error("Invalid signature on {0}")]
    SignatureInvalid(&'static str),

    #[error("Unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("No group key held for {0}")]
    NoGroupKey(GroupId),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl<T> From<std::sync::PoisonError<T>> for GroupError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        GroupError::LockPoisoned
    }
}

pub type Result<T> = std::result::Result<T, GroupError>;
