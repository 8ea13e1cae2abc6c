/// Membership CRDT: causal-past validity with commutative effects.
///
/// Tracks group membership as `MemberRecord`s keyed by `MemberKey`.
/// - An op is judged against its own causal past (its `deps` plus the
///   issuer's earlier ops), never against whatever the local replica
///   happens to hold. Validity is therefore identical everywhere.
/// - Effects only ever set flags or raise max-registers, so valid ops
///   commute and any causal delivery order yields the same records.
/// - `removed` is a terminal tombstone. Re-inviting a member whose
///   removal is in the inviter's causal past is ignored.
/// - Display fields follow the largest `(issuer, seq)` op id.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::ids::{MemberKey, OpId};
use crate::crdt::metadata::MetadataKey;
use crate::crdt::ops::{OpKind, Role, SignedOp};
use crate::crdt::policy::{Action, MembershipPolicy};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why an authentic op had no effect. Ignored ops stay in the log.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    #[error("Group not created in the op's causal past")]
    GroupNotCreated,

    #[error("Group already created")]
    AlreadyCreated,

    #[error("Issuer is not an active member")]
    IssuerNotActive,

    #[error("Policy does not permit this action")]
    NotPermitted,

    #[error("Target is not known")]
    TargetUnknown,

    #[error("Target was removed")]
    TargetRemoved,

    #[error("Target is not an active member")]
    TargetNotActive,

    #[error("Target is already an admin")]
    AlreadyAdmin,

    #[error("No invite for the issuer")]
    NotInvited,

    #[error("Invite already accepted")]
    AlreadyAccepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberChange {
    Created(MemberKey),
    Invited(MemberKey),
    Accepted(MemberKey),
    Removed { target: MemberKey, by: MemberKey },
    Left(MemberKey),
    Promoted(MemberKey),
    /// A group property changed. Tracked by `MetadataState`.
    MetadataChanged(MetadataKey),
}

// ---------------------------------------------------------------------------
// MemberRecord
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub member: MemberKey,
    pub role: Role,
    /// Set by the member's own `Accept` (the creator starts accepted).
    pub accepted: bool,
    /// Terminal.
    pub removed: bool,
    /// Largest op id among valid ops that touched this record.
    pub last_op: OpId,
    /// Device label from the winning invite (or `Create`).
    pub device: String,
    /// X25519 key published in the member's `Accept`.
    pub encryption_pubkey: Option<[u8; 32]>,
    /// Winning invite. `None` for the creator.
    pub invited_by: Option<OpId>,
    pub removed_by: Option<OpId>,
    pub promoted_by: Option<OpId>,
    /// Earliest timestamp among valid removals. Messages stamped after it
    /// are hidden.
    pub removed_at_ms: Option<u64>,
}

impl MemberRecord {
    pub fn is_active(&self) -> bool {
        self.accepted && !self.removed
    }

    pub fn is_pending(&self) -> bool {
        !self.accepted && !self.removed
    }

    pub fn fingerprint(&self) -> String {
        self.member.fingerprint()
    }
}

fn raise(slot: &mut Option<OpId>, id: OpId) -> bool {
    match slot {
        Some(cur) if *cur >= id => false,
        _ => {
            *slot = Some(id);
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Causal view
// ---------------------------------------------------------------------------

/// What an op is allowed to see when it is judged.
#[derive(Clone, Copy)]
pub enum View<'a> {
    /// The causal past of an op.
    Causal(&'a SignedOp),
    /// Everything this replica has applied. Used to preview local ops,
    /// whose deps will be the full local frontier.
    Local,
}

impl View<'_> {
    fn sees(&self, id: &OpId) -> bool {
        match self {
            View::Causal(op) => op.has_seen(id),
            View::Local => true,
        }
    }
}

// ---------------------------------------------------------------------------
// MembershipState
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct MembershipState {
    creator: Option<MemberKey>,
    members: BTreeMap<MemberKey, MemberRecord>,
    // Valid ops only, per target.
    invites: BTreeMap<MemberKey, Vec<OpId>>,
    accepts: BTreeMap<MemberKey, OpId>,
    removals: BTreeMap<MemberKey, Vec<OpId>>,
    promotions: BTreeMap<MemberKey, Vec<OpId>>,
}

impl MembershipState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_created(&self) -> bool {
        self.creator.is_some()
    }

    pub fn creator(&self) -> Option<&MemberKey> {
        self.creator.as_ref()
    }

    pub fn members(&self) -> &BTreeMap<MemberKey, MemberRecord> {
        &self.members
    }

    pub fn get(&self, member: &MemberKey) -> Option<&MemberRecord> {
        self.members.get(member)
    }

    pub fn is_known(&self, member: &MemberKey) -> bool {
        self.members.contains_key(member)
    }

    pub fn is_active(&self, member: &MemberKey) -> bool {
        self.members.get(member).is_some_and(|r| r.is_active())
    }

    /// Accepted, not removed.
    pub fn active_members(&self) -> Vec<MemberKey> {
        self.members
            .values()
            .filter(|r| r.is_active())
            .map(|r| r.member)
            .collect()
    }

    pub fn active_member_count(&self) -> usize {
        self.members.values().filter(|r| r.is_active()).count()
    }

    /// True if some removed member had accepted and so may still hold the
    /// group key.
    pub fn needs_rekey(&self) -> bool {
        self.members.values().any(|r| r.removed && r.accepted)
    }

    // ---- view queries ----------------------------------------------------

    fn created_in(&self, view: View<'_>) -> bool {
        self.creator
            .is_some_and(|c| view.sees(&OpId::new(c, 1)))
    }

    fn is_creator_in(&self, member: &MemberKey, view: View<'_>) -> bool {
        self.creator == Some(*member) && self.created_in(view)
    }

    fn known_in(&self, member: &MemberKey, view: View<'_>) -> bool {
        self.is_creator_in(member, view)
            || self
                .invites
                .get(member)
                .is_some_and(|ids| ids.iter().any(|id| view.sees(id)))
    }

    fn accepted_in(&self, member: &MemberKey, view: View<'_>) -> bool {
        self.is_creator_in(member, view)
            || self.accepts.get(member).is_some_and(|id| view.sees(id))
    }

    fn removed_in(&self, member: &MemberKey, view: View<'_>) -> bool {
        self.removals
            .get(member)
            .is_some_and(|ids| ids.iter().any(|id| view.sees(id)))
    }

    fn active_in(&self, member: &MemberKey, view: View<'_>) -> bool {
        self.accepted_in(member, view) && !self.removed_in(member, view)
    }

    fn role_in(&self, member: &MemberKey, view: View<'_>) -> Role {
        let promoted = self
            .promotions
            .get(member)
            .is_some_and(|ids| ids.iter().any(|id| view.sees(id)));
        if promoted || self.is_creator_in(member, view) {
            Role::Admin
        } else {
            Role::Member
        }
    }

    // ---- validity ----------------------------------------------------------

    /// Judge `kind` issued by `issuer` against `view`.
    pub fn check(
        &self,
        issuer: &MemberKey,
        kind: &OpKind,
        view: View<'_>,
        policy: &dyn MembershipPolicy,
    ) -> Result<(), IgnoreReason> {
        if let OpKind::Create { .. } = kind {
            // Shape checks already bound the op to the group id.
            return if self.creator.is_some_and(|c| c != *issuer) {
                Err(IgnoreReason::AlreadyCreated)
            } else {
                Ok(())
            };
        }
        if !self.created_in(view) {
            return Err(IgnoreReason::GroupNotCreated);
        }

        match kind {
            OpKind::Create { .. } => Ok(()),
            OpKind::Invite { target, .. } => {
                self.require_active(issuer, view)?;
                self.require_permit(issuer, Action::Invite, view, policy)?;
                if self.removed_in(target, view) {
                    return Err(IgnoreReason::TargetRemoved);
                }
                Ok(())
            }
            OpKind::Accept { .. } => {
                if !self.known_in(issuer, view) {
                    return Err(IgnoreReason::NotInvited);
                }
                if self.removed_in(issuer, view) {
                    return Err(IgnoreReason::TargetRemoved);
                }
                if self.accepted_in(issuer, view) {
                    return Err(IgnoreReason::AlreadyAccepted);
                }
                Ok(())
            }
            OpKind::Remove { target } if target == issuer => {
                // Leaving also covers declining a pending invite.
                if !self.known_in(issuer, view) || self.removed_in(issuer, view) {
                    return Err(IgnoreReason::IssuerNotActive);
                }
                self.require_permit(issuer, Action::Leave, view, policy)
            }
            OpKind::Remove { target } => {
                self.require_active(issuer, view)?;
                self.require_permit(issuer, Action::Remove, view, policy)?;
                if !self.known_in(target, view) {
                    return Err(IgnoreReason::TargetUnknown);
                }
                if self.removed_in(target, view) {
                    return Err(IgnoreReason::TargetRemoved);
                }
                Ok(())
            }
            OpKind::Promote { target } => {
                self.require_active(issuer, view)?;
                self.require_permit(issuer, Action::Promote, view, policy)?;
                if !self.active_in(target, view) {
                    return Err(IgnoreReason::TargetNotActive);
                }
                if self.role_in(target, view) == Role::Admin {
                    return Err(IgnoreReason::AlreadyAdmin);
                }
                Ok(())
            }
            OpKind::SetMetadata { .. } => {
                self.require_active(issuer, view)?;
                self.require_permit(issuer, Action::SetMetadata, view, policy)
            }
        }
    }

    fn require_active(&self, issuer: &MemberKey, view: View<'_>) -> Result<(), IgnoreReason> {
        if self.active_in(issuer, view) {
            Ok(())
        } else {
            Err(IgnoreReason::IssuerNotActive)
        }
    }

    fn require_permit(
        &self,
        issuer: &MemberKey,
        action: Action,
        view: View<'_>,
        policy: &dyn MembershipPolicy,
    ) -> Result<(), IgnoreReason> {
        if policy.permits(self.role_in(issuer, view), action) {
            Ok(())
        } else {
            Err(IgnoreReason::NotPermitted)
        }
    }

    // ---- effects -----------------------------------------------------------

    /// Apply an op that passed [`check`](Self::check) in its causal view.
    ///
    /// Returns the user-visible change, or `None` when the records moved
    /// only in their tie-break fields.
    pub fn apply_valid(&mut self, op: &SignedOp) -> Option<MemberChange> {
        let id = op.op_id();
        match &op.kind {
            OpKind::Create {
                encryption_pubkey,
                device,
                ..
            } => {
                if self.creator.is_some() {
                    return None;
                }
                self.creator = Some(op.issuer);
                self.members.insert(
                    op.issuer,
                    MemberRecord {
                        member: op.issuer,
                        role: Role::Admin,
                        accepted: true,
                        removed: false,
                        last_op: id,
                        device: device.clone(),
                        encryption_pubkey: Some(*encryption_pubkey),
                        invited_by: None,
                        removed_by: None,
                        promoted_by: None,
                        removed_at_ms: None,
                    },
                );
                Some(MemberChange::Created(op.issuer))
            }
            OpKind::Invite { target, device } => {
                self.invites.entry(*target).or_default().push(id);
                match self.members.get_mut(target) {
                    Some(rec) => {
                        rec.last_op = rec.last_op.max(id);
                        if raise(&mut rec.invited_by, id) {
                            rec.device = device.clone();
                        }
                        None
                    }
                    None => {
                        self.members.insert(
                            *target,
                            MemberRecord {
                                member: *target,
                                role: Role::Member,
                                accepted: false,
                                removed: false,
                                last_op: id,
                                device: device.clone(),
                                encryption_pubkey: None,
                                invited_by: Some(id),
                                removed_by: None,
                                promoted_by: None,
                                removed_at_ms: None,
                            },
                        );
                        Some(MemberChange::Invited(*target))
                    }
                }
            }
            OpKind::Accept { encryption_pubkey } => {
                self.accepts.insert(op.issuer, id);
                let rec = self.members.get_mut(&op.issuer)?;
                rec.last_op = rec.last_op.max(id);
                rec.accepted = true;
                rec.encryption_pubkey = Some(*encryption_pubkey);
                (!rec.removed).then_some(MemberChange::Accepted(op.issuer))
            }
            OpKind::Remove { target } => {
                self.removals.entry(*target).or_default().push(id);
                let rec = self.members.get_mut(target)?;
                rec.last_op = rec.last_op.max(id);
                raise(&mut rec.removed_by, id);
                rec.removed_at_ms = Some(
                    rec.removed_at_ms
                        .map_or(op.timestamp_ms, |t| t.min(op.timestamp_ms)),
                );
                if rec.removed {
                    return None;
                }
                rec.removed = true;
                if *target == op.issuer {
                    Some(MemberChange::Left(*target))
                } else {
                    Some(MemberChange::Removed {
                        target: *target,
                        by: op.issuer,
                    })
                }
            }
            OpKind::Promote { target } => {
                self.promotions.entry(*target).or_default().push(id);
                let rec = self.members.get_mut(target)?;
                rec.last_op = rec.last_op.max(id);
                raise(&mut rec.promoted_by, id);
                if rec.role == Role::Admin {
                    return None;
                }
                rec.role = Role::Admin;
                (!rec.removed).then_some(MemberChange::Promoted(*target))
            }
            // Applied by `GroupState` into its `MetadataState`.
            OpKind::SetMetadata { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
