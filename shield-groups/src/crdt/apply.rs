/// Apply engine: the single entry point for membership ops.
///
/// `GroupState` holds one group's membership log and its materialized view.
/// Every op flows through `apply`, which verifies it, checks causal
/// readiness, holds it if something it depends on is missing, and admits
/// it once ready. Admitting an op may release held ops.
///
/// **Determinism guarantee:** any delivery order of the same op set gives
/// the same `state_hash`. Readiness makes every replica admit ops in some
/// causal order, validity is judged on each op's causal past, and effects
/// commute.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::crdt::ids::{GroupId, MemberKey, OpId};
use crate::crdt::limits::{check_op_limits, OpLimitStatus, HARD_CAP_OPS_PER_GROUP};
use crate::crdt::membership::{IgnoreReason, MemberChange, MemberRecord, MembershipState, View};
use crate::crdt::metadata::MetadataState;
use crate::crdt::ops::{now_ms, OpError, OpKind, SignedOp};
use crate::crdt::policy::{MembershipPolicy, OpenPolicy};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpEffect {
    Changed(MemberChange),
    /// Valid, but only tie-break fields moved.
    NoChange,
    /// Already applied or already held with identical content.
    Duplicate,
    /// Authentic but invalid in its causal past. Still logged.
    Ignored(IgnoreReason),
}

impl OpEffect {
    pub fn change(&self) -> Option<&MemberChange> {
        match self {
            OpEffect::Changed(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppliedOp {
    pub op: SignedOp,
    pub effect: OpEffect,
}

/// Result of one `apply` call.
#[derive(Debug, Clone)]
pub struct MembershipDelta {
    pub op_id: OpId,
    pub effect: OpEffect,
    /// Previously held ops admitted because of this one, in admission order.
    pub released: Vec<AppliedOp>,
}

impl MembershipDelta {
    /// True if the op (not a re-delivery) was admitted.
    pub fn admitted(&self) -> bool {
        self.effect != OpEffect::Duplicate
    }

    pub fn changes(&self) -> impl Iterator<Item = &MemberChange> {
        self.effect
            .change()
            .into_iter()
            .chain(self.released.iter().filter_map(|a| a.effect.change()))
    }
}

// ---------------------------------------------------------------------------
// Hold buffer
// ---------------------------------------------------------------------------

/// Bounds on ops waiting for missing predecessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldLimits {
    /// Release passes an op may sit through before it is dropped.
    pub max_attempts: u32,
    pub max_age_ms: u64,
    pub max_held: usize,
}

impl Default for HoldLimits {
    fn default() -> Self {
        HoldLimits {
            max_attempts: 64,
            max_age_ms: 10 * 60 * 1000,
            max_held: 1_024,
        }
    }
}

impl HoldLimits {
    pub fn unbounded() -> Self {
        HoldLimits {
            max_attempts: u32::MAX,
            max_age_ms: u64::MAX,
            max_held: usize::MAX,
        }
    }
}

#[derive(Debug, Clone)]
struct HeldOp {
    op: SignedOp,
    digest: [u8; 32],
    attempts: u32,
    held_at_ms: u64,
}

// ---------------------------------------------------------------------------
// GroupState
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct GroupState {
    pub group_id: GroupId,
    pub membership: MembershipState,
    pub metadata: MetadataState,
    policy: Arc<dyn MembershipPolicy>,
    limits: HoldLimits,
    /// Highest contiguous seq admitted per issuer.
    frontier: BTreeMap<MemberKey, u64>,
    /// Admitted ops in admission order.
    log: Vec<SignedOp>,
    /// OpId -> (index in `log`, content digest).
    applied: HashMap<OpId, (usize, [u8; 32])>,
    held: BTreeMap<OpId, HeldOp>,
    needs_resync: bool,
}

impl GroupState {
    pub fn new(group_id: GroupId, policy: Arc<dyn MembershipPolicy>, limits: HoldLimits) -> Self {
        GroupState {
            group_id,
            membership: MembershipState::new(),
            metadata: MetadataState::new(),
            policy,
            limits,
            frontier: BTreeMap::new(),
            log: Vec::new(),
            applied: HashMap::new(),
            held: BTreeMap::new(),
            needs_resync: false,
        }
    }

    /// Open policy, default hold limits.
    pub fn with_defaults(group_id: GroupId) -> Self {
        Self::new(group_id, Arc::new(OpenPolicy), HoldLimits::default())
    }

    /// Apply a single op.
    ///
    /// `Err` with [`OpError::is_held`] means the op was buffered and will be
    /// admitted automatically once its predecessors arrive. Every other
    /// `Err` is final and nothing was stored.
    pub fn apply(&mut self, op: &SignedOp, now_ms: u64) -> Result<MembershipDelta, OpError> {
        // 1. Group, shape, signature
        if op.group_id != self.group_id {
            return Err(OpError::WrongGroup {
                expected: self.group_id,
                got: op.group_id,
            });
        }
        op.check_shape()?;
        match op.verify() {
            Ok(true) => {}
            Ok(false) | Err(_) => return Err(OpError::SignatureInvalid),
        }

        // 2. Re-delivery vs equivocation
        let id = op.op_id();
        let digest = op.digest()?;
        let known = self
            .applied
            .get(&id)
            .map(|(_, d)| *d)
            .or_else(|| self.held.get(&id).map(|h| h.digest));
        if let Some(existing) = known {
            if existing == digest {
                return Ok(MembershipDelta {
                    op_id: id,
                    effect: OpEffect::Duplicate,
                    released: Vec::new(),
                });
            }
            log::warn!("Equivocation from {} at seq {}", op.issuer.short(), op.seq);
            return Err(OpError::Equivocation(id));
        }
        if let Some(seen) = self.frontier.get(&op.issuer) {
            if op.seq <= *seen {
                // Same issuer, same seq, not in `applied`: impossible unless
                // the log was tampered with.
                return Err(OpError::Equivocation(id));
            }
        }

        // 3. Limits
        if self.log.len() >= HARD_CAP_OPS_PER_GROUP {
            return Err(OpError::HardCapReached);
        }

        // 4. Causal readiness
        if let Err(reason) = self.readiness(op) {
            self.hold(op.clone(), digest, now_ms)?;
            log::debug!("Holding {:?}: {}", id, reason);
            return Err(reason);
        }

        // 5. Admit, then drain anything it unblocked
        let effect = self.admit(op.clone(), digest);
        let released = self.release_held(now_ms);

        Ok(MembershipDelta {
            op_id: id,
            effect,
            released,
        })
    }

    /// Judge a local op before signing it. Local ops carry the full local
    /// frontier as deps, so their causal past is everything applied here.
    pub fn preview(&self, issuer: &MemberKey, kind: &OpKind) -> Result<(), IgnoreReason> {
        self.membership
            .check(issuer, kind, View::Local, self.policy.as_ref())
    }

    /// Next seq for `issuer`.
    pub fn next_seq(&self, issuer: &MemberKey) -> u64 {
        self.frontier.get(issuer).copied().unwrap_or(0) + 1
    }

    /// Causal context for a new op by `issuer`.
    pub fn local_deps(&self, issuer: &MemberKey) -> BTreeMap<MemberKey, u64> {
        self.frontier
            .iter()
            .filter(|(k, _)| *k != issuer)
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    pub fn frontier(&self) -> &BTreeMap<MemberKey, u64> {
        &self.frontier
    }

    pub fn ops(&self) -> &[SignedOp] {
        &self.log
    }

    pub fn op_count(&self) -> usize {
        self.log.len()
    }

    /// Admitted ops the holder of `have` is missing, in admission order.
    pub fn ops_after(&self, have: &BTreeMap<MemberKey, u64>) -> Vec<SignedOp> {
        self.log
            .iter()
            .filter(|op| op.seq > have.get(&op.issuer).copied().unwrap_or(0))
            .cloned()
            .collect()
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Set when held ops were dropped; the gateway should request a snapshot.
    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    pub fn clear_resync(&mut self) {
        self.needs_resync = false;
    }

    pub fn query_members(&self) -> Vec<MemberRecord> {
        self.membership.members().values().cloned().collect()
    }

    pub fn limit_status(&self) -> OpLimitStatus {
        check_op_limits(self.log.len())
    }

    /// Drop held ops that outlived the hold window. Returns how many.
    pub fn expire_held(&mut self, now_ms: u64) -> usize {
        let limits = self.limits;
        let before = self.held.len();
        self.held.retain(|id, h| {
            let keep = h.attempts <= limits.max_attempts
                && now_ms.saturating_sub(h.held_at_ms) <= limits.max_age_ms;
            if !keep {
                log::debug!("Dropping held {:?} after {} attempts", id, h.attempts);
            }
            keep
        });
        let dropped = before - self.held.len();
        if dropped > 0 {
            self.needs_resync = true;
        }
        dropped
    }

    // ---- internals ---------------------------------------------------------

    fn readiness(&self, op: &SignedOp) -> Result<(), OpError> {
        let is_create = matches!(op.kind, OpKind::Create { .. });
        if !is_create && !self.membership.is_known(&op.issuer) {
            return Err(OpError::UnknownIssuer(op.issuer));
        }

        let have = self.frontier.get(&op.issuer).copied().unwrap_or(0);
        if op.seq != have + 1 {
            return Err(OpError::SequenceGap {
                issuer: op.issuer,
                have,
                need: op.seq - 1,
            });
        }
        for (dep, need) in &op.deps {
            let have = self.frontier.get(dep).copied().unwrap_or(0);
            if have < *need {
                return Err(OpError::SequenceGap {
                    issuer: *dep,
                    have,
                    need: *need,
                });
            }
        }
        Ok(())
    }

    fn hold(&mut self, op: SignedOp, digest: [u8; 32], now_ms: u64) -> Result<(), OpError> {
        if self.held.len() >= self.limits.max_held {
            self.needs_resync = true;
            return Err(OpError::HoldBufferFull);
        }
        self.held.insert(
            op.op_id(),
            HeldOp {
                op,
                digest,
                attempts: 0,
                held_at_ms: now_ms,
            },
        );
        Ok(())
    }

    fn admit(&mut self, op: SignedOp, digest: [u8; 32]) -> OpEffect {
        let effect = match self.membership.check(
            &op.issuer,
            &op.kind,
            View::Causal(&op),
            self.policy.as_ref(),
        ) {
            Ok(()) => match &op.kind {
                OpKind::SetMetadata { key, value } => {
                    if self
                        .metadata
                        .apply_set(*key, value, causal_depth(&op), op.op_id())
                    {
                        OpEffect::Changed(MemberChange::MetadataChanged(*key))
                    } else {
                        OpEffect::NoChange
                    }
                }
                _ => match self.membership.apply_valid(&op) {
                    Some(change) => OpEffect::Changed(change),
                    None => OpEffect::NoChange,
                },
            },
            Err(reason) => {
                log::debug!("{} {:?} ignored: {}", op.kind.as_str(), op.op_id(), reason);
                OpEffect::Ignored(reason)
            }
        };

        self.frontier.insert(op.issuer, op.seq);
        self.applied.insert(op.op_id(), (self.log.len(), digest));
        self.log.push(op);
        effect
    }

    fn release_held(&mut self, now_ms: u64) -> Vec<AppliedOp> {
        let mut released = Vec::new();
        loop {
            let ready = self
                .held
                .iter()
                .find(|(_, h)| self.readiness(&h.op).is_ok())
                .map(|(id, _)| *id);
            let Some(id) = ready else { break };
            let Some(held) = self.held.remove(&id) else { break };
            let op = held.op.clone();
            let effect = self.admit(held.op, held.digest);
            released.push(AppliedOp { op, effect });
        }
        for h in self.held.values_mut() {
            h.attempts = h.attempts.saturating_add(1);
        }
        self.expire_held(now_ms);
        released
    }

    // ---- rebuild / verification -------------------------------------------

    /// Rebuild a group from a complete op set (startup / verification).
    ///
    /// Ops are pre-sorted by causal depth so replay rarely has to hold;
    /// any input order produces the same final state.
    pub fn materialize(
        group_id: GroupId,
        ops: &[SignedOp],
        policy: Arc<dyn MembershipPolicy>,
        limits: HoldLimits,
    ) -> Result<Self, OpError> {
        let mut state = GroupState::new(group_id, policy, HoldLimits::unbounded());
        let now = now_ms();
        for op in &by_causal_depth(ops) {
            match state.apply(op, now) {
                Ok(_) => {}
                Err(e) if e.is_held() => {}
                Err(e) => return Err(e),
            }
        }
        state.limits = limits;
        state.expire_held(now);
        Ok(state)
    }

    /// Replay an untrusted op set, skipping ops that fail verification.
    ///
    /// Used to judge a snapshot from a peer before adopting it. Ops still
    /// waiting on predecessors are dropped under `limits` and flag a resync.
    pub fn replay(
        group_id: GroupId,
        ops: &[SignedOp],
        policy: Arc<dyn MembershipPolicy>,
        limits: HoldLimits,
    ) -> Self {
        let mut state = GroupState::new(group_id, policy, HoldLimits::unbounded());
        let now = now_ms();
        for op in &by_causal_depth(ops) {
            match state.apply(op, now) {
                Ok(_) => {}
                Err(e) if e.is_held() => {}
                Err(e) => log::debug!("Skipping {:?} from snapshot: {}", op.op_id(), e),
            }
        }
        state.limits = limits;
        let dropped = state.held_count();
        state.held.clear();
        if dropped > 0 {
            state.needs_resync = true;
        }
        state
    }

    /// Rebuild from the in-memory log and compare hashes.
    pub fn verify_materialized(&self) -> Result<bool, OpError> {
        let rebuilt =
            GroupState::materialize(self.group_id, &self.log, self.policy.clone(), self.limits)?;
        Ok(rebuilt.state_hash() == self.state_hash())
    }

    /// Deterministic state hash for convergence verification.
    ///
    /// Hashes membership records and the frontier in canonical BTreeMap
    /// order. Enum discriminants use stable `#[repr(u8)]` values.
    pub fn state_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.group_id.as_bytes());

        hasher.update(b"M");
        for (key, rec) in self.membership.members() {
            hasher.update(key.as_bytes());
            hasher.update(&[rec.role as u8, rec.accepted as u8, rec.removed as u8]);
            hash_op_id(&mut hasher, Some(&rec.last_op));
            hasher.update(&(rec.device.len() as u64).to_le_bytes());
            hasher.update(rec.device.as_bytes());
            match &rec.encryption_pubkey {
                Some(pk) => {
                    hasher.update(&[1]);
                    hasher.update(pk);
                }
                None => {
                    hasher.update(&[0]);
                }
            }
            hash_op_id(&mut hasher, rec.invited_by.as_ref());
            hash_op_id(&mut hasher, rec.removed_by.as_ref());
            hash_op_id(&mut hasher, rec.promoted_by.as_ref());
            match rec.removed_at_ms {
                Some(t) => {
                    hasher.update(&[1]);
                    hasher.update(&t.to_le_bytes());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }

        hasher.update(b"D");
        for (key, reg) in self.metadata.registers() {
            hasher.update(&[*key as u8]);
            hasher.update(&(reg.value.len() as u64).to_le_bytes());
            hasher.update(&reg.value);
            hasher.update(&reg.depth.to_le_bytes());
            hash_op_id(&mut hasher, Some(&reg.writer_op));
        }

        hasher.update(b"F");
        for (key, seq) in &self.frontier {
            hasher.update(key.as_bytes());
            hasher.update(&seq.to_le_bytes());
        }

        *hasher.finalize().as_bytes()
    }
}

fn hash_op_id(hasher: &mut blake3::Hasher, id: Option<&OpId>) {
    match id {
        Some(id) => {
            hasher.update(&[1]);
            hasher.update(id.issuer.as_bytes());
            hasher.update(&id.seq.to_le_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

/// Strictly larger for any op than for everything in its causal past.
fn causal_depth(op: &SignedOp) -> u64 {
    op.deps
        .values()
        .fold(op.seq, |acc, s| acc.saturating_add(*s))
}

fn by_causal_depth(ops: &[SignedOp]) -> Vec<SignedOp> {
    let mut sorted = ops.to_vec();
    sorted.sort_by_key(|op| (causal_depth(op), op.issuer, op.seq));
    sorted
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::metadata::MetadataKey;
    use crate::crdt::ops::Role;
    use crate::crdt::policy::AdminPolicy;
    use crate::crypto::signing::generate_keypair;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// A replica with its own signing identity.
    struct Replica {
        key: MemberKey,
        priv_key: [u8; 32],
        state: GroupState,
    }

    impl Replica {
        fn new(group_id: GroupId) -> Self {
            let (public, private) = generate_keypair();
            Replica {
                key: MemberKey(public),
                priv_key: private,
                state: GroupState::new(
                    group_id,
                    Arc::new(OpenPolicy),
                    HoldLimits::unbounded(),
                ),
            }
        }

        /// Founder of a fresh group.
        fn founder() -> (Self, SignedOp) {
            let (public, private) = generate_keypair();
            let key = MemberKey(public);
            let nonce = [7u8; 32];
            let gid = GroupId::new(&key, &nonce);
            let mut r = Replica {
                key,
                priv_key: private,
                state: GroupState::new(gid, Arc::new(OpenPolicy), HoldLimits::unbounded()),
            };
            let create = r
                .issue(OpKind::Create {
                    group_nonce: nonce,
                    encryption_pubkey: [1u8; 32],
                    device: "founder".into(),
                })
                .unwrap();
            (r, create)
        }

        fn issue(&mut self, kind: OpKind) -> Option<SignedOp> {
            if !matches!(kind, OpKind::Create { .. }) {
                self.state.preview(&self.key, &kind).ok()?;
            }
            let op = SignedOp::create_signed(
                self.state.group_id,
                kind,
                self.state.next_seq(&self.key),
                self.state.local_deps(&self.key),
                &self.priv_key,
            )
            .ok()?;
            self.state.apply(&op, 0).unwrap();
            Some(op)
        }

        fn receive(&mut self, ops: &[SignedOp]) {
            for op in ops {
                let _ = self.state.apply(op, 0);
            }
        }
    }

    fn invite(target: MemberKey) -> OpKind {
        OpKind::Invite {
            target,
            device: "dev".into(),
        }
    }

    fn accept() -> OpKind {
        OpKind::Accept {
            encryption_pubkey: [2u8; 32],
        }
    }

    /// A creates, invites B, B accepts. Both replicas synced.
    fn pair() -> (Replica, Replica) {
        let (mut a, create) = Replica::founder();
        let mut b = Replica::new(a.state.group_id);
        let inv = a.issue(invite(b.key)).unwrap();
        b.receive(&[create, inv]);
        let acc = b.issue(accept()).unwrap();
        a.receive(&[acc]);
        (a, b)
    }

    fn fresh(gid: GroupId) -> GroupState {
        GroupState::new(gid, Arc::new(OpenPolicy), HoldLimits::unbounded())
    }

    #[test]
    fn test_create_invite_accept() {
        let (a, b) = pair();
        assert_eq!(a.state.state_hash(), b.state.state_hash());
        assert_eq!(a.state.membership.active_member_count(), 2);
        assert_eq!(a.state.membership.get(&a.key).unwrap().role, Role::Admin);
        assert_eq!(a.state.membership.get(&b.key).unwrap().role, Role::Member);
    }

    #[test]
    fn test_apply_idempotent() {
        let (mut a, b) = pair();
        let hash = a.state.state_hash();
        let ops = b.state.ops().to_vec();
        for op in &ops {
            let delta = a.state.apply(op, 0).unwrap();
            assert_eq!(delta.effect, OpEffect::Duplicate);
        }
        assert_eq!(a.state.state_hash(), hash);
        assert_eq!(a.state.op_count(), 3);
    }

    #[test]
    fn test_wrong_group_rejected() {
        let (a, _) = pair();
        let mut other = fresh(GroupId([9u8; 32]));
        let err = other.apply(&a.state.ops()[0], 0).unwrap_err();
        assert!(matches!(err, OpError::WrongGroup { .. }));
    }

    #[test]
    fn test_bad_signature_not_stored() {
        let (a, _) = pair();
        let mut op = a.state.ops()[0].clone();
        op.signature[0] ^= 0xFF;
        let mut state = fresh(a.state.group_id);
        assert_eq!(state.apply(&op, 0).unwrap_err(), OpError::SignatureInvalid);
        assert_eq!(state.op_count(), 0);
        assert_eq!(state.held_count(), 0);
    }

    #[test]
    fn test_equivocation_rejected() {
        let (mut a, _) = pair();
        let forged = SignedOp::create_signed(
            a.state.group_id,
            OpKind::Invite {
                target: MemberKey([3u8; 32]),
                device: "other".into(),
            },
            2,
            BTreeMap::new(),
            &a.priv_key,
        )
        .unwrap();
        assert!(matches!(
            a.state.apply(&forged, 0),
            Err(OpError::Equivocation(_))
        ));
    }

    #[test]
    fn test_sequence_gap_held_then_released() {
        let (mut a, _) = pair();
        let c = Replica::new(a.state.group_id);
        let d = Replica::new(a.state.group_id);
        let op3 = a.issue(invite(c.key)).unwrap();
        let op4 = a.issue(invite(d.key)).unwrap();

        let mut late = fresh(a.state.group_id);
        let ops = a.state.ops().to_vec();
        // Deliver everything except the op at seq 3.
        for op in ops.iter().filter(|op| op.op_id() != op3.op_id()) {
            match late.apply(op, 0) {
                Ok(_) => {}
                Err(e) => assert!(e.is_held(), "unexpected {e:?}"),
            }
        }
        assert_eq!(late.held_count(), 1);
        assert!(!late.membership.is_known(&d.key));

        let delta = late.apply(&op3, 0).unwrap();
        assert_eq!(delta.released.len(), 1);
        assert_eq!(delta.released[0].op.op_id(), op4.op_id());
        assert_eq!(late.held_count(), 0);
        assert_eq!(late.state_hash(), a.state.state_hash());
    }

    #[test]
    fn test_unknown_issuer_held() {
        let (a, b) = pair();
        let mut state = fresh(a.state.group_id);
        // B's accept before the group exists here.
        let accept = b.state.ops()[2].clone();
        assert!(matches!(
            state.apply(&accept, 0),
            Err(OpError::UnknownIssuer(_))
        ));
        state.apply(&a.state.ops()[0], 0).unwrap();
        let delta = state.apply(&a.state.ops()[1], 0).unwrap();
        assert_eq!(delta.released.len(), 1);
        assert!(state.membership.is_active(&b.key));
    }

    #[test]
    fn test_held_ops_expire_and_flag_resync() {
        let (a, b) = pair();
        let limits = HoldLimits {
            max_attempts: 100,
            max_age_ms: 1_000,
            max_held: 1,
        };
        let mut state = GroupState::new(a.state.group_id, Arc::new(OpenPolicy), limits);
        let accept = b.state.ops()[2].clone();
        assert!(state.apply(&accept, 0).is_err());
        assert!(matches!(
            state.apply(&a.state.ops()[1], 0),
            Err(OpError::HoldBufferFull)
        ));
        assert!(state.needs_resync());
        state.clear_resync();

        assert_eq!(state.expire_held(5_000), 1);
        assert!(state.needs_resync());
        assert_eq!(state.held_count(), 0);
    }

    #[test]
    fn test_removal_dominates_concurrent_promote() {
        let (mut a, mut b) = pair();
        let mut c = Replica::new(a.state.group_id);
        let inv = a.issue(invite(c.key)).unwrap();
        b.receive(&[inv.clone()]);
        c.receive(a.state.ops());
        let acc = c.issue(accept()).unwrap();
        a.receive(&[acc.clone()]);
        b.receive(&[acc]);

        // Concurrent: A removes C, B promotes C.
        let remove = a.issue(OpKind::Remove { target: c.key }).unwrap();
        let promote = b.issue(OpKind::Promote { target: c.key }).unwrap();
        a.receive(&[promote]);
        b.receive(&[remove]);

        assert_eq!(a.state.state_hash(), b.state.state_hash());
        let rec = a.state.membership.get(&c.key).unwrap();
        assert!(rec.removed);
        assert!(!rec.is_active());
    }

    #[test]
    fn test_concurrent_promotes_by_two_admins() {
        let (mut a, mut b) = pair();
        let promote_b = a.issue(OpKind::Promote { target: b.key }).unwrap();
        b.receive(&[promote_b]);
        let mut c = Replica::new(a.state.group_id);
        let inv = a.issue(invite(c.key)).unwrap();
        b.receive(&[inv]);
        c.receive(a.state.ops());
        let acc = c.issue(accept()).unwrap();
        a.receive(&[acc.clone()]);
        b.receive(&[acc]);

        let pa = a.issue(OpKind::Promote { target: c.key }).unwrap();
        let pb = b.issue(OpKind::Promote { target: c.key }).unwrap();
        a.receive(&[pb.clone()]);
        b.receive(&[pa.clone()]);

        assert_eq!(a.state.state_hash(), b.state.state_hash());
        let rec = a.state.membership.get(&c.key).unwrap();
        assert_eq!(rec.role, Role::Admin);
        assert_eq!(rec.promoted_by, Some(pa.op_id().max(pb.op_id())));
    }

    #[test]
    fn test_admin_policy_ignores_member_remove() {
        let (a, b) = pair();
        let mut state = GroupState::new(
            a.state.group_id,
            Arc::new(AdminPolicy),
            HoldLimits::default(),
        );
        for op in a.state.ops() {
            state.apply(op, 0).unwrap();
        }
        let kick = SignedOp::create_signed(
            a.state.group_id,
            OpKind::Remove { target: a.key },
            2,
            b.state.local_deps(&b.key),
            &b.priv_key,
        )
        .unwrap();
        let delta = state.apply(&kick, 0).unwrap();
        assert_eq!(delta.effect, OpEffect::Ignored(IgnoreReason::NotPermitted));
        assert!(state.membership.is_active(&a.key));
        // Still logged so B's chain stays contiguous.
        assert_eq!(state.next_seq(&b.key), 3);
    }

    #[test]
    fn test_materialize_matches_live_state() {
        let (a, _) = pair();
        let rebuilt = GroupState::materialize(
            a.state.group_id,
            a.state.ops(),
            Arc::new(OpenPolicy),
            HoldLimits::default(),
        )
        .unwrap();
        assert_eq!(rebuilt.state_hash(), a.state.state_hash());
        assert!(a.state.verify_materialized().unwrap());
    }

    #[test]
    fn test_concurrent_metadata_edits_converge() {
        let (mut a, mut b) = pair();
        let set = |value: &[u8]| OpKind::SetMetadata {
            key: MetadataKey::Name,
            value: value.to_vec(),
        };
        let first = a.issue(set(b"first")).unwrap();
        b.receive(&[first]);

        // Concurrent renames on top of "first".
        let by_a = a.issue(set(b"alpha")).unwrap();
        let by_b = b.issue(set(b"beta")).unwrap();
        a.receive(&[by_b.clone()]);
        b.receive(&[by_a.clone()]);

        assert_eq!(a.state.state_hash(), b.state.state_hash());
        let winner = a.state.metadata.get(&MetadataKey::Name).unwrap();
        let expected = if (causal_depth(&by_a), by_a.op_id()) > (causal_depth(&by_b), by_b.op_id()) {
            b"alpha".to_vec()
        } else {
            b"beta".to_vec()
        };
        assert_eq!(winner.value, expected);

        // A rename that saw both beats them.
        let last = a.issue(set(b"final")).unwrap();
        b.receive(&[last]);
        assert_eq!(b.state.metadata.name(), Some("final"));
        assert_eq!(a.state.state_hash(), b.state.state_hash());
    }

    #[test]
    fn test_replay_skips_forged_ops() {
        let (a, b) = pair();
        let mut ops = a.state.ops().to_vec();
        let mut forged = b.state.ops()[2].clone();
        forged.seq = 9;
        ops.push(forged);
        let state = GroupState::replay(
            a.state.group_id,
            &ops,
            Arc::new(OpenPolicy),
            HoldLimits::default(),
        );
        assert_eq!(state.op_count(), 3);
        assert_eq!(state.held_count(), 0);
        assert_eq!(state.state_hash(), a.state.state_hash());
    }

    #[test]
    fn test_ops_after_frontier() {
        let (a, _) = pair();
        let mut have = BTreeMap::new();
        have.insert(a.key, 1);
        let missing = a.state.ops_after(&have);
        // A's invite plus B's accept.
        assert_eq!(missing.len(), 2);
        assert!(missing.iter().all(|op| op.op_id() != OpId::new(a.key, 1)));
    }

    /// Random concurrent histories, replayed in random orders, converge.
    #[test]
    fn test_convergence_random_histories() {
        for seed in 0..8u64 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let (founder, create) = Replica::founder();
            let gid = founder.state.group_id;
            let mut replicas = vec![founder];
            for _ in 0..4 {
                let mut r = Replica::new(gid);
                r.receive(&[create.clone()]);
                replicas.push(r);
            }
            let keys: Vec<MemberKey> = replicas.iter().map(|r| r.key).collect();

            for _ in 0..60 {
                let i = rng.gen_range(0..replicas.len());
                match rng.gen_range(0..6) {
                    0 => {
                        let j = rng.gen_range(0..replicas.len());
                        let ops = replicas[j].state.ops().to_vec();
                        replicas[i].receive(&ops);
                    }
                    1 => {
                        let t = keys[rng.gen_range(0..keys.len())];
                        replicas[i].issue(invite(t));
                    }
                    2 => {
                        replicas[i].issue(accept());
                    }
                    3 => {
                        let t = keys[rng.gen_range(0..keys.len())];
                        replicas[i].issue(OpKind::Remove { target: t });
                    }
                    _ => {
                        let t = keys[rng.gen_range(0..keys.len())];
                        replicas[i].issue(OpKind::Promote { target: t });
                    }
                }
            }

            let mut all: Vec<SignedOp> = Vec::new();
            for r in &replicas {
                for op in r.state.ops() {
                    if !all.contains(op) {
                        all.push(op.clone());
                    }
                }
            }

            let mut reference = fresh(gid);
            for op in &all {
                let _ = reference.apply(op, 0);
            }
            assert_eq!(reference.held_count(), 0, "seed {seed}");
            let expected = reference.state_hash();

            for _ in 0..5 {
                let mut shuffled = all.clone();
                shuffled.shuffle(&mut rng);
                let mut s = fresh(gid);
                for op in &shuffled {
                    let _ = s.apply(op, 0);
                }
                assert_eq!(s.state_hash(), expected, "seed {seed} diverged");
            }

            let rebuilt =
                GroupState::materialize(gid, &all, Arc::new(OpenPolicy), HoldLimits::default())
                    .unwrap();
            assert_eq!(rebuilt.state_hash(), expected);

            // Full sync makes every replica agree.
            for r in replicas.iter_mut() {
                r.receive(&all);
                assert_eq!(r.state.state_hash(), expected);
            }
        }
    }
}
