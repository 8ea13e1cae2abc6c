//! `GroupManager`: the device-local façade over every group.
//!
//! Owns one `GroupSlot` per group behind its own `RwLock`, so writes are
//! serialized per group while reads (UI queries) run concurrently. Every
//! mutation follows the same path:
//!
//! 1. take the group write lock, refusing a slot that was deleted
//! 2. judge, sign and persist the op or message
//! 3. collect outbound payloads and UI notices
//! 4. release the lock, then queue the payloads under a read lock and
//!    emit the notices
//!
//! The transport is only ever called from [`GroupManager::flush_outbox`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::broadcast;

use crate::config::{GroupConfig, RetryPolicy};
use crate::crdt::apply::{GroupState, OpEffect};
use crate::crdt::ids::{GroupId, MemberKey, MessageId, OpId};
use crate::crdt::limits::{OpLimitStatus, MAX_OPS_PER_SNAPSHOT};
use crate::crdt::membership::{IgnoreReason, MemberChange, MemberRecord};
use crate::crdt::metadata::MetadataKey;
use crate::crdt::ops::{now_ms, OpError, OpKind, SignedOp};
use crate::crdt::policy::MembershipPolicy;
use crate::error::{GroupError, Result};
use crate::events::{GroupEvent, UserNotice};
use crate::gateway::{
    DedupeCache, DeliveryQueue, KeyAck, KeyDelivery, ResyncRequest, Transport, WirePayload,
};
use crate::group_key::{self, GroupKey, KeyDeliveryTracker, KeyStatus, LocalVault};
use crate::identity::IdentityProvider;
use crate::message::{
    self, EncryptedMessage, MessageBody, MessageEnvelope, MessageError, MessageLog, MessageView,
    SystemNotice,
};
use crate::store::{LogStore, StoreError};

const VAULT_SALT_KEY: &str = "vault_salt";
const VAULT_SALT_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What `ingest` did with one inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New state was admitted.
    Accepted,
    /// Already seen; nothing changed.
    Duplicate,
    /// Buffered until missing predecessors arrive.
    Held,
    /// Authentic, but not addressed to anything this device tracks.
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Per-group state
// ---------------------------------------------------------------------------

struct GroupSlot {
    state: GroupState,
    messages: MessageLog,
    /// Verified messages whose sender is not an accepted member yet.
    held_messages: BTreeMap<MessageId, HeldMessage>,
    key: Option<GroupKey>,
    key_tracker: KeyDeliveryTracker,
    /// Admitted ops whose store append failed. Retried on later writes.
    unsaved: Vec<SignedOp>,
    /// Set under the write lock by `delete_group`; nothing writes after.
    deleted: bool,
}

impl GroupSlot {
    fn new(state: GroupState, messages: MessageLog, key: Option<GroupKey>, retry: RetryPolicy) -> Self {
        GroupSlot {
            state,
            messages,
            held_messages: BTreeMap::new(),
            key,
            key_tracker: KeyDeliveryTracker::new(retry),
            unsaved: Vec::new(),
            deleted: false,
        }
    }
}

struct HeldMessage {
    envelope: MessageEnvelope,
    held_at_ms: u64,
}

/// Snapshot chunks for a group this device does not track yet.
struct PendingJoin {
    ops: BTreeMap<OpId, SignedOp>,
    parts: u32,
    seen: BTreeSet<u32>,
    first_seen_ms: u64,
}

impl PendingJoin {
    fn is_complete(&self) -> bool {
        self.seen.len() >= self.parts as usize
    }
}

/// Write-lock a slot, or `None` if it was deleted after it was looked up.
fn lock_live(slot: &RwLock<GroupSlot>) -> Result<Option<RwLockWriteGuard<'_, GroupSlot>>> {
    let g = slot.write()?;
    Ok(if g.deleted { None } else { Some(g) })
}

/// Payloads and notices collected under a group lock, released after it.
struct Effects {
    group_id: GroupId,
    outgoing: Vec<(Vec<MemberKey>, WirePayload)>,
    notices: Vec<UserNotice>,
}

impl Effects {
    fn new(group_id: GroupId) -> Self {
        Effects {
            group_id,
            outgoing: Vec::new(),
            notices: Vec::new(),
        }
    }

    fn send(&mut self, recipients: Vec<MemberKey>, payload: WirePayload) {
        if !recipients.is_empty() {
            self.outgoing.push((recipients, payload));
        }
    }

    fn notify(&mut self, notice: UserNotice) {
        self.notices.push(notice);
    }
}

// ---------------------------------------------------------------------------
// GroupManager
// ---------------------------------------------------------------------------

pub struct GroupManager {
    config: GroupConfig,
    me: MemberKey,
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn LogStore>,
    transport: Arc<dyn Transport>,
    policy: Arc<dyn MembershipPolicy>,
    vault: LocalVault,
    queue: DeliveryQueue,
    dedupe: DedupeCache,
    events: broadcast::Sender<GroupEvent>,
    groups: RwLock<HashMap<GroupId, Arc<RwLock<GroupSlot>>>>,
    pending_joins: Mutex<HashMap<GroupId, PendingJoin>>,
}

impl GroupManager {
    /// Open the manager and rebuild every stored group from its op log.
    pub fn open(
        config: GroupConfig,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn LogStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let salt = match store.get_meta(VAULT_SALT_KEY)? {
            Some(salt) => salt,
            None => {
                let mut salt = vec![0u8; VAULT_SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                store.put_meta(VAULT_SALT_KEY, &salt)?;
                store.flush()?;
                salt
            }
        };
        let vault = LocalVault::derive(&identity.database_passphrase(), &salt, &config.vault_kdf)?;
        let queue = DeliveryQueue::open(
            store.clone(),
            config.delivery_retry,
            config.delivery_max_age_ms,
        )?;
        let (events, _) = broadcast::channel(config.event_channel_capacity);

        let manager = GroupManager {
            me: identity.member_key(),
            policy: config.policy.build(),
            dedupe: DedupeCache::new(config.dedupe_cache_size),
            config,
            identity,
            store,
            transport,
            vault,
            queue,
            events,
            groups: RwLock::new(HashMap::new()),
            pending_joins: Mutex::new(HashMap::new()),
        };

        {
            let mut groups = manager.groups.write()?;
            for group_id in manager.store.list_groups()? {
                let slot = manager.load_slot(group_id)?;
                log::info!(
                    "Loaded group {} ({} ops, {} messages)",
                    group_id,
                    slot.state.op_count(),
                    slot.messages.len()
                );
                groups.insert(group_id, Arc::new(RwLock::new(slot)));
            }
        }
        Ok(manager)
    }

    fn load_slot(&self, group_id: GroupId) -> Result<GroupSlot> {
        let ops = self.store.load_ops(&group_id)?;
        let state = GroupState::materialize(
            group_id,
            &ops,
            self.policy.clone(),
            self.config.hold_limits(),
        )?;

        let mut messages = MessageLog::new();
        for envelope in self.store.load_messages(&group_id)? {
            if let Err(e) = messages.insert(envelope) {
                log::warn!("Skipping stored message in {}: {}", group_id, e);
            }
        }

        let key = match self.store.load_group_key(&group_id)? {
            Some(sealed) => Some(self.vault.decrypt_local_copy(&group_id, &sealed)?),
            None => None,
        };

        Ok(GroupSlot::new(state, messages, key, self.config.key_retry))
    }

    fn find(&self, group_id: &GroupId) -> Result<Option<Arc<RwLock<GroupSlot>>>> {
        Ok(self.groups.read()?.get(group_id).cloned())
    }

    fn slot(&self, group_id: &GroupId) -> Result<Arc<RwLock<GroupSlot>>> {
        self.find(group_id)?
            .ok_or(GroupError::UnknownGroup(*group_id))
    }

    /// Queue outbound payloads and emit notices. Never called under a
    /// group write lock.
    ///
    /// The read lock is held while queueing so `delete_group` cannot clear
    /// the queue between the check and the enqueue.
    fn finish(&self, slot: &RwLock<GroupSlot>, effects: Effects) -> Result<()> {
        let g = slot.read()?;
        if g.deleted {
            log::debug!(
                "Group {} deleted; discarding {} outgoing payload(s)",
                effects.group_id,
                effects.outgoing.len()
            );
            return Ok(());
        }
        let now = now_ms();
        for (recipients, payload) in &effects.outgoing {
            let bytes = payload.encode()?;
            self.queue
                .enqueue(effects.group_id, recipients, &bytes, now)?;
            log::debug!(
                "Queued {} for {} recipient(s) in {}",
                payload.kind(),
                recipients.len(),
                effects.group_id
            );
        }
        drop(g);
        self.emit(effects.group_id, effects.notices);
        Ok(())
    }

    fn emit(&self, group_id: GroupId, notices: Vec<UserNotice>) {
        for notice in notices {
            // No subscribers is fine.
            let _ = self.events.send(GroupEvent::new(group_id, notice));
        }
    }

    /// Every other member that should see `payload`.
    ///
    /// Membership ops also go to pending invitees so their replica stays
    /// contiguous until they accept, and a remove also goes to its target.
    /// Everything else goes to active members only.
    fn recipients(&self, state: &GroupState, payload: &WirePayload) -> Vec<MemberKey> {
        let is_op = matches!(payload, WirePayload::Op(_));
        let mut out: Vec<MemberKey> = state
            .membership
            .members()
            .values()
            .filter(|r| r.member != self.me)
            .filter(|r| if is_op { !r.removed } else { r.is_active() })
            .map(|r| r.member)
            .collect();
        if let WirePayload::Op(op) = payload {
            match &op.kind {
                OpKind::Remove { target } if *target != self.me && !out.contains(target) => {
                    out.push(*target);
                }
                // The invitee gets the whole history as a snapshot instead.
                OpKind::Invite { target, .. } => out.retain(|m| m != target),
                _ => {}
            }
        }
        out
    }

    fn active_peers(&self, state: &GroupState) -> Vec<MemberKey> {
        state
            .membership
            .active_members()
            .into_iter()
            .filter(|m| *m != self.me)
            .collect()
    }

    /// Split `ops` into numbered snapshot parts addressed to `to`.
    fn send_snapshot(&self, effects: &mut Effects, to: MemberKey, ops: &[SignedOp]) {
        let group_id = effects.group_id;
        let chunk = self.config.snapshot_chunk_ops;
        let parts = ops.len().div_ceil(chunk).max(1) as u32;
        for (part, ops) in ops.chunks(chunk).enumerate() {
            effects.send(
                vec![to],
                WirePayload::Snapshot {
                    group_id,
                    part: part as u32,
                    parts,
                    ops: ops.to_vec(),
                },
            );
        }
    }

    // ---- accessors ---------------------------------------------------------

    pub fn member_key(&self) -> MemberKey {
        self.me
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.events.subscribe()
    }

    pub fn group_ids(&self) -> Result<Vec<GroupId>> {
        let mut ids: Vec<GroupId> = self.groups.read()?.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    pub fn query_members(&self, group_id: &GroupId) -> Result<Vec<MemberRecord>> {
        let slot = self.slot(group_id)?;
        let g = slot.read()?;
        Ok(g.state.query_members())
    }

    /// Messages in display order, decrypted with the key held right now.
    pub fn query_messages(&self, group_id: &GroupId) -> Result<Vec<MessageView>> {
        let slot = self.slot(group_id)?;
        let g = slot.read()?;
        Ok(g.messages.render(g.key.as_ref(), &g.state.membership))
    }

    /// Current value of every group detail that has been set.
    pub fn query_metadata(&self, group_id: &GroupId) -> Result<BTreeMap<MetadataKey, Vec<u8>>> {
        let slot = self.slot(group_id)?;
        let g = slot.read()?;
        Ok(g.state
            .metadata
            .registers()
            .iter()
            .map(|(key, register)| (*key, register.value.clone()))
            .collect())
    }

    pub fn group_name(&self, group_id: &GroupId) -> Result<Option<String>> {
        let slot = self.slot(group_id)?;
        let g = slot.read()?;
        Ok(g.state.metadata.name().map(str::to_string))
    }

    pub fn has_group_key(&self, group_id: &GroupId) -> Result<bool> {
        let slot = self.slot(group_id)?;
        let g = slot.read()?;
        Ok(g.key.is_some())
    }

    pub fn key_status(&self, group_id: &GroupId, member: &MemberKey) -> Result<Option<KeyStatus>> {
        let slot = self.slot(group_id)?;
        let g = slot.read()?;
        Ok(g.key_tracker.status(member))
    }

    /// True if a removed member may still hold the group key.
    pub fn needs_rekey(&self, group_id: &GroupId) -> Result<bool> {
        let slot = self.slot(group_id)?;
        let g = slot.read()?;
        Ok(g.state.membership.needs_rekey())
    }

    pub fn state_hash(&self, group_id: &GroupId) -> Result<[u8; 32]> {
        let slot = self.slot(group_id)?;
        let g = slot.read()?;
        Ok(g.state.state_hash())
    }

    pub fn held_ops(&self, group_id: &GroupId) -> Result<usize> {
        let slot = self.slot(group_id)?;
        let g = slot.read()?;
        Ok(g.state.held_count())
    }

    pub fn held_messages(&self, group_id: &GroupId) -> Result<usize> {
        let slot = self.slot(group_id)?;
        let g = slot.read()?;
        Ok(g.held_messages.len())
    }

    /// Admitted ops still waiting for a successful store append.
    pub fn unsaved_ops(&self, group_id: &GroupId) -> Result<usize> {
        let slot = self.slot(group_id)?;
        let g = slot.read()?;
        Ok(g.unsaved.len())
    }

    pub fn pending_outbound(&self) -> usize {
        self.queue.len()
    }

    /// Rebuild the member table from the persisted op log alone.
    pub fn materialize(&self, group_id: &GroupId) -> Result<Vec<MemberRecord>> {
        // Keep an unknown group an error rather than an empty table.
        self.slot(group_id)?;
        let ops = self.store.load_ops(group_id)?;
        let rebuilt = GroupState::materialize(
            *group_id,
            &ops,
            self.policy.clone(),
            self.config.hold_limits(),
        )?;
        Ok(rebuilt.query_members())
    }

    // ---- local mutations ---------------------------------------------------

    /// Create a group with this device as its only (admin) member.
    pub fn create_group(&self) -> Result<GroupId> {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        let group_id = GroupId::new(&self.me, &nonce);

        let (encryption_pubkey, _) = self.identity.encryption_keypair();
        let (_, signing_key) = self.identity.signing_keypair();
        let op = SignedOp::create_signed(
            group_id,
            OpKind::Create {
                group_nonce: nonce,
                encryption_pubkey,
                device: self.config.device_label.clone(),
            },
            1,
            BTreeMap::new(),
            &signing_key,
        )?;

        let key = group_key::create_group_key();
        let sealed = self.vault.encrypt_local_copy(&group_id, &key)?;
        let mut state = GroupState::new(group_id, self.policy.clone(), self.config.hold_limits());
        let delta = state.apply(&op, now_ms())?;

        self.store.put_group(&group_id)?;
        self.store.append_op(&op)?;
        self.store.put_group_key(&group_id, &sealed)?;

        let slot = Arc::new(RwLock::new(GroupSlot::new(
            state,
            MessageLog::new(),
            Some(key),
            self.config.key_retry,
        )));
        self.groups.write()?.insert(group_id, slot.clone());
        log::info!("Created group {}", group_id);

        let mut effects = Effects::new(group_id);
        if let Some(change) = delta.effect.change() {
            effects.notify(UserNotice::from_change(change, &self.me, &self.me));
        }
        self.finish(&slot, effects)?;
        Ok(group_id)
    }

    pub fn invite(&self, group_id: &GroupId, target: &MemberKey, device: &str) -> Result<OpId> {
        self.issue(
            group_id,
            OpKind::Invite {
                target: *target,
                device: device.to_string(),
            },
        )
    }

    /// Accept a pending invite, publishing this device's encryption key.
    pub fn accept_invite(&self, group_id: &GroupId) -> Result<OpId> {
        let (encryption_pubkey, _) = self.identity.encryption_keypair();
        self.issue(group_id, OpKind::Accept { encryption_pubkey })
    }

    pub fn remove(&self, group_id: &GroupId, target: &MemberKey) -> Result<OpId> {
        self.issue(group_id, OpKind::Remove { target: *target })
    }

    /// Leave the group (or decline a pending invite).
    pub fn leave(&self, group_id: &GroupId) -> Result<OpId> {
        self.issue(group_id, OpKind::Remove { target: self.me })
    }

    pub fn promote(&self, group_id: &GroupId, target: &MemberKey) -> Result<OpId> {
        self.issue(group_id, OpKind::Promote { target: *target })
    }

    /// Set a group detail. Concurrent writes settle on the causally
    /// deepest one.
    pub fn set_metadata(&self, group_id: &GroupId, key: MetadataKey, value: &[u8]) -> Result<OpId> {
        self.issue(
            group_id,
            OpKind::SetMetadata {
                key,
                value: value.to_vec(),
            },
        )
    }

    fn issue(&self, group_id: &GroupId, kind: OpKind) -> Result<OpId> {
        let slot = self.slot(group_id)?;
        self.issue_on(&slot, group_id, kind)
    }

    fn issue_on(&self, slot: &RwLock<GroupSlot>, group_id: &GroupId, kind: OpKind) -> Result<OpId> {
        let mut effects = Effects::new(*group_id);
        let id = {
            let Some(mut g) = lock_live(slot)? else {
                return Err(GroupError::UnknownGroup(*group_id));
            };
            g.state.preview(&self.me, &kind)?;
            match g.state.limit_status() {
                OpLimitStatus::HardCapReached => return Err(OpError::HardCapReached.into()),
                OpLimitStatus::NeedsCompaction => log::warn!(
                    "Group {} holds {} ops and needs compaction",
                    group_id,
                    g.state.op_count()
                ),
                OpLimitStatus::Ok => {}
            }
            self.persist_unsaved(&mut g)?;

            let (_, signing_key) = self.identity.signing_keypair();
            let op = SignedOp::create_signed(
                *group_id,
                kind,
                g.state.next_seq(&self.me),
                g.state.local_deps(&self.me),
                &signing_key,
            )?;
            self.store.append_op(&op)?;
            self.store.flush()?;

            let delta = g.state.apply(&op, now_ms())?;
            g.unsaved
                .extend(delta.released.iter().map(|released| released.op.clone()));
            self.persist_or_keep(&mut g);
            self.on_admitted(&mut g, &op, &delta.effect, &mut effects);
            for released in &delta.released {
                self.on_admitted(&mut g, &released.op, &released.effect, &mut effects);
            }
            self.release_held_messages(&mut g, &mut effects);
            log::debug!("Issued {} {:?} in {}", op.kind.as_str(), op.op_id(), group_id);

            if let OpKind::Invite { target, .. } = &op.kind {
                // The invitee cannot validate the invite without the history.
                self.send_snapshot(&mut effects, *target, g.state.ops());
            }

            let id = op.op_id();
            let payload = WirePayload::Op(op);
            effects.send(self.recipients(&g.state, &payload), payload);
            id
        };
        self.finish(slot, effects)?;
        Ok(id)
    }

    /// Encrypt and broadcast a content message.
    ///
    /// Also re-sends the group key to every active member whose delivery
    /// is unconfirmed and due.
    pub fn send_message(&self, group_id: &GroupId, plaintext: &[u8]) -> Result<MessageId> {
        self.send_body(group_id, |g, seq| {
            let key = g.key.as_ref().ok_or(GroupError::NoGroupKey(*group_id))?;
            Ok(message::encrypt(key, group_id, &self.me, seq, plaintext)?)
        })
    }

    /// Replace the text of one of this device's own messages.
    pub fn edit_message(&self, group_id: &GroupId, target: &MessageId, plaintext: &[u8]) -> Result<MessageId> {
        self.send_body(group_id, |g, seq| {
            g.messages
                .check_change(target, &self.me, false, &g.state.membership)?;
            let key = g.key.as_ref().ok_or(GroupError::NoGroupKey(*group_id))?;
            Ok(message::encrypt_edit(key, group_id, &self.me, seq, *target, plaintext)?)
        })
    }

    /// Delete a message for everyone. Allowed for its sender and for
    /// active admins.
    pub fn delete_message(&self, group_id: &GroupId, target: &MessageId) -> Result<MessageId> {
        self.send_body(group_id, |g, _| {
            g.messages
                .check_change(target, &self.me, true, &g.state.membership)?;
            Ok(EncryptedMessage::Delete { target: *target })
        })
    }

    /// Add (`present`) or withdraw a reaction on a message.
    pub fn react(&self, group_id: &GroupId, target: &MessageId, emoji: &str, present: bool) -> Result<MessageId> {
        self.send_body(group_id, |g, seq| {
            if !g.messages.is_base(target) {
                return Err(MessageError::UnknownTarget(*target).into());
            }
            let key = g.key.as_ref().ok_or(GroupError::NoGroupKey(*group_id))?;
            Ok(message::encrypt_reaction(
                key, group_id, &self.me, seq, *target, emoji, present,
            )?)
        })
    }

    /// Broadcast a cleartext, signed system notice.
    pub fn send_system_notice(&self, group_id: &GroupId, notice: SystemNotice) -> Result<MessageId> {
        self.send_body(group_id, |_, _| Ok(EncryptedMessage::System(notice)))
    }

    fn send_body(
        &self,
        group_id: &GroupId,
        build: impl FnOnce(&GroupSlot, u64) -> Result<EncryptedMessage>,
    ) -> Result<MessageId> {
        let slot = self.slot(group_id)?;
        let mut effects = Effects::new(*group_id);
        let now = now_ms();
        let id = {
            let Some(mut g) = lock_live(&slot)? else {
                return Err(GroupError::UnknownGroup(*group_id));
            };
            if !g.state.membership.is_active(&self.me) {
                return Err(IgnoreReason::IssuerNotActive.into());
            }
            let seq = g.messages.next_seq(&self.me);
            let body = build(&*g, seq)?;
            let envelope = self.commit_message(&mut g, seq, body)?;

            let peers = self.active_peers(&g.state);
            for member in g.key_tracker.due(peers.iter(), now) {
                self.deliver_key(&mut g, &member, now, &mut effects);
            }

            let id = envelope.id();
            let payload = WirePayload::Message(envelope);
            effects.send(self.recipients(&g.state, &payload), payload);
            id
        };
        self.finish(&slot, effects)?;
        Ok(id)
    }

    fn commit_message(
        &self,
        g: &mut GroupSlot,
        seq: u64,
        body: EncryptedMessage,
    ) -> Result<MessageEnvelope> {
        let (_, signing_key) = self.identity.signing_keypair();
        let envelope = MessageEnvelope::create_signed(g.state.group_id, seq, body, &signing_key)?;
        self.store.append_message(&envelope)?;
        self.store.flush()?;
        g.messages.insert(envelope.clone())?;
        Ok(envelope)
    }

    /// Public fan-out; recipients are read from the membership right now.
    pub fn broadcast(&self, group_id: &GroupId, payload: WirePayload) -> Result<usize> {
        if payload.group_id() != group_id {
            return Err(OpError::WrongGroup {
                expected: *group_id,
                got: *payload.group_id(),
            }
            .into());
        }
        let slot = self.slot(group_id)?;
        let recipients = {
            let g = slot.read()?;
            self.recipients(&g.state, &payload)
        };
        let count = recipients.len();
        let mut effects = Effects::new(*group_id);
        effects.send(recipients, payload);
        self.finish(&slot, effects)?;
        Ok(count)
    }

    /// Ask peers for every op past the local frontier.
    pub fn request_resync(&self, group_id: &GroupId) -> Result<()> {
        let slot = self.slot(group_id)?;
        let mut effects = Effects::new(*group_id);
        {
            let Some(mut g) = lock_live(&slot)? else {
                return Err(GroupError::UnknownGroup(*group_id));
            };
            let (_, signing_key) = self.identity.signing_keypair();
            let request = ResyncRequest::create_signed(
                *group_id,
                self.me,
                g.state.frontier().clone(),
                &signing_key,
            )?;
            let peers = self.active_peers(&g.state);
            log::info!("Requesting resync of {} from {} peer(s)", group_id, peers.len());
            effects.send(peers, WirePayload::ResyncRequest(request));
            effects.notify(UserNotice::ResyncRequested);
            g.state.clear_resync();
        }
        self.finish(&slot, effects)
    }

    /// Drop the group locally along with every queued send for it.
    ///
    /// Callers still holding the slot see it as deleted once this returns.
    pub fn delete_group(&self, group_id: &GroupId) -> Result<()> {
        let Some(slot) = self.groups.write()?.remove(group_id) else {
            return Err(GroupError::UnknownGroup(*group_id));
        };
        let dropped = {
            let mut g = slot.write()?;
            g.deleted = true;
            g.unsaved.clear();
            let dropped = self.queue.drop_group(group_id)?;
            self.store.delete_group(group_id)?;
            dropped
        };
        log::info!("Deleted group {} ({} queued sends dropped)", group_id, dropped);
        self.emit(*group_id, vec![UserNotice::GroupDeleted]);
        Ok(())
    }

    // ---- side effects of admitted ops -------------------------------------

    fn on_admitted(
        &self,
        g: &mut GroupSlot,
        op: &SignedOp,
        effect: &OpEffect,
        effects: &mut Effects,
    ) {
        match effect {
            OpEffect::Changed(change) => {
                effects.notify(UserNotice::from_change(change, &self.me, &op.issuer));
                match change {
                    MemberChange::Accepted(member) if *member != self.me => {
                        let invited_by_me = g
                            .state
                            .membership
                            .get(member)
                            .and_then(|r| r.invited_by)
                            .is_some_and(|id| id.issuer == self.me);
                        if invited_by_me {
                            self.deliver_key(g, member, now_ms(), effects);
                        }
                    }
                    MemberChange::Removed { target, .. } | MemberChange::Left(target) => {
                        g.key_tracker.forget(target);
                    }
                    _ => {}
                }
            }
            OpEffect::Ignored(reason) => {
                log::debug!(
                    "{} {:?} has no effect: {}",
                    op.kind.as_str(),
                    op.op_id(),
                    reason
                );
            }
            OpEffect::NoChange | OpEffect::Duplicate => {}
        }
    }

    /// Wrap the group key for `member` and queue it. Failures count as an
    /// attempt and are retried on the tracker's backoff.
    fn deliver_key(&self, g: &mut GroupSlot, member: &MemberKey, now: u64, effects: &mut Effects) {
        let Some(key) = g.key.as_ref() else {
            return;
        };
        let Some(encryption_pubkey) = g
            .state
            .membership
            .get(member)
            .and_then(|r| r.encryption_pubkey)
        else {
            return;
        };

        let group_id = g.state.group_id;
        let (_, signing_key) = self.identity.signing_keypair();
        let delivery = group_key::wrap_for_member(key, &group_id, member, &encryption_pubkey)
            .map_err(GroupError::from)
            .and_then(|blob| {
                KeyDelivery::create_signed(group_id, self.me, *member, blob, &signing_key)
                    .map_err(GroupError::from)
            });
        g.key_tracker.record_attempt(*member, now);
        match delivery {
            Ok(delivery) => {
                log::debug!("Key delivery to {} queued", member.short());
                effects.send(vec![*member], WirePayload::KeyDelivery(delivery));
            }
            Err(e) => log::warn!("Key delivery to {} failed: {}", member.short(), e),
        }
    }

    /// Append every admitted op still missing from the store, oldest first.
    /// Stops at the first failure and keeps the rest.
    fn persist_unsaved(&self, g: &mut GroupSlot) -> Result<()> {
        if g.unsaved.is_empty() {
            return Ok(());
        }
        let mut saved = 0;
        let mut outcome = Ok(());
        for op in &g.unsaved {
            match self.store.append_op(op) {
                Ok(()) => saved += 1,
                Err(StoreError::Conflict(at)) => {
                    log::warn!("Stored op at {} differs from admitted {:?}", at, op.op_id());
                    saved += 1;
                }
                Err(e) => {
                    outcome = Err(GroupError::from(e));
                    break;
                }
            }
        }
        g.unsaved.drain(..saved);
        outcome?;
        self.store.flush()?;
        Ok(())
    }

    fn persist_or_keep(&self, g: &mut GroupSlot) {
        if let Err(e) = self.persist_unsaved(g) {
            log::warn!(
                "{} admitted op(s) in {} not yet stored: {}",
                g.unsaved.len(),
                g.state.group_id,
                e
            );
        }
    }

    /// Store a verified message from an active member and notify the UI.
    fn store_message(
        &self,
        g: &mut GroupSlot,
        envelope: MessageEnvelope,
        effects: &mut Effects,
    ) -> Result<()> {
        let id = envelope.id();
        let target = envelope.body.target().copied();
        self.store.append_message(&envelope)?;
        g.messages.insert(envelope)?;

        match target {
            Some(target) => effects.notify(UserNotice::MessageUpdated(target)),
            None => {
                if let Some(view) = g
                    .messages
                    .render_one(&id, g.key.as_ref(), &g.state.membership)
                {
                    if view.body == MessageBody::Unreadable {
                        effects.notify(UserNotice::MessageUnreadable(id));
                    } else {
                        effects.notify(UserNotice::MessageReceived(view));
                    }
                }
            }
        }
        Ok(())
    }

    /// Settle held messages whose sender has since been accepted or
    /// removed.
    fn release_held_messages(&self, g: &mut GroupSlot, effects: &mut Effects) {
        if g.held_messages.is_empty() {
            return;
        }
        let settled: Vec<MessageId> = g
            .held_messages
            .iter()
            .filter(|(_, held)| {
                g.state
                    .membership
                    .get(&held.envelope.sender)
                    .is_some_and(|r| r.is_active() || r.removed)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in settled {
            let Some(held) = g.held_messages.remove(&id) else {
                continue;
            };
            if !g.state.membership.is_active(&held.envelope.sender) {
                log::debug!("Held message {:?} dropped: sender removed", id);
                continue;
            }
            if let Err(e) = self.store_message(g, held.envelope.clone(), effects) {
                log::warn!("Held message {:?} not stored: {}", id, e);
                g.held_messages.insert(id, held);
                break;
            }
        }
    }

    // ---- inbound -----------------------------------------------------------

    /// Entry point for bytes received from the transport.
    pub fn ingest(&self, bytes: &[u8]) -> Result<IngestOutcome> {
        let payload = WirePayload::decode(bytes)?;
        let kind = payload.kind();
        let dedupe_key = DedupeCache::key(&payload.author(), bytes);
        if self.dedupe.contains(&dedupe_key) {
            log::debug!("Duplicate {} dropped", kind);
            return Ok(IngestOutcome::Duplicate);
        }

        let outcome = match payload {
            WirePayload::Op(op) => self.ingest_op(op),
            WirePayload::Message(envelope) => self.ingest_message(envelope),
            WirePayload::KeyDelivery(delivery) => self.ingest_key_delivery(delivery),
            WirePayload::KeyAck(ack) => self.ingest_key_ack(ack),
            WirePayload::ResyncRequest(request) => self.ingest_resync_request(request),
            WirePayload::Snapshot {
                group_id,
                part,
                parts,
                ops,
            } => self.ingest_snapshot(group_id, part, parts, ops),
        };

        // Held or dropped payloads may become applicable later.
        match &outcome {
            Ok(IngestOutcome::Held | IngestOutcome::Dropped) => {}
            Ok(_) => self.dedupe.remember(dedupe_key),
            Err(e) => log::warn!("Rejected inbound {}: {}", kind, e),
        }
        outcome
    }

    fn ingest_op(&self, op: SignedOp) -> Result<IngestOutcome> {
        let Some(slot) = self.find(&op.group_id)? else {
            log::debug!("Op for unknown group {}", op.group_id);
            return Ok(IngestOutcome::Dropped);
        };
        let mut effects = Effects::new(op.group_id);
        let outcome = {
            let Some(mut g) = lock_live(&slot)? else {
                return Ok(IngestOutcome::Dropped);
            };
            self.apply_inbound(&mut g, &op, &mut effects)?
        };
        self.finish(&slot, effects)?;
        Ok(outcome)
    }

    /// Admit one peer op. The op and anything it released are queued on
    /// the slot and appended to the store; a failed append is retried on
    /// the next write or maintenance pass rather than undoing the admit.
    fn apply_inbound(
        &self,
        g: &mut GroupSlot,
        op: &SignedOp,
        effects: &mut Effects,
    ) -> Result<IngestOutcome> {
        let delta = match g.state.apply(op, now_ms()) {
            Ok(delta) => delta,
            Err(e) if e.is_held() => {
                log::debug!(
                    "Held {} from {}: {}",
                    op.kind.as_str(),
                    op.issuer.short(),
                    e
                );
                return Ok(IngestOutcome::Held);
            }
            Err(e) => return Err(e.into()),
        };
        if !delta.admitted() {
            self.persist_or_keep(g);
            return Ok(IngestOutcome::Duplicate);
        }

        g.unsaved.push(op.clone());
        g.unsaved
            .extend(delta.released.iter().map(|released| released.op.clone()));
        self.persist_or_keep(g);

        self.on_admitted(g, op, &delta.effect, effects);
        for released in &delta.released {
            self.on_admitted(g, &released.op, &released.effect, effects);
        }
        self.release_held_messages(g, effects);
        Ok(IngestOutcome::Accepted)
    }

    /// Only accepted members' messages are stored. Messages from unknown or
    /// pending senders wait for their `Accept`; a removed sender's are
    /// dropped.
    fn ingest_message(&self, envelope: MessageEnvelope) -> Result<IngestOutcome> {
        let Some(slot) = self.find(&envelope.group_id)? else {
            log::debug!("Message for unknown group {}", envelope.group_id);
            return Ok(IngestOutcome::Dropped);
        };
        let mut effects = Effects::new(envelope.group_id);
        let outcome = {
            let Some(mut g) = lock_live(&slot)? else {
                return Ok(IngestOutcome::Dropped);
            };
            let id = envelope.id();
            if let Some(existing) = g.messages.get(&id) {
                return if *existing == envelope {
                    Ok(IngestOutcome::Duplicate)
                } else {
                    Err(MessageError::Conflict(id).into())
                };
            }
            if let Some(held) = g.held_messages.get(&id) {
                return if held.envelope == envelope {
                    Ok(IngestOutcome::Held)
                } else {
                    Err(MessageError::Conflict(id).into())
                };
            }
            if !envelope.verify() {
                return Err(MessageError::SignatureInvalid.into());
            }

            let sender = g
                .state
                .membership
                .get(&envelope.sender)
                .map(|r| (r.is_active(), r.removed));
            match sender {
                Some((true, _)) => {
                    self.store_message(&mut g, envelope, &mut effects)?;
                    IngestOutcome::Accepted
                }
                Some((_, true)) => {
                    log::debug!("Message {:?} from removed member dropped", id);
                    return Ok(IngestOutcome::Dropped);
                }
                _ => {
                    if g.held_messages.len() >= self.config.max_held_messages {
                        log::warn!(
                            "Message hold full in {}; dropping {:?}",
                            envelope.group_id,
                            id
                        );
                        return Ok(IngestOutcome::Dropped);
                    }
                    log::debug!("Holding message {:?} until its sender is accepted", id);
                    g.held_messages.insert(
                        id,
                        HeldMessage {
                            envelope,
                            held_at_ms: now_ms(),
                        },
                    );
                    IngestOutcome::Held
                }
            }
        };
        self.finish(&slot, effects)?;
        Ok(outcome)
    }

    fn ingest_key_delivery(&self, delivery: KeyDelivery) -> Result<IngestOutcome> {
        if delivery.recipient != self.me {
            return Ok(IngestOutcome::Dropped);
        }
        if !delivery.verify() {
            return Err(GroupError::SignatureInvalid("key delivery"));
        }
        let group_id = delivery.group_id;
        let Some(slot) = self.find(&group_id)? else {
            return Ok(IngestOutcome::Dropped);
        };

        let mut effects = Effects::new(group_id);
        let outcome = {
            let Some(mut g) = lock_live(&slot)? else {
                return Ok(IngestOutcome::Dropped);
            };
            if !g.state.membership.is_active(&delivery.sender) {
                log::debug!(
                    "Key from non-member {} ignored",
                    delivery.sender.short()
                );
                return Ok(IngestOutcome::Dropped);
            }

            let outcome = if g.key.is_some() {
                IngestOutcome::Duplicate
            } else {
                let (_, encryption_secret) = self.identity.encryption_keypair();
                let key =
                    group_key::unwrap(&delivery.blob, &group_id, &self.me, &encryption_secret)?;
                let sealed = self.vault.encrypt_local_copy(&group_id, &key)?;
                self.store.put_group_key(&group_id, &sealed)?;
                g.key = Some(key);
                log::info!(
                    "Received group key for {} from {}",
                    group_id,
                    delivery.sender.short()
                );
                effects.notify(UserNotice::KeyReceived);
                IngestOutcome::Accepted
            };

            // Re-acknowledge duplicates too; the first ack may have been lost.
            let (_, signing_key) = self.identity.signing_keypair();
            let ack = KeyAck::create_signed(group_id, self.me, &signing_key)?;
            let mut recipients = self.active_peers(&g.state);
            if !recipients.contains(&delivery.sender) {
                recipients.push(delivery.sender);
            }
            effects.send(recipients, WirePayload::KeyAck(ack));
            outcome
        };
        self.finish(&slot, effects)?;
        Ok(outcome)
    }

    fn ingest_key_ack(&self, ack: KeyAck) -> Result<IngestOutcome> {
        if !ack.verify() {
            return Err(GroupError::SignatureInvalid("key ack"));
        }
        let Some(slot) = self.find(&ack.group_id)? else {
            return Ok(IngestOutcome::Dropped);
        };
        let Some(mut g) = lock_live(&slot)? else {
            return Ok(IngestOutcome::Dropped);
        };
        if !g.state.membership.is_known(&ack.member) {
            return Ok(IngestOutcome::Dropped);
        }
        if g.key_tracker.is_confirmed(&ack.member) {
            return Ok(IngestOutcome::Duplicate);
        }
        g.key_tracker.confirm(ack.member);
        log::debug!("Key confirmed by {}", ack.member.short());
        Ok(IngestOutcome::Accepted)
    }

    fn ingest_resync_request(&self, request: ResyncRequest) -> Result<IngestOutcome> {
        if !request.verify() {
            return Err(GroupError::SignatureInvalid("resync request"));
        }
        let Some(slot) = self.find(&request.group_id)? else {
            return Ok(IngestOutcome::Dropped);
        };
        let mut effects = Effects::new(request.group_id);
        let outcome = {
            let g = slot.read()?;
            if g.deleted || request.from == self.me || !g.state.membership.is_known(&request.from) {
                return Ok(IngestOutcome::Dropped);
            }
            let missing = g.state.ops_after(&request.have);
            if missing.is_empty() {
                IngestOutcome::Duplicate
            } else {
                log::debug!(
                    "Answering resync from {} with {} op(s)",
                    request.from.short(),
                    missing.len()
                );
                self.send_snapshot(&mut effects, request.from, &missing);
                IngestOutcome::Accepted
            }
        };
        self.finish(&slot, effects)?;
        Ok(outcome)
    }

    fn ingest_snapshot(
        &self,
        group_id: GroupId,
        part: u32,
        parts: u32,
        ops: Vec<SignedOp>,
    ) -> Result<IngestOutcome> {
        if ops.len() > MAX_OPS_PER_SNAPSHOT {
            return Err(OpError::Malformed(format!("snapshot of {} ops", ops.len())).into());
        }
        if part >= parts {
            return Err(OpError::Malformed(format!("snapshot part {} of {}", part, parts)).into());
        }
        match self.find(&group_id)? {
            Some(slot) => self.apply_snapshot(&slot, &ops),
            None => self.join_from_snapshot(group_id, part, parts, ops),
        }
    }

    fn apply_snapshot(&self, slot: &RwLock<GroupSlot>, ops: &[SignedOp]) -> Result<IngestOutcome> {
        let (outcome, effects) = {
            let Some(mut g) = lock_live(slot)? else {
                return Ok(IngestOutcome::Dropped);
            };
            let mut effects = Effects::new(g.state.group_id);
            (self.apply_batch(&mut g, ops, &mut effects)?, effects)
        };
        self.finish(slot, effects)?;
        Ok(outcome)
    }

    fn apply_batch(
        &self,
        g: &mut GroupSlot,
        ops: &[SignedOp],
        effects: &mut Effects,
    ) -> Result<IngestOutcome> {
        let (mut accepted, mut held) = (false, false);
        for op in ops {
            match self.apply_inbound(g, op, effects) {
                Ok(IngestOutcome::Accepted) => accepted = true,
                Ok(IngestOutcome::Held) => held = true,
                Ok(_) => {}
                Err(GroupError::Store(e)) => return Err(e.into()),
                Err(e) => log::warn!("Snapshot op {:?} rejected: {}", op.op_id(), e),
            }
        }
        Ok(if accepted {
            IngestOutcome::Accepted
        } else if held {
            IngestOutcome::Held
        } else {
            IngestOutcome::Duplicate
        })
    }

    /// Buffer one part of a snapshot for an untracked group and join once
    /// the buffered history proves an invite for this device.
    ///
    /// Parts may arrive in any order. A history that completes without a
    /// valid invite is discarded.
    fn join_from_snapshot(
        &self,
        group_id: GroupId,
        part: u32,
        parts: u32,
        ops: Vec<SignedOp>,
    ) -> Result<IngestOutcome> {
        let (state, inviter) = {
            let mut pending = self.pending_joins.lock()?;
            if !pending.contains_key(&group_id) && pending.len() >= self.config.max_pending_joins {
                let oldest = pending
                    .iter()
                    .min_by_key(|(_, join)| join.first_seen_ms)
                    .map(|(id, _)| *id);
                if let Some(oldest) = oldest {
                    pending.remove(&oldest);
                    log::debug!("Dropped partial snapshot for {}", oldest);
                }
            }

            let join = pending.entry(group_id).or_insert_with(|| PendingJoin {
                ops: BTreeMap::new(),
                parts,
                seen: BTreeSet::new(),
                first_seen_ms: now_ms(),
            });
            join.parts = join.parts.max(parts);
            join.seen.insert(part);
            let mut overflow = 0;
            for op in ops {
                if op.group_id != group_id {
                    continue;
                }
                let id = op.op_id();
                if join.ops.len() >= self.config.max_pending_join_ops && !join.ops.contains_key(&id) {
                    overflow += 1;
                    continue;
                }
                join.ops.entry(id).or_insert(op);
            }
            if overflow > 0 {
                log::warn!(
                    "Snapshot buffer for {} full; {} op(s) not kept",
                    group_id,
                    overflow
                );
            }

            let complete = join.is_complete();
            let names_me = join
                .ops
                .values()
                .any(|op| matches!(&op.kind, OpKind::Invite { target, .. } if *target == self.me));
            if !names_me {
                if complete {
                    pending.remove(&group_id);
                    log::debug!("Snapshot for unknown group {} ignored", group_id);
                    return Ok(IngestOutcome::Dropped);
                }
                return Ok(IngestOutcome::Held);
            }

            let buffered: Vec<SignedOp> = join.ops.values().cloned().collect();
            let state = GroupState::replay(
                group_id,
                &buffered,
                self.policy.clone(),
                self.config.hold_limits(),
            );
            let inviter = state
                .membership
                .get(&self.me)
                .filter(|r| r.is_pending())
                .and_then(|r| r.invited_by)
                .map(|id| id.issuer);
            match inviter {
                Some(inviter) => {
                    pending.remove(&group_id);
                    (state, inviter)
                }
                None if complete => {
                    pending.remove(&group_id);
                    log::warn!("Snapshot for {} carries no valid invite", group_id);
                    return Ok(IngestOutcome::Dropped);
                }
                None => return Ok(IngestOutcome::Held),
            }
        };
        self.adopt_joined(group_id, state, inviter)
    }

    fn adopt_joined(&self, group_id: GroupId, state: GroupState, inviter: MemberKey) -> Result<IngestOutcome> {
        let slot = {
            let mut groups = self.groups.write()?;
            if let Some(existing) = groups.get(&group_id).cloned() {
                // Joined concurrently through another snapshot.
                drop(groups);
                return self.apply_snapshot(&existing, state.ops());
            }
            self.store.put_group(&group_id)?;
            for op in state.ops() {
                self.store.append_op(op)?;
            }
            self.store.flush()?;
            log::info!(
                "Invited to group {} by {} ({} ops)",
                group_id,
                inviter.short(),
                state.op_count()
            );
            let slot = Arc::new(RwLock::new(GroupSlot::new(
                state,
                MessageLog::new(),
                None,
                self.config.key_retry,
            )));
            groups.insert(group_id, slot.clone());
            slot
        };

        let mut effects = Effects::new(group_id);
        effects.notify(UserNotice::InvitedToGroup { by: inviter });
        self.finish(&slot, effects)?;
        Ok(IngestOutcome::Accepted)
    }

    // ---- delivery ----------------------------------------------------------

    pub fn flush_outbox(&self) -> Result<FlushReport> {
        self.flush_outbox_at(now_ms())
    }

    /// Send every due entry. A failure for one recipient only reschedules
    /// that entry.
    pub fn flush_outbox_at(&self, now: u64) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        for delivery in self.queue.due(now)? {
            match self
                .transport
                .send_to_member(&delivery.recipient, &delivery.payload)
            {
                Ok(()) => {
                    self.queue.mark_delivered(&delivery.id)?;
                    report.delivered += 1;
                }
                Err(e) => {
                    log::debug!(
                        "Delivery to {} failed (attempt {}): {}",
                        delivery.recipient.short(),
                        delivery.attempts + 1,
                        e
                    );
                    self.queue.mark_failed(&delivery.id, now)?;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Housekeeping for every group: retry unsaved ops, expire held ops
    /// and messages, request a resync where needed, then expire stale
    /// outbox entries and partial snapshots. Returns how many resyncs were
    /// requested.
    pub fn run_maintenance(&self, now: u64) -> Result<usize> {
        let slots: Vec<(GroupId, Arc<RwLock<GroupSlot>>)> = self
            .groups
            .read()?
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let max_age = self.config.hold_max_age_ms;
        let mut requested = 0;
        for (group_id, slot) in slots {
            let needs_resync = {
                let Some(mut g) = lock_live(&slot)? else {
                    continue;
                };
                self.persist_or_keep(&mut g);
                g.state.expire_held(now);
                g.held_messages.retain(|id, held| {
                    let keep = now.saturating_sub(held.held_at_ms) <= max_age;
                    if !keep {
                        log::debug!("Dropping held message {:?}: sender never accepted", id);
                    }
                    keep
                });
                g.state.needs_resync()
            };
            if needs_resync {
                self.request_resync(&group_id)?;
                requested += 1;
            }
        }

        let expired = self.queue.expire(now)?;
        if expired > 0 {
            log::info!("Gave up on {} outbound delivery(ies)", expired);
        }
        self.pending_joins
            .lock()?
            .retain(|_, join| now.saturating_sub(join.first_seen_ms) <= max_age);
        Ok(requested)
    }
}
