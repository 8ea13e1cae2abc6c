//! Persisted per-recipient outbound queue.
//!
//! Every send becomes one [`OutboundDelivery`] per recipient, written to
//! the log store before the transport is touched. Each entry is retried on
//! its own schedule with exponential backoff `min(base * 2^attempts, cap)`
//! and leaves the queue on success, when its group is deleted, or when it
//! outlives the max age (a recipient that never comes back).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::crdt::ids::{GroupId, MemberKey};
use crate::store::{LogStore, Result, StoreError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundDelivery {
    pub id: Uuid,
    pub group_id: GroupId,
    pub recipient: MemberKey,
    /// Encoded `WirePayload`.
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub next_attempt_ms: u64,
    pub created_ms: u64,
}

impl OutboundDelivery {
    pub fn new(group_id: GroupId, recipient: MemberKey, payload: Vec<u8>, now_ms: u64) -> Self {
        OutboundDelivery {
            id: Uuid::new_v4(),
            group_id,
            recipient,
            payload,
            attempts: 0,
            next_attempt_ms: now_ms,
            created_ms: now_ms,
        }
    }
}

pub struct DeliveryQueue {
    store: Arc<dyn LogStore>,
    retry: RetryPolicy,
    max_age_ms: u64,
    entries: Mutex<BTreeMap<Uuid, OutboundDelivery>>,
}

impl DeliveryQueue {
    /// Load any entries left over from a previous run.
    pub fn open(store: Arc<dyn LogStore>, retry: RetryPolicy, max_age_ms: u64) -> Result<Self> {
        let entries = store
            .load_outbound()?
            .into_iter()
            .map(|d| (d.id, d))
            .collect();
        Ok(DeliveryQueue {
            store,
            retry,
            max_age_ms,
            entries: Mutex::new(entries),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<Uuid, OutboundDelivery>>> {
        self.entries.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// One entry per recipient, all due immediately.
    pub fn enqueue(
        &self,
        group_id: GroupId,
        recipients: &[MemberKey],
        payload: &[u8],
        now_ms: u64,
    ) -> Result<Vec<Uuid>> {
        let mut entries = self.lock()?;
        let mut ids = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let delivery = OutboundDelivery::new(group_id, *recipient, payload.to_vec(), now_ms);
            self.store.put_outbound(&delivery)?;
            ids.push(delivery.id);
            entries.insert(delivery.id, delivery);
        }
        if !recipients.is_empty() {
            self.store.flush()?;
        }
        Ok(ids)
    }

    /// Entries whose retry time has come, oldest first.
    pub fn due(&self, now_ms: u64) -> Result<Vec<OutboundDelivery>> {
        let entries = self.lock()?;
        let mut due: Vec<OutboundDelivery> = entries
            .values()
            .filter(|d| d.next_attempt_ms <= now_ms)
            .cloned()
            .collect();
        due.sort_by_key(|d| (d.created_ms, d.id));
        Ok(due)
    }

    pub fn mark_delivered(&self, id: &Uuid) -> Result<()> {
        let mut entries = self.lock()?;
        if let Some(d) = entries.remove(id) {
            self.store.remove_outbound(&d.group_id, id)?;
        }
        Ok(())
    }

    pub fn mark_failed(&self, id: &Uuid, now_ms: u64) -> Result<()> {
        let mut entries = self.lock()?;
        if let Some(d) = entries.get_mut(id) {
            d.next_attempt_ms = now_ms.saturating_add(self.retry.delay_ms(d.attempts));
            d.attempts = d.attempts.saturating_add(1);
            self.store.put_outbound(d)?;
        }
        Ok(())
    }

    /// Give up on entries older than the max age. Returns how many.
    pub fn expire(&self, now_ms: u64) -> Result<usize> {
        let mut entries = self.lock()?;
        let stale: Vec<OutboundDelivery> = entries
            .values()
            .filter(|d| now_ms.saturating_sub(d.created_ms) > self.max_age_ms)
            .cloned()
            .collect();
        for d in &stale {
            log::warn!(
                "Giving up on send to {} after {} attempts",
                d.recipient.short(),
                d.attempts
            );
            self.store.remove_outbound(&d.group_id, &d.id)?;
            entries.remove(&d.id);
        }
        Ok(stale.len())
    }

    /// Drop every queued send for a group. The persisted copies go with
    /// `LogStore::delete_group`.
    pub fn drop_group(&self, group_id: &GroupId) -> Result<usize> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, d| d.group_id != *group_id);
        Ok(before - entries.len())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_for(&self, group_id: &GroupId, recipient: &MemberKey) -> usize {
        self.lock()
            .map(|e| {
                e.values()
                    .filter(|d| d.group_id == *group_id && d.recipient == *recipient)
                    .count()
            })
            .unwrap_or(0)
    }
}
