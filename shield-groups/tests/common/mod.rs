//! In-process network for multi-device tests.
//!
//! Every device shares one loopback transport. `Net::pump` flushes all
//! outboxes and hands each payload straight to the recipient's
//! `ingest`, repeating until nothing is left in flight.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use shield_groups::crypto::KdfParams;
use shield_groups::{
    GroupConfig, GroupManager, IngestOutcome, LogStore, MemberKey, MemoryStore, RetryPolicy,
    StaticIdentity, Transport, TransportError, UserNotice, WirePayload,
};
use tokio::sync::broadcast;

/// Cheap KDF and immediate key re-delivery so tests stay fast.
pub fn test_config() -> GroupConfig {
    GroupConfig {
        vault_kdf: KdfParams {
            mem_cost_kib: 256,
            time_cost: 1,
            parallelism: 1,
        },
        key_retry: RetryPolicy {
            base_ms: 1,
            cap_ms: 1,
        },
        ..GroupConfig::default()
    }
}

#[derive(Default)]
pub struct Loopback {
    in_flight: Mutex<VecDeque<(MemberKey, Vec<u8>)>>,
    offline: Mutex<HashSet<MemberKey>>,
}

impl Loopback {
    pub fn set_offline(&self, member: MemberKey, offline: bool) {
        let mut set = self.offline.lock().unwrap();
        if offline {
            set.insert(member);
        } else {
            set.remove(&member);
        }
    }

    fn drain(&self) -> Vec<(MemberKey, Vec<u8>)> {
        self.in_flight.lock().unwrap().drain(..).collect()
    }
}

impl Transport for Loopback {
    fn send_to_member(&self, member: &MemberKey, bytes: &[u8]) -> Result<(), TransportError> {
        if self.offline.lock().unwrap().contains(member) {
            return Err(TransportError::TransportUnavailable(format!(
                "{} unreachable",
                member.short()
            )));
        }
        self.in_flight
            .lock()
            .unwrap()
            .push_back((*member, bytes.to_vec()));
        Ok(())
    }
}

#[derive(Clone)]
pub struct Device {
    pub key: MemberKey,
    pub manager: Arc<GroupManager>,
    pub identity: Arc<StaticIdentity>,
    pub store: Arc<dyn LogStore>,
    /// Every payload handed to this device by `pump`.
    pub received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Device {
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }
}

pub struct Net {
    pub transport: Arc<Loopback>,
    devices: Vec<Device>,
}

impl Net {
    pub fn new() -> Self {
        Net {
            transport: Arc::new(Loopback::default()),
            devices: Vec::new(),
        }
    }

    pub fn add_device(&mut self) -> Device {
        self.add_device_with(test_config(), Arc::new(MemoryStore::new()))
    }

    pub fn add_device_with(&mut self, config: GroupConfig, store: Arc<dyn LogStore>) -> Device {
        let identity = Arc::new(StaticIdentity::generate(b"device passphrase"));
        self.open_device(config, identity, store)
    }

    /// Open a manager for an existing identity, replacing any device with
    /// the same key.
    pub fn open_device(
        &mut self,
        config: GroupConfig,
        identity: Arc<StaticIdentity>,
        store: Arc<dyn LogStore>,
    ) -> Device {
        let manager = GroupManager::open(
            config,
            identity.clone(),
            store.clone(),
            self.transport.clone(),
        )
        .unwrap();
        let device = Device {
            key: manager.member_key(),
            manager: Arc::new(manager),
            identity,
            store,
            received: Arc::new(Mutex::new(Vec::new())),
        };
        self.devices.retain(|d| d.key != device.key);
        self.devices.push(device.clone());
        device
    }

    /// Forget a device so its manager (and store) can be dropped.
    pub fn remove_device(&mut self, key: &MemberKey) {
        self.devices.retain(|d| d.key != *key);
    }

    pub fn pump(&self) -> usize {
        self.pump_filtered(|_, _| true)
    }

    /// Deliver until quiet. Payloads for which `keep` is false are lost in
    /// transit. Returns how many payloads were delivered.
    pub fn pump_filtered(&self, keep: impl Fn(&MemberKey, &WirePayload) -> bool) -> usize {
        let mut delivered = 0;
        for _ in 0..64 {
            for device in &self.devices {
                device.manager.flush_outbox().unwrap();
            }
            let batch = self.transport.drain();
            if batch.is_empty() {
                break;
            }
            for (to, bytes) in batch {
                let Some(device) = self.devices.iter().find(|d| d.key == to) else {
                    continue;
                };
                let payload = WirePayload::decode(&bytes).unwrap();
                if !keep(&to, &payload) {
                    continue;
                }
                device.received.lock().unwrap().push(bytes.clone());
                let _: Result<IngestOutcome, _> = device.manager.ingest(&bytes);
                delivered += 1;
            }
        }
        delivered
    }
}

pub fn drain_notices(rx: &mut broadcast::Receiver<shield_groups::GroupEvent>) -> Vec<UserNotice> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event.notice);
    }
    out
}
