//! Durable state across process restarts, on the sled backend.

mod common;

use std::sync::Arc;

use common::{test_config, Net};
use shield_groups::crdt::now_ms;
use shield_groups::{GroupError, LogStore, MessageBody, SledStore, StaticIdentity};
use tempfile::tempdir;

const TWO_HOURS_MS: u64 = 2 * 60 * 60 * 1000;

#[test]
fn test_outbox_and_group_survive_restart() {
    let dir = tempdir().unwrap();
    let mut net = Net::new();
    let b = net.add_device();
    let a_identity = Arc::new(StaticIdentity::generate(b"a passphrase"));
    net.transport.set_offline(b.key, true);

    let gid = {
        let store: Arc<dyn LogStore> = Arc::new(SledStore::open(dir.path()).unwrap());
        let a = net.open_device(test_config(), a_identity.clone(), store);
        let gid = a.manager.create_group().unwrap();
        a.manager.invite(&gid, &b.key, "b").unwrap();
        net.pump();
        // B is unreachable; the snapshot waits in the outbox.
        assert_eq!(a.manager.pending_outbound(), 1);
        net.remove_device(&a.key);
        gid
    };

    let store: Arc<dyn LogStore> = Arc::new(SledStore::open(dir.path()).unwrap());
    let a = net.open_device(test_config(), a_identity, store);
    assert_eq!(a.manager.group_ids().unwrap(), vec![gid]);
    assert!(a.manager.has_group_key(&gid).unwrap());
    assert_eq!(a.manager.pending_outbound(), 1);
    assert_eq!(a.manager.materialize(&gid).unwrap().len(), 2);

    net.transport.set_offline(b.key, false);
    // The failed attempt pushed the entry into backoff.
    assert_eq!(a.manager.flush_outbox().unwrap().delivered, 0);
    let report = a.manager.flush_outbox_at(now_ms() + TWO_HOURS_MS).unwrap();
    assert_eq!(report.delivered, 1);
    net.pump();
    assert_eq!(b.manager.group_ids().unwrap(), vec![gid]);

    b.manager.accept_invite(&gid).unwrap();
    net.pump();
    a.manager.send_message(&gid, b"after restart").unwrap();
    net.pump();
    let messages = b.manager.query_messages(&gid).unwrap();
    assert_eq!(
        messages[0].body,
        MessageBody::Content(b"after restart".to_vec())
    );
    assert_eq!(
        a.manager.state_hash(&gid).unwrap(),
        b.manager.state_hash(&gid).unwrap()
    );
}

#[test]
fn test_deleted_group_stays_deleted() {
    let dir = tempdir().unwrap();
    let mut net = Net::new();
    let identity = Arc::new(StaticIdentity::generate(b"pw"));

    let (kept, deleted) = {
        let store: Arc<dyn LogStore> = Arc::new(SledStore::open(dir.path()).unwrap());
        let a = net.open_device(test_config(), identity.clone(), store);
        let kept = a.manager.create_group().unwrap();
        let deleted = a.manager.create_group().unwrap();
        a.manager.send_message(&deleted, b"gone").unwrap();
        a.manager.delete_group(&deleted).unwrap();
        net.remove_device(&a.key);
        (kept, deleted)
    };

    let store: Arc<dyn LogStore> = Arc::new(SledStore::open(dir.path()).unwrap());
    assert!(store.load_messages(&deleted).unwrap().is_empty());
    assert!(store.load_group_key(&deleted).unwrap().is_none());
    let a = net.open_device(test_config(), identity, store);
    assert_eq!(a.manager.group_ids().unwrap(), vec![kept]);
    assert!(matches!(
        a.manager.send_message(&deleted, b"again"),
        Err(GroupError::UnknownGroup(_))
    ));
}
