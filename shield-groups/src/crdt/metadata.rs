/// Group metadata: last-writer-wins registers for name, topic and avatar.
///
/// Each key is an independent register holding the value of the winning
/// `SetMetadata` op. The winner is the op with the largest
/// `(causal depth, op id)`. An op always has a larger depth than anything
/// in its causal past, so a later edit beats the value it overwrote and
/// concurrent edits are settled by op id on every replica alike.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crdt::ids::OpId;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MetadataKey {
    Name = 0,
    Topic = 1,
    /// Opaque avatar reference (hash or URI), not the image itself.
    Avatar = 2,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LwwRegister {
    pub value: Vec<u8>,
    pub depth: u64,
    pub writer_op: OpId,
}

impl LwwRegister {
    fn beaten_by(&self, depth: u64, op_id: OpId) -> bool {
        (depth, op_id) > (self.depth, self.writer_op)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MetadataState {
    registers: BTreeMap<MetadataKey, LwwRegister>,
}

impl MetadataState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registers(&self) -> &BTreeMap<MetadataKey, LwwRegister> {
        &self.registers
    }

    pub fn get(&self, key: &MetadataKey) -> Option<&LwwRegister> {
        self.registers.get(key)
    }

    pub fn name(&self) -> Option<&str> {
        self.text(MetadataKey::Name)
    }

    pub fn topic(&self) -> Option<&str> {
        self.text(MetadataKey::Topic)
    }

    fn text(&self, key: MetadataKey) -> Option<&str> {
        self.registers
            .get(&key)
            .and_then(|r| std::str::from_utf8(&r.value).ok())
    }

    /// Apply a valid `SetMetadata`. Returns true if the register moved.
    pub fn apply_set(&mut self, key: MetadataKey, value: &[u8], depth: u64, op_id: OpId) -> bool {
        let wins = self
            .registers
            .get(&key)
            .map_or(true, |reg| reg.beaten_by(depth, op_id));
        if wins {
            self.registers.insert(
                key,
                LwwRegister {
                    value: value.to_vec(),
                    depth,
                    writer_op: op_id,
                },
            );
        }
        wins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::ids::MemberKey;

    fn id(byte: u8, seq: u64) -> OpId {
        OpId::new(MemberKey([byte; 32]), seq)
    }

    #[test]
    fn test_set_and_get_name() {
        let mut meta = MetadataState::new();
        assert!(meta.name().is_none());
        assert!(meta.apply_set(MetadataKey::Name, b"My Group", 3, id(1, 3)));
        assert_eq!(meta.name(), Some("My Group"));
        assert!(meta.topic().is_none());
    }

    #[test]
    fn test_deeper_write_wins() {
        let mut meta = MetadataState::new();
        meta.apply_set(MetadataKey::Topic, b"new", 9, id(1, 2));
        assert!(!meta.apply_set(MetadataKey::Topic, b"old", 4, id(2, 4)));
        assert_eq!(meta.topic(), Some("new"));
    }

    #[test]
    fn test_equal_depth_settled_by_op_id_in_any_order() {
        let mut first = MetadataState::new();
        first.apply_set(MetadataKey::Name, b"low", 5, id(1, 5));
        first.apply_set(MetadataKey::Name, b"high", 5, id(2, 5));

        let mut second = MetadataState::new();
        second.apply_set(MetadataKey::Name, b"high", 5, id(2, 5));
        second.apply_set(MetadataKey::Name, b"low", 5, id(1, 5));

        assert_eq!(first.name(), Some("high"));
        assert_eq!(first.registers(), second.registers());
    }
}
