use std::collections::BTreeMap;
use std::path::Path;

use super::{LogStore, Result, StoreError, Tree};

/// Durable store backed by sled, one sled tree per [`Tree`].
pub struct SledStore {
    db: sled::Db,
    trees: BTreeMap<Tree, sled::Tree>,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("trees", &self.trees.len())
            .finish()
    }
}

impl SledStore {
    /// Open or create a store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        let mut trees = BTreeMap::new();
        for tree in Tree::ALL {
            trees.insert(tree, db.open_tree(tree.name())?);
        }
        Ok(SledStore { db, trees })
    }

    fn tree(&self, tree: Tree) -> Result<&sled::Tree> {
        self.trees
            .get(&tree)
            .ok_or_else(|| StoreError::Backend(format!("tree {} not open", tree.name())))
    }

    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

impl LogStore for SledStore {
    fn insert_unique(&self, tree: Tree, key: &[u8], value: &[u8]) -> Result<()> {
        match self
            .tree(tree)?
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?
        {
            Ok(()) => Ok(()),
            Err(cas) => match cas.current {
                Some(current) if &*current == value => Ok(()),
                _ => Err(StoreError::Conflict(hex::encode(key))),
            },
        }
    }

    fn put(&self, tree: Tree, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree(tree)?.insert(key, value)?;
        Ok(())
    }

    fn get(&self, tree: Tree, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree(tree)?.get(key)?.map(|v| v.to_vec()))
    }

    fn remove(&self, tree: Tree, key: &[u8]) -> Result<()> {
        self.tree(tree)?.remove(key)?;
        Ok(())
    }

    fn scan_prefix(&self, tree: Tree, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.tree(tree)?
            .scan_prefix(prefix)
            .map(|item| {
                let (k, v) = item?;
                Ok((k.to_vec(), v.to_vec()))
            })
            .collect()
    }

    fn remove_prefix(&self, tree: Tree, prefix: &[u8]) -> Result<()> {
        let t = self.tree(tree)?;
        let keys: Vec<sled::IVec> = t
            .scan_prefix(prefix)
            .keys()
            .collect::<std::result::Result<_, _>>()?;
        for key in keys {
            t.remove(key)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::conformance;
    use super::*;
    use crate::crdt::ids::GroupId;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, SledStore) {
        let dir = TempDir::new().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_op_log_append_only() {
        let (_dir, store) = open_temp();
        conformance::op_log_append_only(&store);
    }

    #[test]
    fn test_groups_and_delete() {
        let (_dir, store) = open_temp();
        conformance::groups_and_delete(&store);
    }

    #[test]
    fn test_outbox_roundtrip() {
        let (_dir, store) = open_temp();
        conformance::outbox_roundtrip(&store);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let gid = GroupId([9u8; 32]);
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.put_group(&gid).unwrap();
            store.put_group_key(&gid, b"sealed").unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.list_groups().unwrap(), vec![gid]);
        assert_eq!(store.load_group_key(&gid).unwrap(), Some(b"sealed".to_vec()));
    }
}
