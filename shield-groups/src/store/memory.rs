use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{LogStore, Result, StoreError, Tree};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Volatile store, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    trees: Mutex<BTreeMap<Tree, Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tree<R>(&self, tree: Tree, f: impl FnOnce(&mut Table) -> R) -> Result<R> {
        let mut trees = self.trees.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(f(trees.entry(tree).or_default()))
    }
}

impl LogStore for MemoryStore {
    fn insert_unique(&self, tree: Tree, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_tree(tree, |t| match t.get(key) {
            Some(existing) if existing.as_slice() == value => Ok(()),
            Some(_) => Err(StoreError::Conflict(hex::encode(key))),
            None => {
                t.insert(key.to_vec(), value.to_vec());
                Ok(())
            }
        })?
    }

    fn put(&self, tree: Tree, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_tree(tree, |t| {
            t.insert(key.to_vec(), value.to_vec());
        })
    }

    fn get(&self, tree: Tree, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_tree(tree, |t| t.get(key).cloned())
    }

    fn remove(&self, tree: Tree, key: &[u8]) -> Result<()> {
        self.with_tree(tree, |t| {
            t.remove(key);
        })
    }

    fn scan_prefix(&self, tree: Tree, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.with_tree(tree, |t| {
            t.range(prefix.to_vec()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    fn remove_prefix(&self, tree: Tree, prefix: &[u8]) -> Result<()> {
        self.with_tree(tree, |t| t.retain(|k, _| !k.starts_with(prefix)))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
