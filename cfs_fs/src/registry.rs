//! Explicit registry of open filesystems.
//!
//! The protocol server looks connections up here by key path; nothing
//! is registered implicitly, so a filesystem is only reachable over the
//! wire after its owner opts in.

use std::sync::Arc;

use cfs_core::{Hash, KEY_SIZE};
use dashmap::DashMap;

use crate::cfs::Cfs;

/// Registry key of a filesystem: hex of `hash(id ++ root_public_key)`.
pub fn key_path(id: &[u8], key: &[u8; KEY_SIZE]) -> String {
    let mut buf = Vec::with_capacity(id.len() + KEY_SIZE);
    buf.extend_from_slice(id);
    buf.extend_from_slice(key);
    Hash::new(&buf).to_hex()
}

/// Concurrent map from key path to open filesystem.
#[derive(Debug, Default)]
pub struct CfsRegistry {
    entries: DashMap<String, Arc<Cfs>>,
}

impl CfsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filesystem under its key path and returns that path.
    pub fn insert(&self, cfs: Arc<Cfs>) -> String {
        let path = cfs.key_path().to_string();
        self.entries.insert(path.clone(), cfs);
        path
    }

    /// Looks up a filesystem by owner id and root public key.
    pub fn lookup(&self, id: &[u8], key: &[u8; KEY_SIZE]) -> Option<Arc<Cfs>> {
        self.lookup_path(&key_path(id, key))
    }

    pub fn lookup_path(&self, path: &str) -> Option<Arc<Cfs>> {
        self.entries.get(path).map(|e| e.clone())
    }

    pub fn remove(&self, path: &str) -> Option<Arc<Cfs>> {
        self.entries.remove(path).map(|(_, cfs)| cfs)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
