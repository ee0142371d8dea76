//! In-memory byte store backend.
//!
//! This module provides [`MemStore`], a simple in-memory implementation of the
//! [`ByteStore`] trait backed by a [`BTreeMap`]. It is **not** part of the
//! trie itself; it merely supplies the ordered key/value storage the database
//! persists into.
//!
//! `MemStore` is primarily intended for:
//! - Unit testing and integration testing
//! - Development and debugging
//! - Serving as a reference implementation of the storage contract
//!
//! For production use cases requiring durability, back the database with a
//! disk-based [`ByteStore`] implementation instead.
//!
//! All operations are thread-safe through a [`RwLock`]; a closed store keeps
//! its data (so reopening a database over it sees the persisted state) but
//! rejects every operation with [`StoreError::Closed`].

use crate::error::StoreError;
use crate::traits::{ByteStore, WriteBatch};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// In-memory [`ByteStore`] implementation.
#[derive(Debug, Default)]
pub struct MemStore {
    kvs: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemStore {
    /// Creates a new empty `MemStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reopen a closed store, keeping its contents. Test-oriented: stands in
    /// for handing the same on-disk directory to a fresh process.
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.kvs.read().expect("store lock poisoned").len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl ByteStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.ensure_open()?;
        self.kvs
            .read()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.kvs
            .write()
            .expect("store lock poisoned")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.kvs.write().expect("store lock poisoned").remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut kvs = self.kvs.write().expect("store lock poisoned");
        for (key, value) in batch.into_ops() {
            match value {
                Some(value) => kvs.insert(key, value),
                None => kvs.remove(&key),
            };
        }
        Ok(())
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .kvs
            .read()
            .expect("store lock poisoned")
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
