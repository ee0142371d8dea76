//! Traits at the database's seams: the byte store it persists into and the
//! read-only trie interface shared by the database and its views.
use crate::cancel::CancelToken;
use crate::error::{MerkleError, StoreError};
use crate::node::Node;
use crate::path::Path;
use crate::types::TrieHash;
use std::fmt::Debug;

/// A batch of byte-store writes applied atomically.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteBatch {
    /// An empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an insert or overwrite.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((key, Some(value)));
    }

    /// Queue a deletion. Deleting an absent key is a no-op.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push((key, None));
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume the batch, yielding its operations in insertion order.
    pub fn into_ops(self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.ops
    }
}

/// The persistent byte store the database is layered on.
///
/// Implementations must apply [`WriteBatch`]es atomically and must keep
/// serving reads concurrently with writes. Once [`ByteStore::close`] has been
/// called every operation fails with [`StoreError::Closed`].
pub trait ByteStore: Debug + Send + Sync {
    /// Fetch the value stored at `key`, failing with [`StoreError::NotFound`]
    /// when absent.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError>;

    /// Insert or overwrite a single key.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Delete a single key. Absent keys are ignored.
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Apply a batch of writes atomically.
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// All key/value pairs whose key starts with `prefix`, in key order.
    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Release the store. Further operations fail with [`StoreError::Closed`].
    fn close(&self) -> Result<(), StoreError>;
}

/// Read-only access to a trie state: the database itself or any view over it.
///
/// Proof generation is written against this trait so the same code serves the
/// live root, uncommitted views, and historical roots reconstructed from the
/// history ring.
pub trait ReadOnlyTrie: Send + Sync {
    /// Fetch a copy of the value stored at `key`, failing with
    /// [`MerkleError::NotFound`] when absent.
    fn get_value(&self, key: &[u8], cancel: &CancelToken) -> Result<Vec<u8>, MerkleError>;

    /// Fetch a copy of the node whose absolute key is `path`, or `None` when
    /// no node lives there.
    fn get_node(&self, path: &Path, cancel: &CancelToken) -> Result<Option<Node>, MerkleError>;

    /// The Merkle root of this trie state.
    fn get_merkle_root(&self, cancel: &CancelToken) -> Result<TrieHash, MerkleError>;
}
