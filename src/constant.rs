//! This module defines constants that determine the shape of the Merkle trie
//! and the layout of its persisted state.

use crate::path::Path;
use crate::types::TrieHash;

/// Number of bits in a trie branching step (one nibble).
pub const NIBBLE_BITS: usize = 4;
/// Branch factor of trie nodes. Always a power of two.
pub const BRANCH_FACTOR: usize = 1 << NIBBLE_BITS;

/// Root digest of an empty trie. A fixed sentinel rather than the hash of any
/// node encoding, so an empty store is recognizable without decoding anything.
pub const EMPTY_ROOT_HASH: TrieHash = TrieHash([0u8; 32]);

/// Byte-store key prefix under which encoded trie nodes are persisted, keyed
/// by their serialized path.
pub const NODE_PREFIX: u8 = 0x00;
/// Byte-store key holding the current root digest.
pub const ROOT_HASH_KEY: [u8; 1] = [0x01];
/// Reserved byte-store key prefix for a persisted history journal. The ring is
/// rebuilt empty on restart, so nothing is written under this prefix today.
pub const HISTORY_PREFIX: u8 = 0x02;

/// Default number of node-cache entries evicted per eviction pass.
pub const DEFAULT_EVICTION_BATCH_SIZE: usize = 100;
/// Default number of retained root transitions.
pub const DEFAULT_HISTORY_LENGTH: usize = 300;
/// Default hard cap on cached nodes.
pub const DEFAULT_NODE_CACHE_SIZE: usize = 1024;

/// Compute the byte-store key under which the node at `path` is persisted.
pub fn node_store_key(path: &Path) -> Vec<u8> {
    let serialized = path.serialize();
    let mut key = Vec::with_capacity(1 + serialized.len());
    key.push(NODE_PREFIX);
    key.extend_from_slice(&serialized);
    key
}
