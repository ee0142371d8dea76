//! Existence and absence proofs for a single key.
use super::{
    invalid, proof_path, read_bytes, read_maybe_bytes, read_nodes, verify_path_digests,
    verify_path_structure, write_bytes, write_maybe_bytes, write_nodes,
};
use crate::cancel::CancelToken;
use crate::error::MerkleError;
use crate::node::Node;
use crate::path::Path;
use crate::traits::ReadOnlyTrie;
use crate::types::TrieHash;
use serde::{Deserialize, Serialize};

/// Proof that `key` holds `value` (or holds nothing) under some root.
///
/// `path` is the ordered list of nodes from the root to either the key's node
/// or the deepest node before the trie diverges from the key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// The key the proof speaks about.
    pub key: Vec<u8>,
    /// The proven value; `None` proves absence.
    pub value: Option<Vec<u8>>,
    /// Nodes from the root toward the key.
    pub path: Vec<Node>,
}

impl Proof {
    /// Build a proof for `key` against the trie's current state.
    pub(crate) fn generate<T: ReadOnlyTrie + ?Sized>(
        trie: &T,
        key: &[u8],
        cancel: &CancelToken,
    ) -> Result<Self, MerkleError> {
        let key_path = Path::from_key(key);
        let path = proof_path(trie, &key_path, cancel)?;
        let value = path
            .last()
            .filter(|node| node.key() == &key_path)
            .and_then(|node| node.value().cloned());
        Ok(Self {
            key: key.to_vec(),
            value,
            path,
        })
    }

    /// Check the proof against `expected_root`.
    pub fn verify(&self, expected_root: TrieHash) -> Result<(), MerkleError> {
        let key_path = Path::from_key(&self.key);
        verify_path_structure(&self.path, &key_path)?;
        verify_path_digests(&self.path, expected_root)?;

        let last = self
            .path
            .last()
            .ok_or_else(|| invalid("empty proof path"))?;
        if last.key() == &key_path {
            if last.value() != self.value.as_ref() {
                return Err(invalid("claimed value disagrees with the key's node"));
            }
        } else {
            if self.value.is_some() {
                return Err(invalid("presence claimed but the key's node is missing"));
            }
            // Absence: the descent must genuinely stop here, not skip over an
            // existing child on the key's path.
            let nibble = key_path[last.key().len()];
            if let Some(child) = last.child(nibble) {
                let child_key = last.key().join(nibble, &child.suffix);
                if key_path.starts_with(&child_key) {
                    return Err(invalid("proof stops above an existing descent"));
                }
            }
        }
        Ok(())
    }

    /// Canonical wire encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_bytes(&mut out, &self.key);
        write_maybe_bytes(&mut out, self.value.as_deref());
        write_nodes(&mut out, &self.path);
        out
    }

    /// Inverse of [`Proof::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MerkleError> {
        let mut cursor = bytes;
        let key = read_bytes(&mut cursor)?;
        let value = read_maybe_bytes(&mut cursor)?;
        let path = read_nodes(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(invalid("trailing bytes after proof"));
        }
        Ok(Self { key, value, path })
    }
}
