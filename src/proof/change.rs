//! Change proofs: the exact diff between two retained roots over a key range.
use super::{
    invalid, read_bytes, read_maybe_bytes, read_nodes, read_varint, write_bytes,
    write_maybe_bytes, write_nodes, write_varint,
};
use crate::error::MerkleError;
use crate::node::Node;
use serde::{Deserialize, Serialize};

/// Proof of the value changes between a start root and an end root,
/// restricted to a key range and clipped to a generation limit.
///
/// `key_changes` composes every commit between the two roots with
/// last-writer-wins semantics; `None` values are deletions. The boundary
/// proofs are existence (or absence) proofs generated at the end root: one
/// for the range start and one for the largest included key. Verification is
/// anchored at the database holding the start state — see
/// `MerkleDb::verify_change_proof`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeProof {
    /// Proof for the range's lower bound at the end root.
    pub start_proof: Vec<Node>,
    /// Proof for the largest included key (or the range's upper bound) at
    /// the end root.
    pub end_proof: Vec<Node>,
    /// Sorted `(key, new value)` changes; `None` deletes the key.
    pub key_changes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl ChangeProof {
    /// Checks independent of any root: sortedness and range membership.
    pub(crate) fn verify_structure(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<(), MerkleError> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(invalid("range start is after its end"));
            }
        }
        for pair in self.key_changes.windows(2) {
            if pair[0].0 >= pair[1].0 {
                return Err(invalid("key changes are not strictly sorted"));
            }
        }
        for (key, _) in &self.key_changes {
            if start.map_or(false, |s| key.as_slice() < s)
                || end.map_or(false, |e| key.as_slice() > e)
            {
                return Err(invalid("key change outside the requested range"));
            }
        }
        Ok(())
    }

    /// Canonical wire encoding: the sorted changes, then the side proofs.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, self.key_changes.len() as u64);
        for (key, value) in &self.key_changes {
            write_bytes(&mut out, key);
            write_maybe_bytes(&mut out, value.as_deref());
        }
        write_nodes(&mut out, &self.start_proof);
        write_nodes(&mut out, &self.end_proof);
        out
    }

    /// Inverse of [`ChangeProof::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MerkleError> {
        let mut cursor = bytes;
        let count = read_varint(&mut cursor)?;
        if count > 1 << 24 {
            return Err(invalid("implausible key change count"));
        }
        let mut key_changes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = read_bytes(&mut cursor)?;
            let value = read_maybe_bytes(&mut cursor)?;
            key_changes.push((key, value));
        }
        let start_proof = read_nodes(&mut cursor)?;
        let end_proof = read_nodes(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(invalid("trailing bytes after proof"));
        }
        Ok(Self {
            start_proof,
            end_proof,
            key_changes,
        })
    }
}
