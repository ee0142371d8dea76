//! Nibble-addressed key paths.
//!
//! Every user key is expanded into a sequence of 4-bit nibbles before it
//! touches the trie, so nodes can branch with a fanout of sixteen. A [`Path`]
//! owns one nibble per byte for cheap indexing and prefix arithmetic; the
//! packed two-nibbles-per-byte form only appears in [`Path::serialize`].
//!
//! Paths are immutable: every editing operation returns a new path. Ordering
//! and equality are lexicographic on the nibble sequence, which for
//! even-length paths coincides with byte-wise ordering of the original keys.

use crate::error::MerkleError;
use derive_more::Deref;
use serde::{Deserialize, Serialize};

/// A trie path: a sequence of nibbles, each in `0..16`.
///
/// Odd-length paths arise only as internal node prefixes; user keys always
/// expand to an even number of nibbles.
#[derive(Clone, Default, Deref, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Path(Vec<u8>);

impl Path {
    /// The empty path (the root node's key).
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Expand a user key into its nibble path, two nibbles per byte.
    pub fn from_key(key: &[u8]) -> Self {
        let mut nibbles = Vec::with_capacity(key.len() * 2);
        for byte in key {
            nibbles.push(byte >> 4);
            nibbles.push(byte & 0x0f);
        }
        Self(nibbles)
    }

    /// Build a path directly from nibbles. Callers must pass values `< 16`.
    pub fn from_nibbles(nibbles: Vec<u8>) -> Self {
        debug_assert!(nibbles.iter().all(|n| *n < 16));
        Self(nibbles)
    }

    /// Pack an even-length path back into the user key it was expanded from.
    ///
    /// Only values stored at even-length paths are user-visible, so this is
    /// never called on odd-length internal prefixes.
    pub fn to_key(&self) -> Vec<u8> {
        debug_assert!(self.0.len() % 2 == 0, "odd-length path is not a user key");
        self.0
            .chunks_exact(2)
            .map(|pair| (pair[0] << 4) | pair[1])
            .collect()
    }

    /// A new path holding the first `n` nibbles of this one.
    pub fn take(&self, n: usize) -> Self {
        Self(self.0[..n.min(self.0.len())].to_vec())
    }

    /// A new path with the first `n` nibbles removed.
    pub fn skip(&self, n: usize) -> Self {
        Self(self.0[n.min(self.0.len())..].to_vec())
    }

    /// A new path with `nibble` appended.
    pub fn append(&self, nibble: u8) -> Self {
        debug_assert!(nibble < 16);
        let mut nibbles = Vec::with_capacity(self.0.len() + 1);
        nibbles.extend_from_slice(&self.0);
        nibbles.push(nibble);
        Self(nibbles)
    }

    /// A new path of `self || nibble || suffix`, the absolute key of a child
    /// reached through the child slot `nibble` with compressed path `suffix`.
    pub fn join(&self, nibble: u8, suffix: &Path) -> Self {
        debug_assert!(nibble < 16);
        let mut nibbles = Vec::with_capacity(self.0.len() + 1 + suffix.len());
        nibbles.extend_from_slice(&self.0);
        nibbles.push(nibble);
        nibbles.extend_from_slice(suffix);
        Self(nibbles)
    }

    /// Length of the longest common prefix of two paths, in nibbles.
    pub fn common_prefix_len(&self, other: &Path) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Pack the path for hashing and persistence.
    ///
    /// Layout: one flag byte carrying the odd-length bit, then two nibbles per
    /// byte, high nibble first, with an odd trailing nibble padded by zero.
    /// The flag byte makes `serialize`/`deserialize` round-trip exactly for
    /// odd-length internal prefixes.
    pub fn serialize(&self) -> Vec<u8> {
        let odd = (self.0.len() & 1) as u8;
        let mut out = Vec::with_capacity(1 + self.0.len().div_ceil(2));
        out.push(odd);
        for pair in self.0.chunks(2) {
            let hi = pair[0] << 4;
            let lo = if pair.len() == 2 { pair[1] } else { 0 };
            out.push(hi | lo);
        }
        out
    }

    /// Inverse of [`Path::serialize`].
    pub fn deserialize(bytes: &[u8]) -> Result<Self, MerkleError> {
        let (&flag, packed) = bytes
            .split_first()
            .ok_or_else(|| MerkleError::Internal("empty serialized path".into()))?;
        if flag > 1 {
            return Err(MerkleError::Internal(format!(
                "bad path flag byte: {flag:#04x}"
            )));
        }
        let mut nibbles = Vec::with_capacity(packed.len() * 2);
        for byte in packed {
            nibbles.push(byte >> 4);
            nibbles.push(byte & 0x0f);
        }
        if flag == 1 {
            match nibbles.pop() {
                Some(0) => {}
                _ => {
                    return Err(MerkleError::Internal(
                        "odd-length path with nonzero padding".into(),
                    ))
                }
            }
        }
        Ok(Self(nibbles))
    }
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Path(")?;
        for nibble in &self.0 {
            write!(f, "{nibble:x}")?;
        }
        write!(f, ")")
    }
}
