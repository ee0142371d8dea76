//! Core value types shared across the trie database.
use derive_more::{Deref, DerefMut};
use serde::{Deserialize, Serialize};

/// A 32-byte SHA-256 digest identifying a trie node or a whole trie state.
#[derive(
    Clone,
    Copy,
    Default,
    Deref,
    DerefMut,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct TrieHash(pub [u8; 32]);

impl TrieHash {
    /// Construct a digest from raw bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for TrieHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TrieHash({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for TrieHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for TrieHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// A single staged operation against the database: `value` of `None` requests
/// a deletion, anything else an insert or overwrite.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOp {
    /// The user key the operation applies to.
    pub key: Vec<u8>,
    /// The new value, or `None` to delete.
    pub value: Option<Vec<u8>>,
}

impl BatchOp {
    /// Convenience constructor for an insert/overwrite.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Convenience constructor for a deletion.
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}
