//! Trie nodes, their canonical encoding, and digest computation.
//!
//! A node stores its absolute key, an optional value, and up to sixteen child
//! links. Each link carries the child's compressed path suffix together with
//! the child's digest, so a node's encoding commits to its entire subtree.
//!
//! The canonical encoding is deterministic and round-trips exactly; the
//! node's id is the SHA-256 digest of that encoding. The same bytes are used
//! for persistence and for proof records on the wire.

use crate::constant::BRANCH_FACTOR;
use crate::error::MerkleError;
use crate::path::Path;
use crate::types::TrieHash;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// A link from a node to one of its children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Child {
    /// The child's path below the parent, excluding the branching nibble.
    pub suffix: Path,
    /// Digest of the referenced subtree.
    pub id: TrieHash,
}

/// A single trie node.
#[derive(Clone, Debug)]
pub struct Node {
    key: Path,
    value: Option<Vec<u8>>,
    children: [Option<Child>; BRANCH_FACTOR],
    /// Memoized digest; cleared by every mutation.
    cached_id: Option<TrieHash>,
}

const NO_CHILD: Option<Child> = None;

impl Node {
    /// Create a node with no value and no children at `key`.
    pub fn new(key: Path) -> Self {
        Self {
            key,
            value: None,
            children: [NO_CHILD; BRANCH_FACTOR],
            cached_id: None,
        }
    }

    /// Create a leaf node holding `value` at `key`.
    pub fn new_leaf(key: Path, value: Vec<u8>) -> Self {
        Self {
            key,
            value: Some(value),
            children: [NO_CHILD; BRANCH_FACTOR],
            cached_id: None,
        }
    }

    /// The node's absolute key.
    pub fn key(&self) -> &Path {
        &self.key
    }

    /// The value stored at this node, if any.
    pub fn value(&self) -> Option<&Vec<u8>> {
        self.value.as_ref()
    }

    /// Replace the node's value.
    pub fn set_value(&mut self, value: Option<Vec<u8>>) {
        self.value = value;
        self.cached_id = None;
    }

    /// The child link at `nibble`, if present.
    pub fn child(&self, nibble: u8) -> Option<&Child> {
        self.children[nibble as usize].as_ref()
    }

    /// Install or replace the child link at `nibble`.
    pub fn set_child(&mut self, nibble: u8, child: Child) {
        self.children[nibble as usize] = Some(child);
        self.cached_id = None;
    }

    /// Remove the child link at `nibble`.
    pub fn remove_child(&mut self, nibble: u8) {
        self.children[nibble as usize] = None;
        self.cached_id = None;
    }

    /// Update only the digest of the child link at `nibble`.
    ///
    /// The link must exist; digests are refreshed bottom-up after structural
    /// edits have already installed the link.
    pub fn set_child_id(&mut self, nibble: u8, id: TrieHash) {
        if let Some(child) = self.children[nibble as usize].as_mut() {
            child.id = id;
            self.cached_id = None;
        }
    }

    /// Present children in ascending nibble order.
    pub fn children(&self) -> impl Iterator<Item = (u8, &Child)> {
        self.children
            .iter()
            .enumerate()
            .filter_map(|(nibble, child)| child.as_ref().map(|c| (nibble as u8, c)))
    }

    /// Number of present children.
    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| c.is_some()).count()
    }

    /// The sole child, when exactly one is present.
    pub fn single_child(&self) -> Option<(u8, &Child)> {
        let mut found = None;
        for (nibble, child) in self.children() {
            if found.is_some() {
                return None;
            }
            found = Some((nibble, child));
        }
        found
    }

    /// Whether the node carries neither a value nor any child. Legal only for
    /// the root of an empty trie.
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.iter().all(|c| c.is_none())
    }

    /// Canonical encoding of the node; see the module docs for the layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.key.serialize());
        match &self.value {
            Some(value) => {
                out.push(1);
                out.extend_from_slice(&(value.len() as u32).to_be_bytes());
                out.extend_from_slice(value);
            }
            None => out.push(0),
        }
        out.push(self.child_count() as u8);
        for (nibble, child) in self.children() {
            out.push(nibble);
            out.extend_from_slice(&(child.suffix.len() as u16).to_be_bytes());
            out.extend_from_slice(&child.suffix.serialize());
            out.extend_from_slice(&child.id.0);
        }
        out
    }

    /// Decode a node from the front of `buf`, returning it together with the
    /// number of bytes consumed.
    pub fn decode_prefix(buf: &[u8]) -> Result<(Self, usize), MerkleError> {
        let mut reader = Reader::new(buf);
        let key_len = reader.read_u16()? as usize;
        let key = reader.read_path(key_len)?;
        let value = match reader.read_u8()? {
            0 => None,
            1 => {
                let len = reader.read_u32()? as usize;
                Some(reader.read_bytes(len)?.to_vec())
            }
            other => {
                return Err(MerkleError::Internal(format!(
                    "bad value-present byte: {other:#04x}"
                )))
            }
        };
        let child_count = reader.read_u8()? as usize;
        if child_count > BRANCH_FACTOR {
            return Err(MerkleError::Internal(format!(
                "node claims {child_count} children"
            )));
        }
        let mut children = [NO_CHILD; BRANCH_FACTOR];
        let mut prev_nibble = None;
        for _ in 0..child_count {
            let nibble = reader.read_u8()?;
            if nibble as usize >= BRANCH_FACTOR {
                return Err(MerkleError::Internal(format!("bad child nibble {nibble}")));
            }
            if prev_nibble.is_some_and(|prev| nibble <= prev) {
                return Err(MerkleError::Internal(
                    "children out of order in node encoding".into(),
                ));
            }
            prev_nibble = Some(nibble);
            let suffix_len = reader.read_u16()? as usize;
            let suffix = reader.read_path(suffix_len)?;
            let id = TrieHash(
                reader
                    .read_bytes(32)?
                    .try_into()
                    .expect("slice length checked"),
            );
            children[nibble as usize] = Some(Child { suffix, id });
        }
        let node = Self {
            key,
            value,
            children,
            cached_id: None,
        };
        Ok((node, reader.consumed()))
    }

    /// Decode a node from exactly `buf`; trailing bytes are rejected.
    pub fn decode(buf: &[u8]) -> Result<Self, MerkleError> {
        let (node, consumed) = Self::decode_prefix(buf)?;
        if consumed != buf.len() {
            return Err(MerkleError::Internal(
                "trailing bytes after node encoding".into(),
            ));
        }
        Ok(node)
    }

    /// SHA-256 digest of the canonical encoding, computed fresh.
    pub fn digest(&self) -> TrieHash {
        let mut hasher = Sha256::new();
        hasher.update(self.encode());
        TrieHash(hasher.finalize().into())
    }

    /// The node's id, memoized across calls until the node is mutated.
    pub fn calculate_id(&mut self) -> TrieHash {
        if let Some(id) = self.cached_id {
            return id;
        }
        let id = self.digest();
        self.cached_id = Some(id);
        id
    }

    /// Record an externally computed digest as the memoized id.
    pub(crate) fn set_cached_id(&mut self, id: TrieHash) {
        self.cached_id = Some(id);
    }
}

// Node equality ignores the digest memo so that decoded nodes compare equal
// to the nodes they were encoded from.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value && self.children == other.children
    }
}

impl Eq for Node {}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Node::decode(&bytes).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

/// Cursor over an encoded node, tracking how many bytes were consumed.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn consumed(&self) -> usize {
        self.pos
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], MerkleError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| MerkleError::Internal("truncated node encoding".into()))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, MerkleError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, MerkleError> {
        Ok(u16::from_be_bytes(
            self.read_bytes(2)?.try_into().expect("length checked"),
        ))
    }

    fn read_u32(&mut self) -> Result<u32, MerkleError> {
        Ok(u32::from_be_bytes(
            self.read_bytes(4)?.try_into().expect("length checked"),
        ))
    }

    /// Read a serialized path of the given nibble length, validating that the
    /// embedded odd-length flag agrees.
    fn read_path(&mut self, nibble_len: usize) -> Result<Path, MerkleError> {
        let byte_len = 1 + nibble_len.div_ceil(2);
        let path = Path::deserialize(self.read_bytes(byte_len)?)?;
        if path.len() != nibble_len {
            return Err(MerkleError::Internal(format!(
                "path length mismatch: declared {nibble_len}, decoded {}",
                path.len()
            )));
        }
        Ok(path)
    }
}
