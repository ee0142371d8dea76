//! Proof generation and verification.
//!
//! Three proof kinds share the same building blocks: an existence proof is a
//! root-to-key path of nodes; a range proof wraps boundary paths around the
//! key/value contents of a range; a change proof wraps boundary paths around
//! the diff between two retained roots. Every proof node is a full canonical
//! node record (children as digests, no subtrees), so a verifier can recompute
//! digests bottom-up and anchor them at a trusted root.
//!
//! The wire format is hand-rolled and canonical: a LEB128 varint count
//! followed by node records, with range and change payloads prepended as
//! length-delimited `Maybe<bytes>` fields.

mod change;
mod existence;
mod range;

pub use change::ChangeProof;
pub use existence::Proof;
pub use range::RangeProof;

use crate::cancel::CancelToken;
use crate::constant::EMPTY_ROOT_HASH;
use crate::error::MerkleError;
use crate::node::Node;
use crate::path::Path;
use crate::traits::ReadOnlyTrie;
use crate::types::TrieHash;

pub(crate) fn invalid(msg: impl Into<String>) -> MerkleError {
    MerkleError::InvalidProof(msg.into())
}

/// Collect the nodes from the root toward `key`: every node whose key is a
/// prefix of `key`, ending at the key's node or at the deepest node before
/// the path diverges.
pub(crate) fn proof_path<T: ReadOnlyTrie + ?Sized>(
    trie: &T,
    key: &Path,
    cancel: &CancelToken,
) -> Result<Vec<Node>, MerkleError> {
    let mut nodes = Vec::new();
    let mut current = trie
        .get_node(&Path::empty(), cancel)?
        .ok_or_else(|| MerkleError::Internal("trie has no root node".into()))?;
    loop {
        nodes.push(current.clone());
        if current.key() == key {
            break;
        }
        let nibble = key[current.key().len()];
        let Some(child) = current.child(nibble) else {
            break;
        };
        let child_key = current.key().join(nibble, &child.suffix);
        if !key.starts_with(&child_key) {
            break;
        }
        current = trie.get_node(&child_key, cancel)?.ok_or_else(|| {
            MerkleError::Internal(format!("missing trie node at {child_key:?}"))
        })?;
    }
    Ok(nodes)
}

/// In-order key/value pairs with keys in `[start, end]`, at most `limit` of
/// them. Subtrees that cannot intersect the range are pruned by comparing
/// child keys against the bounds.
pub(crate) fn collect_range<T: ReadOnlyTrie + ?Sized>(
    trie: &T,
    start: Option<&Path>,
    end: Option<&Path>,
    limit: usize,
    cancel: &CancelToken,
) -> Result<Vec<(Path, Vec<u8>)>, MerkleError> {
    let mut out = Vec::new();
    if limit == 0 {
        return Ok(out);
    }
    let root = trie
        .get_node(&Path::empty(), cancel)?
        .ok_or_else(|| MerkleError::Internal("trie has no root node".into()))?;
    collect_into(trie, &root, start, end, limit, cancel, &mut out)?;
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn collect_into<T: ReadOnlyTrie + ?Sized>(
    trie: &T,
    node: &Node,
    start: Option<&Path>,
    end: Option<&Path>,
    limit: usize,
    cancel: &CancelToken,
    out: &mut Vec<(Path, Vec<u8>)>,
) -> Result<(), MerkleError> {
    if out.len() >= limit {
        return Ok(());
    }
    cancel.check()?;
    let key = node.key();
    if let Some(value) = node.value() {
        let within = start.map_or(true, |s| key.as_slice() >= s.as_slice())
            && end.map_or(true, |e| key.as_slice() <= e.as_slice());
        if within && key.len() % 2 == 0 {
            out.push((key.clone(), value.clone()));
        }
    }
    for (nibble, child) in node.children() {
        if out.len() >= limit {
            break;
        }
        let child_key = key.join(nibble, &child.suffix);
        // Children iterate in ascending nibble order, so once one subtree
        // starts past the end bound the rest do too.
        if end.map_or(false, |e| child_key.as_slice() > e.as_slice()) {
            break;
        }
        // A subtree is entirely below the start bound unless its key is a
        // prefix of the bound.
        if start.map_or(false, |s| {
            child_key.as_slice() < s.as_slice() && !s.starts_with(child_key.as_slice())
        }) {
            continue;
        }
        let child_node = trie.get_node(&child_key, cancel)?.ok_or_else(|| {
            MerkleError::Internal(format!("missing trie node at {child_key:?}"))
        })?;
        collect_into(trie, &child_node, start, end, limit, cancel, out)?;
    }
    Ok(())
}

/// Structural checks on a proof path toward `target`: it must start at the
/// root, descend strictly, stay on `target`'s path, and keep parent/child
/// links consistent with the node keys.
pub(crate) fn verify_path_structure(
    nodes: &[Node],
    target: &Path,
) -> Result<(), MerkleError> {
    let Some(first) = nodes.first() else {
        return Err(invalid("empty proof path"));
    };
    if !first.key().is_empty() {
        return Err(invalid("proof path does not start at the root"));
    }
    for pair in nodes.windows(2) {
        let (parent, child) = (&pair[0], &pair[1]);
        if child.key().len() <= parent.key().len() || !child.key().starts_with(parent.key()) {
            return Err(invalid("proof path does not descend"));
        }
        let nibble = child.key()[parent.key().len()];
        let Some(link) = parent.child(nibble) else {
            return Err(invalid("proof path skips a missing child link"));
        };
        if link.suffix != child.key().skip(parent.key().len() + 1) {
            return Err(invalid("child link suffix disagrees with node key"));
        }
    }
    for node in nodes {
        if !target.starts_with(node.key()) && node.key() != target {
            return Err(invalid("proof node lies off the target path"));
        }
    }
    Ok(())
}

/// Recompute digests along a proof path bottom-up and anchor the first node
/// at `expected_root`. A single empty node proves the empty trie.
pub(crate) fn verify_path_digests(
    nodes: &[Node],
    expected_root: TrieHash,
) -> Result<(), MerkleError> {
    let Some(first) = nodes.first() else {
        return Err(invalid("empty proof path"));
    };
    if first.is_empty() {
        if nodes.len() != 1 || expected_root != EMPTY_ROOT_HASH {
            return Err(invalid("empty root node under a non-empty root digest"));
        }
        return Ok(());
    }
    for pair in nodes.windows(2) {
        let (parent, child) = (&pair[0], &pair[1]);
        let nibble = child.key()[parent.key().len()];
        let link = parent
            .child(nibble)
            .ok_or_else(|| invalid("proof path skips a missing child link"))?;
        if link.id != child.digest() {
            return Err(invalid("child digest does not match parent link"));
        }
    }
    if first.digest() != expected_root {
        return Err(invalid("proof path does not anchor at the expected root"));
    }
    Ok(())
}

// --- wire primitives -------------------------------------------------------

pub(crate) fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn read_varint(buf: &mut &[u8]) -> Result<u64, MerkleError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = buf
            .split_first()
            .ok_or_else(|| invalid("truncated varint"))?;
        *buf = rest;
        if shift >= 64 {
            return Err(invalid("oversized varint"));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub(crate) fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

pub(crate) fn read_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, MerkleError> {
    if buf.len() < 4 {
        return Err(invalid("truncated length prefix"));
    }
    let (len_bytes, rest) = buf.split_at(4);
    let len = u32::from_be_bytes(len_bytes.try_into().expect("length checked")) as usize;
    if rest.len() < len {
        return Err(invalid("truncated byte field"));
    }
    let (bytes, rest) = rest.split_at(len);
    *buf = rest;
    Ok(bytes.to_vec())
}

pub(crate) fn write_maybe_bytes(out: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            out.push(1);
            write_bytes(out, bytes);
        }
        None => out.push(0),
    }
}

pub(crate) fn read_maybe_bytes(buf: &mut &[u8]) -> Result<Option<Vec<u8>>, MerkleError> {
    let (&flag, rest) = buf
        .split_first()
        .ok_or_else(|| invalid("truncated presence byte"))?;
    *buf = rest;
    match flag {
        0 => Ok(None),
        1 => Ok(Some(read_bytes(buf)?)),
        _ => Err(invalid("bad presence byte")),
    }
}

pub(crate) fn write_nodes(out: &mut Vec<u8>, nodes: &[Node]) {
    write_varint(out, nodes.len() as u64);
    for node in nodes {
        out.extend_from_slice(&node.encode());
    }
}

pub(crate) fn read_nodes(buf: &mut &[u8]) -> Result<Vec<Node>, MerkleError> {
    let count = read_varint(buf)?;
    if count > 1 << 20 {
        return Err(invalid("implausible proof node count"));
    }
    let mut nodes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (node, consumed) =
            Node::decode_prefix(buf).map_err(|err| invalid(format!("bad node record: {err}")))?;
        *buf = &buf[consumed..];
        nodes.push(node);
    }
    Ok(nodes)
}
