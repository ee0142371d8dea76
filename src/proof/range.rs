//! Range proofs: the exact key/value contents of a key range under a root.
use super::{
    collect_range, invalid, proof_path, read_bytes, read_maybe_bytes, read_nodes, read_varint,
    verify_path_digests, verify_path_structure, write_bytes, write_maybe_bytes, write_nodes,
    write_varint,
};
use crate::cancel::CancelToken;
use crate::error::MerkleError;
use crate::node::Node;
use crate::overlay::NodeOverlay;
use crate::path::Path;
use crate::traits::ReadOnlyTrie;
use crate::types::TrieHash;
use serde::{Deserialize, Serialize};

/// Proof that `key_values` is exactly the content of `[start, end]` under
/// some root, up to the generation limit.
///
/// When the limit clipped the result, the attested range shrinks to
/// `[start, largest returned key]` and `end_proof` covers that largest key
/// instead of `end`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeProof {
    /// Inclusive lower bound the proof was generated for; `None` is
    /// unbounded.
    pub start: Option<Vec<u8>>,
    /// Inclusive upper bound the proof was generated for; `None` is
    /// unbounded.
    pub end: Option<Vec<u8>>,
    /// Existence (or absence) proof for `start`.
    pub start_proof: Vec<Node>,
    /// Existence (or absence) proof for the largest returned key, or for
    /// `end` when nothing was returned.
    pub end_proof: Vec<Node>,
    /// The range contents, sorted by key.
    pub key_values: Vec<(Vec<u8>, Vec<u8>)>,
}

impl RangeProof {
    /// Build a range proof against the trie's current state.
    pub(crate) fn generate<T: ReadOnlyTrie + ?Sized>(
        trie: &T,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_items: usize,
        cancel: &CancelToken,
    ) -> Result<Self, MerkleError> {
        if max_items == 0 {
            return Err(MerkleError::Internal("max_items must be positive".into()));
        }
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(MerkleError::Internal("range start is after its end".into()));
            }
        }
        let start_path = start.map(Path::from_key);
        let end_path = end.map(Path::from_key);
        let key_values =
            collect_range(trie, start_path.as_ref(), end_path.as_ref(), max_items, cancel)?;

        let start_proof = match &start_path {
            Some(path) => proof_path(trie, path, cancel)?,
            None => Vec::new(),
        };
        let end_target = key_values.last().map(|(path, _)| path.clone()).or(end_path);
        let end_proof = match &end_target {
            Some(path) => proof_path(trie, path, cancel)?,
            None => Vec::new(),
        };

        Ok(Self {
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            start_proof,
            end_proof,
            key_values: key_values
                .into_iter()
                .map(|(path, value)| (path.to_key(), value))
                .collect(),
        })
    }

    /// Verify the proof against `expected_root` for the requested range.
    ///
    /// Rebuilds a sparse trie from the key/value pairs plus the boundary
    /// nodes' out-of-range child digests; its recomputed root must equal
    /// `expected_root`.
    pub fn verify(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        expected_root: TrieHash,
    ) -> Result<(), MerkleError> {
        if self.start.as_deref() != start || self.end.as_deref() != end {
            return Err(invalid("proof bounds do not match the requested range"));
        }
        self.verify_structure()?;

        let start_path = start.map(Path::from_key);
        let largest_path = self
            .key_values
            .last()
            .map(|(key, _)| Path::from_key(key))
            .or_else(|| end.map(Path::from_key));

        match &start_path {
            Some(path) => {
                verify_path_structure(&self.start_proof, path)?;
                verify_path_digests(&self.start_proof, expected_root)?;
            }
            None => {
                if !self.start_proof.is_empty() {
                    return Err(invalid("unexpected start proof for an unbounded range"));
                }
            }
        }
        match &largest_path {
            Some(path) => {
                verify_path_structure(&self.end_proof, path)?;
                verify_path_digests(&self.end_proof, expected_root)?;
            }
            None => {
                if !self.end_proof.is_empty() {
                    return Err(invalid("unexpected end proof for an empty unbounded range"));
                }
            }
        }

        // Rebuild the attested range as a sparse trie and graft the boundary
        // digests lying outside it.
        let mut resolver = no_base_nodes;
        let mut overlay = NodeOverlay::new(Node::new(Path::empty()));
        for (key, value) in &self.key_values {
            overlay
                .insert(&Path::from_key(key), value.clone(), &mut resolver)
                .map_err(|_| invalid("malformed key/value set"))?;
        }
        add_path_info(
            &mut overlay,
            &self.end_proof,
            start_path.as_ref(),
            largest_path.as_ref(),
        )?;
        add_path_info(
            &mut overlay,
            &self.start_proof,
            start_path.as_ref(),
            largest_path.as_ref(),
        )?;

        let rebuilt = overlay.compute_root_hash();
        if rebuilt != expected_root {
            return Err(invalid(format!(
                "rebuilt range hashes to {rebuilt}, expected {expected_root}"
            )));
        }
        Ok(())
    }

    /// Checks independent of any root: sortedness and range membership.
    pub(crate) fn verify_structure(&self) -> Result<(), MerkleError> {
        if let (Some(start), Some(end)) = (&self.start, &self.end) {
            if start > end {
                return Err(invalid("range start is after its end"));
            }
        }
        for pair in self.key_values.windows(2) {
            if pair[0].0 >= pair[1].0 {
                return Err(invalid("key/value pairs are not strictly sorted"));
            }
        }
        for (key, _) in &self.key_values {
            if self.start.as_ref().map_or(false, |s| key < s)
                || self.end.as_ref().map_or(false, |e| key > e)
            {
                return Err(invalid("key/value pair outside the proven range"));
            }
        }
        Ok(())
    }

    /// Canonical wire encoding: the bounds as `Maybe<bytes>`, the key/value
    /// pairs, then the two boundary proofs.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_maybe_bytes(&mut out, self.start.as_deref());
        write_maybe_bytes(&mut out, self.end.as_deref());
        write_varint(&mut out, self.key_values.len() as u64);
        for (key, value) in &self.key_values {
            write_bytes(&mut out, key);
            write_bytes(&mut out, value);
        }
        write_nodes(&mut out, &self.start_proof);
        write_nodes(&mut out, &self.end_proof);
        out
    }

    /// Inverse of [`RangeProof::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MerkleError> {
        let mut cursor = bytes;
        let start = read_maybe_bytes(&mut cursor)?;
        let end = read_maybe_bytes(&mut cursor)?;
        let count = read_varint(&mut cursor)?;
        if count > 1 << 24 {
            return Err(invalid("implausible key/value count"));
        }
        let mut key_values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = read_bytes(&mut cursor)?;
            let value = read_bytes(&mut cursor)?;
            key_values.push((key, value));
        }
        let start_proof = read_nodes(&mut cursor)?;
        let end_proof = read_nodes(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(invalid("trailing bytes after proof"));
        }
        Ok(Self {
            start,
            end,
            start_proof,
            end_proof,
            key_values,
        })
    }
}

/// Fold a boundary proof into the rebuilt sparse trie: attach the digests of
/// children whose subtrees lie entirely outside `[low, high]`, and re-insert
/// values carried by proof nodes outside that range.
/// Resolver for the free-standing sparse trie: there is no base layer.
fn no_base_nodes(_: &Path) -> Result<Option<Node>, MerkleError> {
    Ok(None)
}

fn add_path_info(
    overlay: &mut NodeOverlay,
    proof: &[Node],
    low: Option<&Path>,
    high: Option<&Path>,
) -> Result<(), MerkleError> {
    let mut resolver = no_base_nodes;
    for node in proof.iter().rev() {
        let key = node.key();

        let value_outside = node.value().is_some()
            && (low.is_some_and(|l| key.as_slice() < l.as_slice())
                || high.is_some_and(|h| key.as_slice() > h.as_slice()));
        let mut digest_children = Vec::new();
        for (nibble, child) in node.children() {
            let child_key = key.join(nibble, &child.suffix);
            let below = low.is_some_and(|l| {
                child_key.as_slice() < l.as_slice() && !l.starts_with(child_key.as_slice())
            });
            let above = high.is_some_and(|h| child_key.as_slice() > h.as_slice());
            if below || above {
                digest_children.push((nibble, child.clone()));
            }
        }
        if !value_outside && digest_children.is_empty() {
            continue;
        }

        overlay
            .ensure_node(key, &mut resolver)
            .map_err(|_| invalid("inconsistent boundary proof path"))?;
        if value_outside {
            if let Some(value) = node.value() {
                overlay
                    .insert(key, value.clone(), &mut resolver)
                    .map_err(|_| invalid("inconsistent boundary proof path"))?;
            }
        }
        for (nibble, child) in digest_children {
            match overlay.node(key).and_then(|n| n.child(nibble)) {
                None => overlay
                    .set_child(key, nibble, child)
                    .map_err(|_| invalid("inconsistent boundary proof path"))?,
                Some(existing) if *existing == child => {}
                Some(_) => {
                    return Err(invalid("boundary child conflicts with proven entries"))
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Config, MerkleDb};
    use crate::mem_store::MemStore;

    fn db_with(pairs: &[(&[u8], &[u8])]) -> MerkleDb<MemStore> {
        let db = MerkleDb::new(MemStore::new(), Config::default()).unwrap();
        let mut batch = db.new_batch();
        for (key, value) in pairs {
            batch.put(key, value);
        }
        batch.write().unwrap();
        db
    }

    #[test]
    fn test_range_proof_round_trip_and_verify() {
        let cancel = CancelToken::new();
        let db = db_with(&[
            (b"key1", b"1"),
            (b"key2", b"2"),
            (b"key3", b"3"),
            (b"other", b"4"),
        ]);
        let root = db.get_merkle_root(&cancel).unwrap();

        let proof = db
            .get_range_proof(Some(b"key1"), Some(b"key3"), 10, &cancel)
            .unwrap();
        assert_eq!(proof.key_values.len(), 3);
        proof.verify(Some(b"key1"), Some(b"key3"), root).unwrap();

        let decoded = RangeProof::from_bytes(&proof.to_bytes()).unwrap();
        assert_eq!(proof, decoded);
        decoded.verify(Some(b"key1"), Some(b"key3"), root).unwrap();
    }

    #[test]
    fn test_unbounded_range_proof() {
        let cancel = CancelToken::new();
        let db = db_with(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        let root = db.get_merkle_root(&cancel).unwrap();

        let proof = db.get_range_proof(None, None, 10, &cancel).unwrap();
        assert_eq!(proof.key_values.len(), 3);
        proof.verify(None, None, root).unwrap();
    }

    #[test]
    fn test_clipped_range_proof_verifies() {
        let cancel = CancelToken::new();
        let db = db_with(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4")]);
        let root = db.get_merkle_root(&cancel).unwrap();

        let proof = db
            .get_range_proof(Some(b"a"), Some(b"d"), 2, &cancel)
            .unwrap();
        assert_eq!(proof.key_values.len(), 2);
        // The end proof covers the largest returned key, not the range end.
        assert_eq!(proof.key_values.last().unwrap().0, b"b".to_vec());
        proof.verify(Some(b"a"), Some(b"d"), root).unwrap();
    }

    #[test]
    fn test_empty_range_proof() {
        let cancel = CancelToken::new();
        let db = db_with(&[(b"key", b"1")]);
        let root = db.get_merkle_root(&cancel).unwrap();

        let proof = db
            .get_range_proof(Some(b"x"), Some(b"z"), 10, &cancel)
            .unwrap();
        assert!(proof.key_values.is_empty());
        proof.verify(Some(b"x"), Some(b"z"), root).unwrap();
    }

    #[test]
    fn test_empty_trie_range_proof() {
        let cancel = CancelToken::new();
        let db = MerkleDb::new(MemStore::new(), Config::default()).unwrap();
        let root = db.get_merkle_root(&cancel).unwrap();

        let proof = db
            .get_range_proof(Some(b"a"), Some(b"z"), 10, &cancel)
            .unwrap();
        assert!(proof.key_values.is_empty());
        proof.verify(Some(b"a"), Some(b"z"), root).unwrap();
    }

    #[test]
    fn test_tampered_range_proof_fails() {
        let cancel = CancelToken::new();
        let db = db_with(&[(b"key1", b"1"), (b"key2", b"2"), (b"key3", b"3")]);
        let root = db.get_merkle_root(&cancel).unwrap();
        let proof = db
            .get_range_proof(Some(b"key1"), Some(b"key3"), 10, &cancel)
            .unwrap();

        // Altered value.
        let mut tampered = proof.clone();
        tampered.key_values[1].1 = b"999".to_vec();
        assert!(tampered.verify(Some(b"key1"), Some(b"key3"), root).is_err());

        // Dropped entry.
        let mut tampered = proof.clone();
        tampered.key_values.remove(1);
        assert!(tampered.verify(Some(b"key1"), Some(b"key3"), root).is_err());

        // Smuggled-in entry.
        let mut tampered = proof.clone();
        tampered
            .key_values
            .insert(2, (b"key25".to_vec(), b"5".to_vec()));
        assert!(tampered.verify(Some(b"key1"), Some(b"key3"), root).is_err());

        // Range mismatch between caller and proof.
        assert!(proof.verify(Some(b"key1"), Some(b"key9"), root).is_err());

        // Wrong root.
        assert!(proof
            .verify(Some(b"key1"), Some(b"key3"), TrieHash([9; 32]))
            .is_err());
    }

    #[test]
    fn test_range_proof_max_items_bound() {
        let cancel = CancelToken::new();
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0u8..50)
            .map(|i| (vec![b'k', i], vec![i]))
            .collect();
        let db = MerkleDb::new(MemStore::new(), Config::default()).unwrap();
        let mut batch = db.new_batch();
        for (key, value) in &pairs {
            batch.put(key, value);
        }
        batch.write().unwrap();
        let root = db.get_merkle_root(&cancel).unwrap();

        for max_items in [1, 7, 50, 100] {
            let proof = db.get_range_proof(None, None, max_items, &cancel).unwrap();
            assert!(proof.key_values.len() <= max_items);
            proof.verify(None, None, root).unwrap();
        }
    }
}
