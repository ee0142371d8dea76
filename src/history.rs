//! Bounded ring of recent root transitions.
//!
//! Every committed change set is recorded together with the root it produced.
//! The ring serves two queries: the composed value changes between two
//! retained roots (for change proofs) and the composed inverse changes back
//! to a retained root (to reconstruct a read-only view of a past state for
//! range proofs at historical roots).
//!
//! The same root hash may be recorded more than once; an auxiliary index maps
//! each root to the set of positions holding it, and lookups resolve to the
//! earliest retained occurrence.

use crate::changes::{ChangeSet, MaybeValue};
use crate::error::MerkleError;
use crate::path::Path;
use crate::types::TrieHash;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// One recorded transition: the change set that produced `root`.
#[derive(Debug, Clone)]
struct HistoryEntry {
    root: TrieHash,
    sequence: u64,
    changes: ChangeSet,
}

/// FIFO ring of up to `max_entries` root transitions.
///
/// The newest entry always describes the current root, so the ring is seeded
/// with the opening root (and an empty change set) when the database starts.
/// A `max_entries` of zero disables history entirely.
#[derive(Debug)]
pub struct TrieHistory {
    entries: VecDeque<HistoryEntry>,
    by_root: HashMap<TrieHash, BTreeSet<u64>>,
    next_sequence: u64,
    max_entries: usize,
}

impl TrieHistory {
    /// Create an empty ring retaining up to `max_entries` transitions.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            by_root: HashMap::new(),
            next_sequence: 0,
            max_entries,
        }
    }

    /// Whether `root` is retained by the ring.
    pub fn has_root(&self, root: &TrieHash) -> bool {
        self.by_root.contains_key(root)
    }

    /// Record a transition to `root`. The oldest entry falls out once the
    /// ring is full.
    pub fn record(&mut self, root: TrieHash, changes: ChangeSet) {
        if self.max_entries == 0 {
            return;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push_back(HistoryEntry {
            root,
            sequence,
            changes,
        });
        self.by_root.entry(root).or_default().insert(sequence);
        tracing::trace!(root = %root, sequence, "recorded root transition");

        while self.entries.len() > self.max_entries {
            let evicted = self.entries.pop_front().expect("ring is non-empty");
            if let Some(positions) = self.by_root.get_mut(&evicted.root) {
                positions.remove(&evicted.sequence);
                if positions.is_empty() {
                    self.by_root.remove(&evicted.root);
                }
            }
        }
    }

    /// Composed value changes to get from `from_root` to `to_root`, restricted
    /// to user keys in `[start, end]` and clipped to `max_items` in path
    /// order.
    ///
    /// Composition is last-writer-wins per path across the walked entries.
    /// When the same root was recorded more than once, the earliest retained
    /// occurrence of `from_root` anchors the walk, and the earliest
    /// occurrence of `to_root` after that anchor ends it.
    pub fn value_changes(
        &self,
        from_root: &TrieHash,
        to_root: &TrieHash,
        start: Option<&Path>,
        end: Option<&Path>,
        max_items: usize,
    ) -> Result<Vec<(Path, MaybeValue)>, MerkleError> {
        if from_root == to_root {
            return Err(MerkleError::SameRoot);
        }
        let from_seq = self.earliest_occurrence(from_root, 0)?;
        let to_seq = self.earliest_occurrence(to_root, from_seq + 1)?;

        let mut composed = ChangeSet::default();
        for entry in &self.entries {
            if entry.sequence <= from_seq {
                continue;
            }
            if entry.sequence > to_seq {
                break;
            }
            composed.merge(entry.changes.clone());
        }

        Ok(composed
            .data
            .into_iter()
            .filter(|(path, _)| {
                start.map_or(true, |s| path.as_slice() >= s.as_slice())
                    && end.map_or(true, |e| path.as_slice() <= e.as_slice())
            })
            .map(|(path, (_, after))| (path, after))
            .take(max_items)
            .collect())
    }

    /// Composed inverse changes that rewind the current state back to
    /// `target_root`, keyed by path with the value the path held at that
    /// root. Empty when `target_root` is the current root.
    pub fn changes_to_root(
        &self,
        target_root: &TrieHash,
    ) -> Result<Vec<(Path, MaybeValue)>, MerkleError> {
        let target_seq = self.earliest_occurrence(target_root, 0)?;
        let mut forward = ChangeSet::default();
        for entry in &self.entries {
            if entry.sequence > target_seq {
                forward.merge(entry.changes.clone());
            }
        }
        Ok(forward
            .inverse()
            .data
            .into_iter()
            .map(|(path, (_, after))| (path, after))
            .collect())
    }

    /// Earliest retained occurrence of `root` at or after `min_sequence`.
    fn earliest_occurrence(
        &self,
        root: &TrieHash,
        min_sequence: u64,
    ) -> Result<u64, MerkleError> {
        self.by_root
            .get(root)
            .and_then(|positions| positions.range(min_sequence..).next())
            .copied()
            .ok_or(MerkleError::InsufficientHistory)
    }
}
