//! Tracks trie value changes as (before, after) pairs for history entries,
//! change proofs, and rollbacks.
use crate::path::Path;
use derive_more::Deref;
use serde::{Deserialize, Serialize};
use std::collections::{btree_map::Entry, BTreeMap};

/// An optional value: `None` represents absence or deletion.
pub type MaybeValue = Option<Vec<u8>>;

/// A set of value transitions keyed by path, each as an (old, new) pair.
///
/// No-op transitions where old equals new are dropped automatically, so an
/// empty change set means the two roots it connects are identical.
#[derive(Clone, Debug, Deref, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Maps paths to (old_value, new_value) pairs.
    #[deref]
    pub data: BTreeMap<Path, (MaybeValue, MaybeValue)>,
}

impl ChangeSet {
    /// Records a value transition for a path, chaining onto any transition
    /// already recorded: the earliest old value is preserved, the newest new
    /// value wins, and entries that return to their original value vanish.
    ///
    /// # Panics
    /// Panics if transitions don't chain, i.e. `old_value` disagrees with the
    /// new value already recorded for the same path. History entries always
    /// chain by construction, so a mismatch is a corrupted caller.
    pub fn add(&mut self, path: Path, old_value: MaybeValue, new_value: MaybeValue) {
        match self.data.entry(path) {
            Entry::Occupied(mut change) => {
                assert!(
                    old_value == change.get().1,
                    "non-chaining value transition at {:?}: recorded new value {:?}, incoming old value {:?}",
                    change.key(),
                    change.get().1.as_ref().map(hex::encode),
                    old_value.as_ref().map(hex::encode),
                );
                if change.get().0 == new_value {
                    change.remove();
                } else {
                    change.get_mut().1 = new_value;
                }
            }
            Entry::Vacant(change) => {
                if old_value != new_value {
                    change.insert((old_value, new_value));
                }
            }
        }
    }

    /// Merges a later set of changes into this one, chaining transitions.
    ///
    /// Logically equivalent to calling [`ChangeSet::add`] for each entry of
    /// `other`, so merged entries keep the earliest old value and the latest
    /// new value.
    pub fn merge(&mut self, other: Self) {
        for (path, (old_value, new_value)) in other.data {
            self.add(path, old_value, new_value);
        }
    }

    /// Swap old and new values for every entry, turning the change set into
    /// the one that undoes it.
    pub fn inverse(mut self) -> Self {
        self.data
            .values_mut()
            .for_each(|(old, new)| std::mem::swap(old, new));
        self
    }
}
