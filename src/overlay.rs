//! Copy-on-write node overlay: the structural engine behind views, commits,
//! and proof verification.
//!
//! An overlay owns every node touched by a batch of edits, keyed by absolute
//! path (`None` marks a node deleted from the base). Nodes are pulled in
//! lazily through a resolver closure, so the same engine serves a view over a
//! live database, a view over another view, and the free-standing sparse trie
//! a proof verifier rebuilds (where the resolver just returns nothing).
//!
//! Edits keep the trie canonical as they go: inserts split a child link at
//! the longest common prefix when needed, deletes unlink empty nodes and
//! collapse single-child nodes into their child. Digests are not maintained
//! during edits; [`NodeOverlay::compute_root_hash`] recomputes them afterwards
//! in one bottom-up pass, hashing each depth class in parallel.

use crate::constant::EMPTY_ROOT_HASH;
use crate::error::MerkleError;
use crate::node::{Child, Node};
use crate::path::Path;
use crate::types::TrieHash;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Resolves a node from the layer beneath the overlay.
pub(crate) type NodeResolver<'a> =
    dyn FnMut(&Path) -> Result<Option<Node>, MerkleError> + 'a;

/// A batch of in-memory trie edits over some base state.
#[derive(Debug, Clone)]
pub(crate) struct NodeOverlay {
    /// Touched nodes by absolute path; `None` means deleted from the base.
    nodes: FxHashMap<Path, Option<Node>>,
    /// Parent path of every live overlay node except the root.
    parents: FxHashMap<Path, Path>,
}

impl NodeOverlay {
    /// Start an overlay from the base trie's root node.
    pub fn new(root: Node) -> Self {
        debug_assert!(root.key().is_empty(), "root node must have the empty key");
        let mut nodes = FxHashMap::default();
        nodes.insert(Path::empty(), Some(root));
        Self {
            nodes,
            parents: FxHashMap::default(),
        }
    }

    /// The overlay's root node.
    pub fn root(&self) -> &Node {
        self.nodes
            .get(&Path::empty())
            .and_then(|n| n.as_ref())
            .expect("overlay always holds a root node")
    }

    /// Raw overlay entry at `path`: `Some(None)` is a deletion marker,
    /// `None` means the overlay never touched the path.
    pub fn entry(&self, path: &Path) -> Option<&Option<Node>> {
        self.nodes.get(path)
    }

    /// The live overlay node at `path`, if any.
    pub fn node(&self, path: &Path) -> Option<&Node> {
        self.nodes.get(path).and_then(|n| n.as_ref())
    }

    /// All overlay entries, for translation into a write batch.
    pub fn entries(&self) -> impl Iterator<Item = (&Path, &Option<Node>)> {
        self.nodes.iter()
    }

    /// Stage `value` at `key`, splicing new nodes into the trie as needed.
    pub fn insert(
        &mut self,
        key: &Path,
        value: Vec<u8>,
        resolver: &mut NodeResolver<'_>,
    ) -> Result<(), MerkleError> {
        self.splice_node(key, resolver)?;
        self.expect_node_mut(key)?.set_value(Some(value));
        Ok(())
    }

    /// Remove the value at `key`, unlinking and collapsing nodes so the trie
    /// stays canonical. Returns whether a value was actually removed.
    pub fn remove(
        &mut self,
        key: &Path,
        resolver: &mut NodeResolver<'_>,
    ) -> Result<bool, MerkleError> {
        let visited = self.visit_path(key, resolver)?;
        let deepest_key = visited.last().expect("visit includes the root").clone();
        {
            let deepest = self.expect_node(&deepest_key)?;
            if deepest.key() != key || deepest.value().is_none() {
                return Ok(false);
            }
        }
        self.expect_node_mut(&deepest_key)?.set_value(None);

        // Prune upward: nodes with neither value nor children are unlinked,
        // and a valueless node left with a single child folds into it. The
        // root is exempt from both.
        let mut idx = visited.len() - 1;
        loop {
            let current_key = visited[idx].clone();
            if current_key.is_empty() {
                break;
            }
            let (has_value, child_count) = {
                let node = self.expect_node(&current_key)?;
                (node.value().is_some(), node.child_count())
            };
            match (has_value, child_count) {
                (false, 0) => {
                    let parent_key = visited[idx - 1].clone();
                    let nibble = current_key[parent_key.len()];
                    self.expect_node_mut(&parent_key)?.remove_child(nibble);
                    self.delete_node(&current_key);
                    idx -= 1;
                }
                (false, 1) => {
                    let (child_nibble, child) = {
                        let node = self.expect_node(&current_key)?;
                        let (nibble, child) =
                            node.single_child().expect("child count is one");
                        (nibble, child.clone())
                    };
                    let child_key = current_key.join(child_nibble, &child.suffix);
                    let parent_key = visited[idx - 1].clone();
                    let parent_nibble = current_key[parent_key.len()];
                    let suffix = child_key.skip(parent_key.len() + 1);
                    self.expect_node_mut(&parent_key)?.set_child(
                        parent_nibble,
                        Child {
                            suffix,
                            id: child.id,
                        },
                    );
                    if self.nodes.contains_key(&child_key) {
                        self.parents.insert(child_key, parent_key);
                    }
                    self.delete_node(&current_key);
                    break;
                }
                _ => break,
            }
        }
        Ok(true)
    }

    /// Make sure a node exists at exactly `key`, creating it (and a branch
    /// node at the longest common prefix, when a child link diverges) with
    /// placeholder digests. Used directly by proof verification to rebuild
    /// sparse tries.
    pub fn ensure_node(
        &mut self,
        key: &Path,
        resolver: &mut NodeResolver<'_>,
    ) -> Result<(), MerkleError> {
        self.splice_node(key, resolver)
    }

    /// Install a digest-only child link on the node at `node_key`. The
    /// referenced subtree stays unmaterialized, so the digest survives
    /// [`NodeOverlay::compute_root_hash`] untouched.
    pub fn set_child(
        &mut self,
        node_key: &Path,
        nibble: u8,
        child: Child,
    ) -> Result<(), MerkleError> {
        self.expect_node_mut(node_key)?.set_child(nibble, child);
        Ok(())
    }

    /// Recompute digests of every live overlay node bottom-up and return the
    /// new root hash (the empty-trie sentinel when the root carries nothing).
    ///
    /// Nodes of equal depth have no hash dependencies on each other, so each
    /// depth class is hashed in parallel before its digests are folded into
    /// the parents one level up.
    pub fn compute_root_hash(&mut self) -> TrieHash {
        let mut by_depth: BTreeMap<usize, Vec<Path>> = BTreeMap::new();
        for (path, node) in &self.nodes {
            if node.is_some() {
                by_depth.entry(path.len()).or_default().push(path.clone());
            }
        }

        for (_, level) in by_depth.into_iter().rev() {
            let digests: Vec<(Path, TrieHash)> = level
                .par_iter()
                .map(|path| {
                    let node = self.nodes[path].as_ref().expect("level holds live nodes");
                    (path.clone(), node.digest())
                })
                .collect();
            for (path, id) in digests {
                if let Some(Some(node)) = self.nodes.get_mut(&path) {
                    node.set_cached_id(id);
                }
                if path.is_empty() {
                    continue;
                }
                let parent_key = self
                    .parents
                    .get(&path)
                    .cloned()
                    .expect("non-root overlay node has a recorded parent");
                let nibble = path[parent_key.len()];
                if let Some(Some(parent)) = self.nodes.get_mut(&parent_key) {
                    parent.set_child_id(nibble, id);
                }
            }
        }

        let root = self.root();
        if root.is_empty() {
            EMPTY_ROOT_HASH
        } else {
            root.digest()
        }
    }

    /// Materialize the spine from the root toward `key`, returning the keys
    /// of the visited nodes. The last visited node is the deepest whose key
    /// is a prefix of `key`.
    fn visit_path(
        &mut self,
        key: &Path,
        resolver: &mut NodeResolver<'_>,
    ) -> Result<Vec<Path>, MerkleError> {
        let mut visited = vec![Path::empty()];
        loop {
            let current_key = visited.last().expect("starts with the root").clone();
            let current = self.expect_node(&current_key)?;
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
            self.materialize(&child_key, &current_key, resolver)?;
            visited.push(child_key);
        }
        Ok(visited)
    }

    /// Ensure a node exists at exactly `key`, splitting a diverging child
    /// link at the longest common prefix when necessary. New child links get
    /// placeholder digests; `compute_root_hash` fills them in.
    fn splice_node(
        &mut self,
        key: &Path,
        resolver: &mut NodeResolver<'_>,
    ) -> Result<(), MerkleError> {
        let visited = self.visit_path(key, resolver)?;
        let deepest_key = visited.last().expect("visit includes the root").clone();
        let (branch_nibble, existing) = {
            let deepest = self.expect_node(&deepest_key)?;
            if deepest.key() == key {
                return Ok(());
            }
            let nibble = key[deepest_key.len()];
            (nibble, deepest.child(nibble).cloned())
        };

        match existing {
            None => {
                // Fresh territory below the deepest node.
                let suffix = key.skip(deepest_key.len() + 1);
                self.expect_node_mut(&deepest_key)?.set_child(
                    branch_nibble,
                    Child {
                        suffix,
                        id: TrieHash::default(),
                    },
                );
                self.put_node(key.clone(), Node::new(key.clone()), Some(deepest_key));
            }
            Some(existing) => {
                // The child link diverges from `key`; split it with a branch
                // node at the longest common prefix.
                let child_key = deepest_key.join(branch_nibble, &existing.suffix);
                let lcp = key.common_prefix_len(&child_key);
                debug_assert!(lcp > deepest_key.len() && lcp < child_key.len());
                let branch_key = key.take(lcp);

                let mut branch = Node::new(branch_key.clone());
                branch.set_child(
                    child_key[lcp],
                    Child {
                        suffix: child_key.skip(lcp + 1),
                        id: existing.id,
                    },
                );
                if self.nodes.contains_key(&child_key) {
                    self.parents.insert(child_key.clone(), branch_key.clone());
                }
                if lcp < key.len() {
                    branch.set_child(
                        key[lcp],
                        Child {
                            suffix: key.skip(lcp + 1),
                            id: TrieHash::default(),
                        },
                    );
                }
                self.expect_node_mut(&deepest_key)?.set_child(
                    branch_nibble,
                    Child {
                        suffix: branch_key.skip(deepest_key.len() + 1),
                        id: TrieHash::default(),
                    },
                );
                self.put_node(branch_key.clone(), branch, Some(deepest_key));
                if lcp < key.len() {
                    self.put_node(key.clone(), Node::new(key.clone()), Some(branch_key));
                }
            }
        }
        Ok(())
    }

    fn materialize(
        &mut self,
        path: &Path,
        parent: &Path,
        resolver: &mut NodeResolver<'_>,
    ) -> Result<(), MerkleError> {
        match self.nodes.get(path) {
            Some(Some(_)) => {
                self.parents.insert(path.clone(), parent.clone());
                Ok(())
            }
            Some(None) => Err(MerkleError::Internal(format!(
                "linked node {path:?} is marked deleted"
            ))),
            None => {
                let node = resolver(path)?.ok_or_else(|| {
                    MerkleError::Internal(format!("missing trie node at {path:?}"))
                })?;
                self.put_node(path.clone(), node, Some(parent.clone()));
                Ok(())
            }
        }
    }

    fn put_node(&mut self, path: Path, node: Node, parent: Option<Path>) {
        if let Some(parent) = parent {
            self.parents.insert(path.clone(), parent);
        }
        self.nodes.insert(path, Some(node));
    }

    fn delete_node(&mut self, path: &Path) {
        self.nodes.insert(path.clone(), None);
        self.parents.remove(path);
    }

    fn expect_node(&self, path: &Path) -> Result<&Node, MerkleError> {
        match self.nodes.get(path) {
            Some(Some(node)) => Ok(node),
            _ => Err(MerkleError::Internal(format!(
                "overlay is missing the node at {path:?}"
            ))),
        }
    }

    fn expect_node_mut(&mut self, path: &Path) -> Result<&mut Node, MerkleError> {
        match self.nodes.get_mut(path) {
            Some(Some(node)) => Ok(node),
            _ => Err(MerkleError::Internal(format!(
                "overlay is missing the node at {path:?}"
            ))),
        }
    }
}
