//! Layered, lazily-computed views over the database.
//!
//! A view stages key/value changes over a parent trie (the database itself or
//! another view) without touching the base until an explicit commit. Reads
//! fall through uncommitted layers top-down; the Merkle root and the node
//! overlay backing it are only materialized when first requested.
//!
//! Views form a tree. A parent tracks its registered children through weak
//! references; committing one child invalidates every sibling, and
//! invalidation cascades down to descendants. Untracked views opt out of the
//! registry: committing them invalidates nobody, but their own parent's
//! invalidation still reaches them through the parent chain check at commit
//! time. Children hold strong references upward, so the parent chain can
//! never dangle.

use crate::cancel::CancelToken;
use crate::db::DbInner;
use crate::error::MerkleError;
use crate::node::Node;
use crate::overlay::NodeOverlay;
use crate::path::Path;
use crate::proof::{Proof, RangeProof};
use crate::traits::{ByteStore, ReadOnlyTrie};
use crate::types::{BatchOp, TrieHash};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// The trie a view is layered over.
pub(crate) enum ParentTrie<S: ByteStore> {
    /// The view sits directly on the database.
    Db,
    /// The view sits on another (uncommitted) view.
    View(Arc<TrieView<S>>),
}

impl<S: ByteStore> Clone for ParentTrie<S> {
    fn clone(&self) -> Self {
        match self {
            ParentTrie::Db => ParentTrie::Db,
            ParentTrie::View(view) => ParentTrie::View(Arc::clone(view)),
        }
    }
}

/// Lazily computed state of a view: its staged values, plus the node overlay
/// and root hash once they have been materialized.
#[derive(Debug, Default)]
struct ViewInner {
    /// Staged changes: `None` is a pending delete. Later writes to the same
    /// key supersede earlier ones.
    staged: BTreeMap<Path, Option<Vec<u8>>>,
    overlay: Option<NodeOverlay>,
    root_hash: Option<TrieHash>,
}

/// An in-memory overlay of staged modifications over a parent trie.
pub struct TrieView<S: ByteStore> {
    pub(crate) db: Arc<DbInner<S>>,
    pub(crate) parent: RwLock<ParentTrie<S>>,
    inner: Mutex<ViewInner>,
    pub(crate) invalidated: AtomicBool,
    pub(crate) committed: AtomicBool,
    pub(crate) children: Mutex<Vec<Weak<TrieView<S>>>>,
}

impl<S: ByteStore> TrieView<S> {
    pub(crate) fn new(
        db: Arc<DbInner<S>>,
        parent: ParentTrie<S>,
        ops: Vec<BatchOp>,
    ) -> Arc<Self> {
        let mut staged = BTreeMap::new();
        for op in ops {
            staged.insert(Path::from_key(&op.key), op.value);
        }
        Self::with_staged(db, parent, staged)
    }

    pub(crate) fn with_staged(
        db: Arc<DbInner<S>>,
        parent: ParentTrie<S>,
        staged: BTreeMap<Path, Option<Vec<u8>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            parent: RwLock::new(parent),
            inner: Mutex::new(ViewInner {
                staged,
                overlay: None,
                root_hash: None,
            }),
            invalidated: AtomicBool::new(false),
            committed: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Create a tracked child view atop this one, staged with `ops`.
    pub fn new_view(
        self: &Arc<Self>,
        ops: Vec<BatchOp>,
    ) -> Result<Arc<TrieView<S>>, MerkleError> {
        self.ensure_valid()?;
        let child = TrieView::new(
            Arc::clone(&self.db),
            ParentTrie::View(Arc::clone(self)),
            ops,
        );
        self.children
            .lock()
            .expect("children lock poisoned")
            .push(Arc::downgrade(&child));
        Ok(child)
    }

    /// Stage an insert or overwrite.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), MerkleError> {
        self.stage(Path::from_key(key), Some(value.to_vec()))
    }

    /// Stage a deletion.
    pub fn delete(&self, key: &[u8]) -> Result<(), MerkleError> {
        self.stage(Path::from_key(key), None)
    }

    fn stage(&self, path: Path, value: Option<Vec<u8>>) -> Result<(), MerkleError> {
        self.ensure_valid()?;
        if self.committed.load(Ordering::Acquire) {
            return Err(MerkleError::Invalidated);
        }
        if !self
            .children
            .lock()
            .expect("children lock poisoned")
            .is_empty()
        {
            return Err(MerkleError::Internal(
                "view with child views no longer accepts writes".into(),
            ));
        }
        let mut inner = self.inner.lock().expect("view lock poisoned");
        inner.staged.insert(path, value);
        inner.overlay = None;
        inner.root_hash = None;
        Ok(())
    }

    /// Read a value through this view's staged changes, then the parent
    /// chain, down to the database.
    pub fn get_value(&self, key: &[u8], cancel: &CancelToken) -> Result<Vec<u8>, MerkleError> {
        self.value_or_absent(&Path::from_key(key), cancel)?
            .ok_or(MerkleError::NotFound)
    }

    /// Whether a sibling commit invalidated this view.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Whether this view has been committed into the database.
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    /// Compute (or return the memoized) Merkle root of this view's state.
    pub fn get_merkle_root(&self, cancel: &CancelToken) -> Result<TrieHash, MerkleError> {
        self.compute_root(cancel)
    }

    /// Existence (or absence) proof for `key` against this view's root.
    pub fn get_proof(&self, key: &[u8], cancel: &CancelToken) -> Result<Proof, MerkleError> {
        self.ensure_valid()?;
        self.compute_root(cancel)?;
        Proof::generate(self, key, cancel)
    }

    /// Range proof over `[start, end]` against this view's root.
    pub fn get_range_proof(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_items: usize,
        cancel: &CancelToken,
    ) -> Result<RangeProof, MerkleError> {
        self.ensure_valid()?;
        self.compute_root(cancel)?;
        RangeProof::generate(self, start, end, max_items, cancel)
    }

    /// Flatten this view's ancestor chain into a single change set and apply
    /// it to the database as one atomic update.
    ///
    /// On success every view in the chain is marked committed, all their
    /// siblings are invalidated, and this view's surviving children are
    /// re-parented onto the database.
    pub fn commit_to_db(self: &Arc<Self>, cancel: &CancelToken) -> Result<(), MerkleError> {
        let mut chain = vec![Arc::clone(self)];
        loop {
            let parent = chain
                .last()
                .expect("chain is non-empty")
                .parent
                .read()
                .expect("parent lock poisoned")
                .clone();
            match parent {
                ParentTrie::Db => break,
                ParentTrie::View(parent) => chain.push(parent),
            }
        }
        chain.reverse();
        Arc::clone(&self.db).commit_view_chain(&chain, cancel)
    }

    pub(crate) fn ensure_valid(&self) -> Result<(), MerkleError> {
        if self.is_invalidated() {
            Err(MerkleError::Invalidated)
        } else {
            Ok(())
        }
    }

    /// Mark this view and every descendant invalid.
    pub(crate) fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
        let children = std::mem::take(
            &mut *self.children.lock().expect("children lock poisoned"),
        );
        for child in children {
            if let Some(child) = child.upgrade() {
                child.invalidate();
            }
        }
    }

    /// Invalidate every tracked child except `keep`, dropping the registry
    /// down to the survivor (if it was tracked here at all).
    pub(crate) fn invalidate_children_except(&self, keep: Option<&Arc<TrieView<S>>>) {
        let mut children = self.children.lock().expect("children lock poisoned");
        let mut kept = Vec::new();
        for weak in children.drain(..) {
            if let Some(child) = weak.upgrade() {
                if keep.is_some_and(|k| Arc::ptr_eq(k, &child)) {
                    kept.push(Arc::downgrade(&child));
                } else {
                    child.invalidate();
                }
            }
        }
        *children = kept;
    }

    /// Snapshot of this view's staged changes, for commit flattening.
    pub(crate) fn staged_changes(&self) -> BTreeMap<Path, Option<Vec<u8>>> {
        self.inner.lock().expect("view lock poisoned").staged.clone()
    }

    /// Read through to the parent chain, returning `None` for an absent key.
    pub(crate) fn value_or_absent(
        &self,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<Option<Vec<u8>>, MerkleError> {
        self.ensure_valid()?;
        cancel.check()?;
        {
            let inner = self.inner.lock().expect("view lock poisoned");
            if let Some(staged) = inner.staged.get(path) {
                return Ok(staged.clone());
            }
        }
        // Clone the parent handle so no parent-lock guard is held across the
        // downstream read; a commit re-parenting this view takes that lock
        // while holding the database write lock.
        let parent = self.parent.read().expect("parent lock poisoned").clone();
        match parent {
            ParentTrie::Db => self.db.value_or_absent(path, cancel),
            ParentTrie::View(parent) => parent.value_or_absent(path, cancel),
        }
    }

    /// Fetch a node: the materialized overlay first, then the parent chain.
    pub(crate) fn get_node(
        &self,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<Option<Node>, MerkleError> {
        self.ensure_valid()?;
        self.compute_root(cancel)?;
        {
            let inner = self.inner.lock().expect("view lock poisoned");
            if let Some(overlay) = &inner.overlay {
                if let Some(entry) = overlay.entry(path) {
                    return Ok(entry.clone());
                }
            }
        }
        self.resolve_from_parent(path, cancel)
    }

    /// Materialize the overlay (if needed) and return the view's root hash.
    fn compute_root(&self, cancel: &CancelToken) -> Result<TrieHash, MerkleError> {
        self.ensure_valid()?;
        let mut inner = self.inner.lock().expect("view lock poisoned");
        if let Some(root) = inner.root_hash {
            return Ok(root);
        }
        cancel.check()?;

        let parent_root = self
            .resolve_from_parent(&Path::empty(), cancel)?
            .ok_or_else(|| MerkleError::Internal("parent trie has no root node".into()))?;
        let mut overlay = NodeOverlay::new(parent_root);
        let staged = inner.staged.clone();
        let mut resolver = |path: &Path| self.resolve_from_parent(path, cancel);
        for (path, change) in &staged {
            match change {
                Some(value) => overlay.insert(path, value.clone(), &mut resolver)?,
                None => {
                    overlay.remove(path, &mut resolver)?;
                }
            }
        }
        let root = overlay.compute_root_hash();
        inner.overlay = Some(overlay);
        inner.root_hash = Some(root);
        Ok(root)
    }

    fn resolve_from_parent(
        &self,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<Option<Node>, MerkleError> {
        let parent = self.parent.read().expect("parent lock poisoned").clone();
        match parent {
            ParentTrie::Db => self.db.get_node(path, cancel),
            ParentTrie::View(parent) => parent.get_node(path, cancel),
        }
    }
}

impl<S: ByteStore> ReadOnlyTrie for TrieView<S> {
    fn get_value(&self, key: &[u8], cancel: &CancelToken) -> Result<Vec<u8>, MerkleError> {
        TrieView::get_value(self, key, cancel)
    }

    fn get_node(&self, path: &Path, cancel: &CancelToken) -> Result<Option<Node>, MerkleError> {
        TrieView::get_node(self, path, cancel)
    }

    fn get_merkle_root(&self, cancel: &CancelToken) -> Result<TrieHash, MerkleError> {
        self.compute_root(cancel)
    }
}

impl<S: ByteStore> std::fmt::Debug for TrieView<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrieView")
            .field("invalidated", &self.is_invalidated())
            .field("committed", &self.is_committed())
            .finish_non_exhaustive()
    }
}

// View behavior is exercised end-to-end in `db.rs` and `lib.rs`, where a
// database exists to commit into.
