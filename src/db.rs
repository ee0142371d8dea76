//! The database root container.
//!
//! `MerkleDb` owns the byte store, the node cache, the materialized root
//! node, the history ring, and the registry of tracked child views, all
//! behind a single reader/writer lock. Every mutation flows through a view
//! commit: the new root and the dirtied nodes are computed outside the write
//! lock, validated against the base once the lock is held, then persisted as
//! one atomic byte-store batch before any in-memory state changes.

use crate::cache::NodeCache;
use crate::cancel::CancelToken;
use crate::changes::ChangeSet;
use crate::constant::{
    node_store_key, DEFAULT_EVICTION_BATCH_SIZE, DEFAULT_HISTORY_LENGTH,
    DEFAULT_NODE_CACHE_SIZE, EMPTY_ROOT_HASH, NODE_PREFIX, ROOT_HASH_KEY,
};
use crate::error::{MerkleError, StoreError};
use crate::history::TrieHistory;
use crate::metrics::TrieMetrics;
use crate::node::Node;
use crate::overlay::NodeOverlay;
use crate::path::Path;
use crate::proof::{self, ChangeProof, Proof, RangeProof};
use crate::traits::{ByteStore, ReadOnlyTrie, WriteBatch};
use crate::types::{BatchOp, TrieHash};
use crate::view::{ParentTrie, TrieView};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Tuning knobs recognized by the database.
#[derive(Clone, Debug)]
pub struct Config {
    /// Node-cache entries evicted per eviction pass. Must be positive.
    pub eviction_batch_size: usize,
    /// Maximum retained root transitions. Zero disables history (and with it
    /// change proofs and proofs at past roots).
    pub history_length: usize,
    /// Hard cap on cached nodes. Must be positive.
    pub node_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            eviction_batch_size: DEFAULT_EVICTION_BATCH_SIZE,
            history_length: DEFAULT_HISTORY_LENGTH,
            node_cache_size: DEFAULT_NODE_CACHE_SIZE,
        }
    }
}

/// State guarded by the database lock.
pub(crate) struct DbState<S: ByteStore> {
    /// The materialized root node.
    root: Node,
    /// Digest of the current trie state.
    root_hash: TrieHash,
    history: TrieHistory,
    /// Interior mutex so the read path can update LRU recency while holding
    /// only the outer read lock.
    cache: Mutex<NodeCache>,
    child_views: Vec<Weak<TrieView<S>>>,
}

/// Shared interior of a [`MerkleDb`], also held by every view derived from it.
pub(crate) struct DbInner<S: ByteStore> {
    store: S,
    state: RwLock<DbState<S>>,
    metrics: Arc<TrieMetrics>,
    closed: AtomicBool,
    /// Latched when a commit trips an integrity violation; all further
    /// mutations are refused until the database is reopened.
    poisoned: AtomicBool,
    eviction_batch_size: usize,
}

/// A persistent, authenticated key/value store summarized by a Merkle root.
pub struct MerkleDb<S: ByteStore> {
    inner: Arc<DbInner<S>>,
}

impl<S: ByteStore> Clone for MerkleDb<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ByteStore> std::fmt::Debug for MerkleDb<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read().expect("state lock poisoned");
        f.debug_struct("MerkleDb")
            .field("root_hash", &state.root_hash)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<S: ByteStore> MerkleDb<S> {
    /// Open a database over `store`, loading the persisted root when one
    /// exists.
    pub fn new(store: S, config: Config) -> Result<Self, MerkleError> {
        assert!(
            config.eviction_batch_size > 0,
            "eviction batch size must be positive"
        );
        assert!(config.node_cache_size > 0, "node cache size must be positive");

        let root_hash = match store.get(&ROOT_HASH_KEY) {
            Ok(bytes) => TrieHash(bytes.as_slice().try_into().map_err(|_| {
                MerkleError::Internal("persisted root digest is not 32 bytes".into())
            })?),
            Err(StoreError::NotFound) => EMPTY_ROOT_HASH,
            Err(err) => return Err(err.into()),
        };
        let root = match store.get(&node_store_key(&Path::empty())) {
            Ok(bytes) => Node::decode(&bytes)?,
            Err(StoreError::NotFound) => Node::new(Path::empty()),
            Err(err) => return Err(err.into()),
        };
        let loaded_hash = if root.is_empty() {
            EMPTY_ROOT_HASH
        } else {
            root.digest()
        };
        if loaded_hash != root_hash {
            return Err(MerkleError::Internal(format!(
                "persisted root node hashes to {loaded_hash}, expected {root_hash}"
            )));
        }

        let mut history = TrieHistory::new(config.history_length);
        history.record(root_hash, ChangeSet::default());
        tracing::debug!(root = %root_hash, "opened merkle database");

        Ok(Self {
            inner: Arc::new(DbInner {
                store,
                state: RwLock::new(DbState {
                    root,
                    root_hash,
                    history,
                    cache: Mutex::new(NodeCache::new(
                        config.node_cache_size,
                        config.eviction_batch_size,
                    )),
                    child_views: Vec::new(),
                }),
                metrics: Arc::new(TrieMetrics::default()),
                closed: AtomicBool::new(false),
                poisoned: AtomicBool::new(false),
                eviction_batch_size: config.eviction_batch_size,
            }),
        })
    }

    /// Fetch a copy of the value stored at `key`.
    pub fn get(&self, key: &[u8], cancel: &CancelToken) -> Result<Vec<u8>, MerkleError> {
        self.inner
            .value_or_absent(&Path::from_key(key), cancel)?
            .ok_or(MerkleError::NotFound)
    }

    /// Batched [`MerkleDb::get`]: one result per requested key.
    pub fn get_values(
        &self,
        keys: &[Vec<u8>],
        cancel: &CancelToken,
    ) -> Vec<Result<Vec<u8>, MerkleError>> {
        keys.iter().map(|key| self.get(key, cancel)).collect()
    }

    /// Insert or overwrite a single key as its own atomic commit.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), MerkleError> {
        self.new_untracked_view(vec![BatchOp::put(key, value)])?
            .commit_to_db(&CancelToken::new())
    }

    /// Delete a single key as its own atomic commit. Deleting an absent key
    /// succeeds without changing the root.
    pub fn delete(&self, key: &[u8]) -> Result<(), MerkleError> {
        self.new_untracked_view(vec![BatchOp::delete(key)])?
            .commit_to_db(&CancelToken::new())
    }

    /// Start a batch of writes committed together by [`Batch::write`].
    pub fn new_batch(&self) -> Batch<'_, S> {
        Batch {
            db: self,
            ops: Vec::new(),
        }
    }

    /// Create a tracked view staged with `ops`. Committing any sibling view
    /// invalidates it.
    pub fn new_view(&self, ops: Vec<BatchOp>) -> Result<Arc<TrieView<S>>, MerkleError> {
        self.inner.ensure_open()?;
        let view = TrieView::new(Arc::clone(&self.inner), ParentTrie::Db, ops);
        self.inner
            .state
            .write()
            .expect("state lock poisoned")
            .child_views
            .push(Arc::downgrade(&view));
        Ok(view)
    }

    /// Create an untracked view: it is not registered with the database, so
    /// committing it invalidates no siblings and committing a sibling does
    /// not invalidate it.
    pub fn new_untracked_view(
        &self,
        ops: Vec<BatchOp>,
    ) -> Result<Arc<TrieView<S>>, MerkleError> {
        self.inner.ensure_open()?;
        Ok(TrieView::new(Arc::clone(&self.inner), ParentTrie::Db, ops))
    }

    /// The current Merkle root.
    pub fn get_merkle_root(&self, cancel: &CancelToken) -> Result<TrieHash, MerkleError> {
        self.inner.ensure_open()?;
        cancel.check()?;
        Ok(self.inner.state.read().expect("state lock poisoned").root_hash)
    }

    /// Existence (or absence) proof for `key` against the current root.
    pub fn get_proof(&self, key: &[u8], cancel: &CancelToken) -> Result<Proof, MerkleError> {
        self.inner.ensure_open()?;
        let proof = Proof::generate(self, key, cancel)?;
        self.inner.metrics.record_proof();
        Ok(proof)
    }

    /// Range proof over `[start, end]` against the current root, with at most
    /// `max_items` key/value pairs.
    pub fn get_range_proof(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_items: usize,
        cancel: &CancelToken,
    ) -> Result<RangeProof, MerkleError> {
        self.inner.ensure_open()?;
        let proof = RangeProof::generate(self, start, end, max_items, cancel)?;
        self.inner.metrics.record_proof();
        Ok(proof)
    }

    /// Range proof at a historical root still retained by the history ring.
    pub fn get_range_proof_at_root(
        &self,
        root: TrieHash,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_items: usize,
        cancel: &CancelToken,
    ) -> Result<RangeProof, MerkleError> {
        self.inner.ensure_open()?;
        let view = self.view_at_root(root, cancel)?;
        let proof = RangeProof::generate(view.as_ref(), start, end, max_items, cancel)?;
        self.inner.metrics.record_proof();
        Ok(proof)
    }

    /// Proof of the exact changes between two retained roots, restricted to
    /// `[start, end]` and clipped to `max_items` changes in key order.
    pub fn get_change_proof(
        &self,
        from_root: TrieHash,
        to_root: TrieHash,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max_items: usize,
        cancel: &CancelToken,
    ) -> Result<ChangeProof, MerkleError> {
        self.inner.ensure_open()?;
        cancel.check()?;
        let changes = {
            let state = self.inner.state.read().expect("state lock poisoned");
            state.history.value_changes(
                &from_root,
                &to_root,
                start.map(Path::from_key).as_ref(),
                end.map(Path::from_key).as_ref(),
                max_items,
            )?
        };

        let end_view = self.view_at_root(to_root, cancel)?;
        let largest_key = changes
            .last()
            .map(|(path, _)| path.to_key())
            .or_else(|| end.map(|e| e.to_vec()));
        let start_proof = match start {
            Some(start) => proof::proof_path(end_view.as_ref(), &Path::from_key(start), cancel)?,
            None => Vec::new(),
        };
        let end_proof = match &largest_key {
            Some(key) => proof::proof_path(end_view.as_ref(), &Path::from_key(key), cancel)?,
            None => Vec::new(),
        };

        self.inner.metrics.record_proof();
        Ok(ChangeProof {
            start_proof,
            end_proof,
            key_changes: changes
                .into_iter()
                .map(|(path, value)| (path.to_key(), value))
                .collect(),
        })
    }

    /// Verify a change proof whose start state is this database's current
    /// root: applying the claimed changes must yield `expected_end_root`, and
    /// both boundary proofs must anchor at it.
    pub fn verify_change_proof(
        &self,
        proof: &ChangeProof,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        expected_end_root: TrieHash,
        cancel: &CancelToken,
    ) -> Result<(), MerkleError> {
        self.inner.ensure_open()?;
        proof.verify_structure(start, end)?;

        let largest_key = proof
            .key_changes
            .last()
            .map(|(key, _)| key.clone())
            .or_else(|| end.map(|e| e.to_vec()));
        if let Some(start) = start {
            proof::verify_path_structure(&proof.start_proof, &Path::from_key(start))?;
            proof::verify_path_digests(&proof.start_proof, expected_end_root)?;
        }
        if let Some(largest) = &largest_key {
            proof::verify_path_structure(&proof.end_proof, &Path::from_key(largest))?;
            proof::verify_path_digests(&proof.end_proof, expected_end_root)?;
        }

        let ops = proof
            .key_changes
            .iter()
            .map(|(key, value)| BatchOp {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        let scratch = self.new_untracked_view(ops)?;
        let new_root = scratch.get_merkle_root(cancel)?;
        if new_root != expected_end_root {
            return Err(MerkleError::InvalidProof(format!(
                "applying changes yields root {new_root}, expected {expected_end_root}"
            )));
        }
        Ok(())
    }

    /// Apply a range proof to this database: inside the proven range the trie
    /// is made exactly equal to what the proof attests, keys outside the
    /// range are untouched.
    ///
    /// Only structural validity is checked here; callers must first verify
    /// the proof against a trusted root with [`RangeProof::verify`]. Nothing
    /// is modified when validation fails.
    pub fn commit_range_proof(
        &self,
        proof: &RangeProof,
        cancel: &CancelToken,
    ) -> Result<(), MerkleError> {
        self.inner.ensure_open()?;
        proof.verify_structure()?;

        let start = proof.start.as_deref().map(Path::from_key);
        let largest = proof
            .key_values
            .last()
            .map(|(key, _)| Path::from_key(key))
            .or_else(|| proof.end.as_deref().map(Path::from_key));

        // Everything currently inside [start, largest] that the proof does
        // not attest has to go.
        let existing = proof::collect_range(
            self,
            start.as_ref(),
            largest.as_ref(),
            usize::MAX,
            cancel,
        )?;
        let proven: BTreeMap<Path, &[u8]> = proof
            .key_values
            .iter()
            .map(|(key, value)| (Path::from_key(key), value.as_slice()))
            .collect();

        let mut ops: Vec<BatchOp> = Vec::with_capacity(existing.len() + proven.len());
        for (path, _) in &existing {
            if !proven.contains_key(path) {
                ops.push(BatchOp::delete(path.to_key()));
            }
        }
        for (path, value) in &proven {
            ops.push(BatchOp::put(path.to_key(), value.to_vec()));
        }

        self.new_untracked_view(ops)?.commit_to_db(cancel)
    }

    /// Close the database and its byte store. Every later operation fails
    /// with [`MerkleError::Closed`].
    pub fn close(&self) -> Result<(), MerkleError> {
        let _state = self.inner.state.write().expect("state lock poisoned");
        self.inner.closed.store(true, Ordering::Release);
        self.inner.store.close()?;
        tracing::debug!("closed merkle database");
        Ok(())
    }

    /// Cheap liveness check.
    pub fn health_check(&self, cancel: &CancelToken) -> Result<(), MerkleError> {
        cancel.check()?;
        self.inner.ensure_open()
    }

    /// Discard all materialized nodes and reconstruct the trie from the raw
    /// key/value pairs in the byte store, reinserting them in batches sized
    /// by `eviction_batch_size`. The final root must equal the root persisted
    /// before the rebuild.
    pub fn rebuild(&self, cancel: &CancelToken) -> Result<(), MerkleError> {
        let result = self.rebuild_inner(cancel);
        if matches!(result, Err(MerkleError::Internal(_))) {
            self.inner.poison();
        }
        result
    }

    fn rebuild_inner(&self, cancel: &CancelToken) -> Result<(), MerkleError> {
        self.inner.ensure_writable()?;
        cancel.check()?;
        let inner = &self.inner;
        let mut state = inner.state.write().expect("state lock poisoned");
        let old_root = state.root_hash;
        tracing::debug!(root = %old_root, "rebuilding trie from raw entries");

        let mut pairs = Vec::new();
        let mut wipe = WriteBatch::new();
        for (store_key, bytes) in inner.store.iter_prefix(&[NODE_PREFIX])? {
            let node = Node::decode(&bytes)?;
            if let Some(value) = node.value() {
                pairs.push((node.key().clone(), value.clone()));
            }
            wipe.delete(store_key);
        }
        wipe.put(ROOT_HASH_KEY.to_vec(), EMPTY_ROOT_HASH.to_vec());
        inner.store.write_batch(wipe)?;

        state.root = Node::new(Path::empty());
        state.root_hash = EMPTY_ROOT_HASH;
        state.cache.lock().expect("cache lock poisoned").clear();

        for chunk in pairs.chunks(inner.eviction_batch_size) {
            let mut changes = ChangeSet::default();
            for (path, value) in chunk {
                changes.add(path.clone(), None, Some(value.clone()));
            }
            inner.apply_changes_locked(&mut state, changes, cancel)?;
        }

        if state.root_hash != old_root {
            return Err(MerkleError::Internal(format!(
                "rebuild produced root {}, expected {old_root}",
                state.root_hash
            )));
        }
        tracing::debug!(pairs = pairs.len(), root = %old_root, "rebuild complete");
        Ok(())
    }

    /// Handle to the database's operation counters.
    pub fn metrics(&self) -> Arc<TrieMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Build an untracked read-only view positioned at `root`, which must be
    /// retained by the history ring.
    fn view_at_root(
        &self,
        root: TrieHash,
        cancel: &CancelToken,
    ) -> Result<Arc<TrieView<S>>, MerkleError> {
        let staged: BTreeMap<Path, Option<Vec<u8>>> = {
            let state = self.inner.state.read().expect("state lock poisoned");
            state
                .history
                .changes_to_root(&root)?
                .into_iter()
                .collect()
        };
        let view = TrieView::with_staged(Arc::clone(&self.inner), ParentTrie::Db, staged);
        let rebuilt = view.get_merkle_root(cancel)?;
        if rebuilt != root {
            return Err(MerkleError::Internal(format!(
                "history rewind produced root {rebuilt}, expected {root}"
            )));
        }
        Ok(view)
    }

    #[cfg(test)]
    pub(crate) fn tracked_view_count(&self) -> usize {
        self.inner
            .state
            .read()
            .expect("state lock poisoned")
            .child_views
            .iter()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }
}

impl<S: ByteStore> ReadOnlyTrie for MerkleDb<S> {
    fn get_value(&self, key: &[u8], cancel: &CancelToken) -> Result<Vec<u8>, MerkleError> {
        self.get(key, cancel)
    }

    fn get_node(&self, path: &Path, cancel: &CancelToken) -> Result<Option<Node>, MerkleError> {
        self.inner.get_node(path, cancel)
    }

    fn get_merkle_root(&self, cancel: &CancelToken) -> Result<TrieHash, MerkleError> {
        MerkleDb::get_merkle_root(self, cancel)
    }
}

impl<S: ByteStore> DbInner<S> {
    pub(crate) fn ensure_open(&self) -> Result<(), MerkleError> {
        if self.closed.load(Ordering::Acquire) {
            Err(MerkleError::Closed)
        } else {
            Ok(())
        }
    }

    /// Gate for mutating operations: a database that tripped an integrity
    /// violation refuses every further mutation until reopened.
    fn ensure_writable(&self) -> Result<(), MerkleError> {
        self.ensure_open()?;
        if self.poisoned.load(Ordering::Acquire) {
            return Err(MerkleError::Internal(
                "database is poisoned by an earlier integrity violation".into(),
            ));
        }
        Ok(())
    }

    fn poison(&self) {
        tracing::error!("integrity violation: refusing further mutations");
        self.poisoned.store(true, Ordering::Release);
    }

    /// Fetch a node through the cache, falling back to the byte store.
    pub(crate) fn get_node(
        &self,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<Option<Node>, MerkleError> {
        self.ensure_open()?;
        cancel.check()?;
        let state = self.state.read().expect("state lock poisoned");
        self.get_node_in(&state, path, cancel)
    }

    /// Value lookup by exact path: every stored key has a node at its own
    /// path, so a single node fetch answers it.
    pub(crate) fn value_or_absent(
        &self,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<Option<Vec<u8>>, MerkleError> {
        Ok(self
            .get_node(path, cancel)?
            .and_then(|node| node.value().cloned()))
    }

    /// Node fetch with the state lock already held.
    fn get_node_in(
        &self,
        state: &DbState<S>,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<Option<Node>, MerkleError> {
        if path.is_empty() {
            return Ok(Some(state.root.clone()));
        }
        {
            let mut cache = state.cache.lock().expect("cache lock poisoned");
            if let Some(entry) = cache.get(path) {
                self.metrics.record_cache_hit();
                return Ok(entry);
            }
        }
        self.metrics.record_cache_miss();
        cancel.check()?;
        match self.store.get(&node_store_key(path)) {
            Ok(bytes) => {
                self.metrics.record_node_read();
                let node = Node::decode(&bytes)?;
                state
                    .cache
                    .lock()
                    .expect("cache lock poisoned")
                    .put(path.clone(), node.clone());
                Ok(Some(node))
            }
            Err(StoreError::NotFound) => {
                state
                    .cache
                    .lock()
                    .expect("cache lock poisoned")
                    .put_absent(path.clone());
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Commit a flattened chain of views as one atomic update.
    ///
    /// The merged change set, the before-values, and the dirtied node overlay
    /// are all computed under read locks; the write lock is taken only to
    /// validate the base root is unchanged, submit the batch, and fold the
    /// result into memory. A racing sibling commit therefore surfaces as
    /// [`MerkleError::Invalidated`] here instead of corrupting state.
    pub(crate) fn commit_view_chain(
        self: Arc<Self>,
        chain: &[Arc<TrieView<S>>],
        cancel: &CancelToken,
    ) -> Result<(), MerkleError> {
        let result = self.commit_view_chain_inner(chain, cancel);
        if matches!(result, Err(MerkleError::Internal(_))) {
            self.poison();
        }
        result
    }

    fn commit_view_chain_inner(
        &self,
        chain: &[Arc<TrieView<S>>],
        cancel: &CancelToken,
    ) -> Result<(), MerkleError> {
        self.ensure_writable()?;
        for view in chain {
            view.ensure_valid()?;
            if view.is_committed() {
                return Err(MerkleError::Invalidated);
            }
        }

        // Flatten staged changes oldest to newest so the newest write wins.
        let mut merged: BTreeMap<Path, Option<Vec<u8>>> = BTreeMap::new();
        for view in chain {
            merged.extend(view.staged_changes());
        }

        let base_root_hash = self.state.read().expect("state lock poisoned").root_hash;
        let mut changes = ChangeSet::default();
        for (path, after) in &merged {
            let before = self.value_or_absent(path, cancel)?;
            changes.add(path.clone(), before, after.clone());
        }

        let computed = if changes.is_empty() {
            None
        } else {
            let root = self.state.read().expect("state lock poisoned").root.clone();
            let mut overlay = NodeOverlay::new(root);
            let mut resolver = |path: &Path| self.get_node(path, cancel);
            for (path, (_, after)) in changes.iter() {
                match after {
                    Some(value) => overlay.insert(path, value.clone(), &mut resolver)?,
                    None => {
                        overlay.remove(path, &mut resolver)?;
                    }
                }
            }
            let new_root_hash = overlay.compute_root_hash();
            Some((overlay, new_root_hash))
        };

        // Last cancellation point; the batch submission below is not
        // cancellable.
        cancel.check()?;

        let mut state = self.state.write().expect("state lock poisoned");
        self.ensure_open()?;
        for view in chain {
            view.ensure_valid()?;
        }
        if state.root_hash != base_root_hash {
            // An untracked sibling moved the base underneath us.
            return Err(MerkleError::Invalidated);
        }

        if let Some((overlay, new_root_hash)) = computed {
            let mut batch = WriteBatch::new();
            let mut written_paths = Vec::new();
            for (path, entry) in overlay.entries() {
                match entry {
                    Some(node) => batch.put(node_store_key(path), node.encode()),
                    None => batch.delete(node_store_key(path)),
                }
                written_paths.push(path.clone());
            }
            batch.put(ROOT_HASH_KEY.to_vec(), new_root_hash.to_vec());
            let node_writes = written_paths.len() as u64;
            self.store.write_batch(batch)?;
            self.metrics.record_node_writes(node_writes);

            state.root = overlay.root().clone();
            state.root_hash = new_root_hash;
            written_paths.sort();
            {
                let mut cache = state.cache.lock().expect("cache lock poisoned");
                cache.purge_tombstones(&written_paths);
                for (path, entry) in overlay.entries() {
                    match entry {
                        Some(node) => cache.put(path.clone(), node.clone()),
                        None => cache.put_absent(path.clone()),
                    }
                }
            }
            state.history.record(new_root_hash, changes);
            tracing::debug!(
                old_root = %base_root_hash,
                new_root = %new_root_hash,
                "committed view changes"
            );
        }

        // Registry bookkeeping happens even for empty commits: committing a
        // tracked view always invalidates its tracked siblings. Committing an
        // untracked view leaves tracked siblings alone; their stale base is
        // caught by the root comparison when they themselves commit.
        let first = chain.first().expect("chain is non-empty");
        let first_is_tracked = state.child_views.iter().any(|weak| {
            weak.upgrade()
                .map_or(false, |child| Arc::ptr_eq(&child, first))
        });
        if first_is_tracked {
            Self::invalidate_db_children_except(&mut state, chain.first());
        }
        for pair in chain.windows(2) {
            pair[0].invalidate_children_except(Some(&pair[1]));
        }
        for view in chain {
            view.committed.store(true, Ordering::Release);
        }

        // The committed view's surviving children now sit directly on the db.
        let last = chain.last().expect("chain is non-empty");
        let grandchildren =
            std::mem::take(&mut *last.children.lock().expect("children lock poisoned"));
        for weak in grandchildren {
            if let Some(child) = weak.upgrade() {
                *child.parent.write().expect("parent lock poisoned") = ParentTrie::Db;
                state.child_views.push(Arc::downgrade(&child));
            }
        }

        self.metrics.record_commit();
        Ok(())
    }

    /// Apply a change set directly while holding the write lock; used by
    /// rebuild, where exclusivity for the whole operation is the point.
    fn apply_changes_locked(
        &self,
        state: &mut DbState<S>,
        changes: ChangeSet,
        cancel: &CancelToken,
    ) -> Result<(), MerkleError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut overlay = NodeOverlay::new(state.root.clone());
        {
            let state_ref: &DbState<S> = state;
            let mut resolver = |path: &Path| self.get_node_in(state_ref, path, cancel);
            for (path, (_, after)) in changes.iter() {
                match after {
                    Some(value) => overlay.insert(path, value.clone(), &mut resolver)?,
                    None => {
                        overlay.remove(path, &mut resolver)?;
                    }
                }
            }
        }
        let new_root_hash = overlay.compute_root_hash();

        let mut batch = WriteBatch::new();
        let mut written_paths = Vec::new();
        for (path, entry) in overlay.entries() {
            match entry {
                Some(node) => batch.put(node_store_key(path), node.encode()),
                None => batch.delete(node_store_key(path)),
            }
            written_paths.push(path.clone());
        }
        batch.put(ROOT_HASH_KEY.to_vec(), new_root_hash.to_vec());
        self.store.write_batch(batch)?;
        self.metrics.record_node_writes(written_paths.len() as u64);

        state.root = overlay.root().clone();
        state.root_hash = new_root_hash;
        written_paths.sort();
        {
            let mut cache = state.cache.lock().expect("cache lock poisoned");
            cache.purge_tombstones(&written_paths);
            for (path, entry) in overlay.entries() {
                match entry {
                    Some(node) => cache.put(path.clone(), node.clone()),
                    None => cache.put_absent(path.clone()),
                }
            }
        }
        // History is deliberately not touched here: the intermediate rebuild
        // states are never observable, and the final root equals the root the
        // existing history entries already describe.
        Ok(())
    }

    fn invalidate_db_children_except(
        state: &mut DbState<S>,
        keep: Option<&Arc<TrieView<S>>>,
    ) {
        let mut kept = Vec::new();
        for weak in state.child_views.drain(..) {
            if let Some(child) = weak.upgrade() {
                if keep.is_some_and(|k| Arc::ptr_eq(k, &child)) {
                    kept.push(Arc::downgrade(&child));
                } else {
                    child.invalidate();
                }
            }
        }
        state.child_views = kept;
    }
}

impl<S: ByteStore> std::fmt::Debug for DbInner<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbInner")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// A set of writes staged against the database and committed together as a
/// single view.
#[derive(Debug)]
pub struct Batch<'a, S: ByteStore> {
    db: &'a MerkleDb<S>,
    ops: Vec<BatchOp>,
}

impl<S: ByteStore> Batch<'_, S> {
    /// Queue an insert or overwrite.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(BatchOp::put(key, value));
    }

    /// Queue a deletion.
    pub fn delete(&mut self, key: &[u8]) {
        self.ops.push(BatchOp::delete(key));
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch holds no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Commit all queued operations atomically.
    pub fn write(self) -> Result<(), MerkleError> {
        self.db
            .new_untracked_view(self.ops)?
            .commit_to_db(&CancelToken::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_store::MemStore;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use sha2::{Digest, Sha256};

    fn basic_db() -> MerkleDb<MemStore> {
        MerkleDb::new(MemStore::new(), Config::default()).unwrap()
    }

    fn cancel() -> CancelToken {
        CancelToken::new()
    }

    fn hash_bytes(input: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(input);
        hasher.finalize().to_vec()
    }

    #[test]
    fn test_insert_overwrite_delete() {
        let cancel = cancel();
        let db = basic_db();

        assert_eq!(db.get(b"key", &cancel), Err(MerkleError::NotFound));

        db.put(b"key", b"value0").unwrap();
        assert_eq!(db.get(b"key", &cancel).unwrap(), b"value0");

        db.put(b"key", b"value1").unwrap();
        assert_eq!(db.get(b"key", &cancel).unwrap(), b"value1");

        db.delete(b"key").unwrap();
        assert_eq!(db.get(b"key", &cancel), Err(MerkleError::NotFound));
        assert_eq!(db.get_merkle_root(&cancel).unwrap(), EMPTY_ROOT_HASH);
    }

    #[test]
    fn test_delete_missing_key_succeeds() {
        let db = basic_db();
        db.delete(b"key").unwrap();
    }

    #[test]
    fn test_empty_value_is_storable() {
        let cancel = cancel();
        let db = basic_db();
        db.put(b"key0", b"").unwrap();
        assert_eq!(db.get(b"key0", &cancel).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_get_safety() {
        let cancel = cancel();
        let db = basic_db();
        db.put(&[0], &[0, 1, 2]).unwrap();

        let mut value = db.get(&[0], &cancel).unwrap();
        value[0] = 1;

        // The edit must not leak into the stored value.
        assert_eq!(db.get(&[0], &cancel).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_get_values_safety() {
        let cancel = cancel();
        let db = basic_db();
        db.put(&[0], &[0, 1, 2]).unwrap();

        let mut values = db.get_values(&[vec![0]], &cancel);
        assert_eq!(values.len(), 1);
        values[0].as_mut().unwrap()[0] = 1;

        let values = db.get_values(&[vec![0]], &cancel);
        assert_eq!(values[0].as_ref().unwrap(), &vec![0, 1, 2]);
    }

    #[test]
    fn test_get_values_mixed_results() {
        let cancel = cancel();
        let db = basic_db();
        for i in 0u8..3 {
            db.put(&[i], &[i]).unwrap();
        }

        let keys = vec![vec![0], vec![1], vec![2], vec![10]];
        let results = db.get_values(&keys, &cancel);
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap(), &vec![0]);
        assert_eq!(results[1].as_ref().unwrap(), &vec![1]);
        assert_eq!(results[2].as_ref().unwrap(), &vec![2]);
        assert_eq!(results[3], Err(MerkleError::NotFound));
    }

    #[test]
    fn test_load_root_from_store() {
        let cancel = cancel();
        let store = MemStore::new();
        let root = {
            let db = MerkleDb::new(store, Config::default()).unwrap();
            let ops = (0..100u32)
                .map(|i| {
                    let key = i.to_string().into_bytes();
                    let value = hash_bytes(&key);
                    BatchOp { key, value: Some(value) }
                })
                .collect();
            let view = db.new_view(ops).unwrap();
            view.commit_to_db(&cancel).unwrap();
            drop(view);
            let root = db.get_merkle_root(&cancel).unwrap();
            db.close().unwrap();

            // Reclaim the store for reopening.
            let MerkleDb { inner } = db;
            let inner = Arc::try_unwrap(inner).ok().expect("no views alive");
            inner.store.reopen();
            (root, inner.store)
        };
        let (expected_root, store) = root;

        let db = MerkleDb::new(store, Config::default()).unwrap();
        assert_eq!(db.get_merkle_root(&cancel).unwrap(), expected_root);
        assert_eq!(db.get(b"42", &cancel).unwrap(), hash_bytes(b"42"));
    }

    #[test]
    fn test_rebuild_reproduces_root() {
        let cancel = cancel();
        let db = basic_db();
        let ops = (0..500u32)
            .map(|i| {
                let key = i.to_string().into_bytes();
                let value = hash_bytes(&key);
                BatchOp { key, value: Some(value) }
            })
            .collect();
        db.new_view(ops).unwrap().commit_to_db(&cancel).unwrap();
        let root = db.get_merkle_root(&cancel).unwrap();

        db.rebuild(&cancel).unwrap();

        assert_eq!(db.get_merkle_root(&cancel).unwrap(), root);
        assert_eq!(db.get(b"123", &cancel).unwrap(), hash_bytes(b"123"));
    }

    #[test]
    fn test_failed_batch_commit_on_closed_store() {
        let store = MemStore::new();
        let db = MerkleDb::new(store, Config::default()).unwrap();

        // Kill the underlying store out from under the database.
        {
            let inner: &DbInner<MemStore> = &db.inner;
            inner.store.close().unwrap();
        }

        let mut batch = db.new_batch();
        batch.put(b"key1", b"1");
        batch.put(b"key2", b"2");
        batch.put(b"key3", b"3");
        assert_eq!(batch.write(), Err(MerkleError::Closed));

        // The in-memory trie was not touched by the failed commit.
        assert_eq!(
            db.inner.state.read().unwrap().root_hash,
            EMPTY_ROOT_HASH
        );
    }

    #[test]
    fn test_value_cache_serves_after_store_close() {
        let cancel = cancel();
        let db = basic_db();

        let mut batch = db.new_batch();
        batch.put(b"key1", b"1");
        batch.put(b"key2", b"2");
        batch.write().unwrap();

        // Deleting key2 leaves a known-absent entry behind.
        let mut batch = db.new_batch();
        batch.delete(b"key2");
        batch.write().unwrap();

        db.inner.store.close().unwrap();

        // key1 is still served from the node cache.
        assert_eq!(db.get(b"key1", &cancel).unwrap(), b"1");
        // key2 resolves from the tombstone instead of reaching the store.
        assert_eq!(db.get(b"key2", &cancel), Err(MerkleError::NotFound));
        // A key the cache knows nothing about surfaces the closed store.
        assert_eq!(db.get(b"key9", &cancel), Err(MerkleError::Closed));
    }

    #[test]
    fn test_sibling_invalidation_on_commit() {
        let cancel = cancel();
        let db = basic_db();

        let view_a = db
            .new_view(vec![BatchOp::put(&[1u8][..], &[1u8][..])])
            .unwrap();
        let view_b = db.new_view(Vec::new()).unwrap();
        let view_c = db.new_view(Vec::new()).unwrap();

        assert!(!view_b.is_invalidated());
        assert!(!view_c.is_invalidated());

        view_a.commit_to_db(&cancel).unwrap();

        assert!(!view_a.is_invalidated());
        assert!(view_b.is_invalidated());
        assert!(view_c.is_invalidated());

        // Operations on the invalidated siblings now fail.
        assert_eq!(
            view_b.get_value(&[1], &cancel),
            Err(MerkleError::Invalidated)
        );
        assert_eq!(
            view_c.commit_to_db(&cancel),
            Err(MerkleError::Invalidated)
        );
        // The committed view keeps answering reads.
        assert_eq!(view_a.get_value(&[1], &cancel).unwrap(), vec![1]);
    }

    #[test]
    fn test_untracked_views_skip_registry() {
        let cancel = cancel();
        let db = basic_db();

        let tracked = db.new_view(Vec::new()).unwrap();
        let view = db
            .new_untracked_view(vec![BatchOp::put(&[1u8][..], &[1u8][..])])
            .unwrap();
        assert_eq!(db.tracked_view_count(), 1);

        view.commit_to_db(&cancel).unwrap();

        // Committing an untracked view does not invalidate tracked siblings.
        assert!(!tracked.is_invalidated());
        assert_eq!(db.tracked_view_count(), 1);

        // The tracked sibling stays usable and simply reads (and commits)
        // over the moved base.
        assert_eq!(tracked.get_value(&[1], &cancel).unwrap(), vec![1]);
        tracked.commit_to_db(&cancel).unwrap();
    }

    #[test]
    fn test_tracked_view_registry() {
        let cancel = cancel();
        let db = basic_db();

        let view = db
            .new_view(vec![BatchOp::put(&[1u8][..], &[1u8][..])])
            .unwrap();
        assert_eq!(db.tracked_view_count(), 1);

        view.commit_to_db(&cancel).unwrap();
        assert_eq!(db.tracked_view_count(), 1);
        assert!(!view.is_invalidated());
    }

    #[test]
    fn test_commit_view_atop_view() {
        let cancel = cancel();
        let db = basic_db();
        db.put(&[1], &[1]).unwrap();
        db.put(&[2], &[2]).unwrap();

        // view1 stages an insert and a delete; view3 sits on top of view1;
        // view2 is a sibling of view1.
        let view1 = db
            .new_view(vec![
                BatchOp::put(&[3u8][..], &[3u8][..]),
                BatchOp::delete(&[1u8][..]),
            ])
            .unwrap();
        let view1_root = view1.get_merkle_root(&cancel).unwrap();
        let view2 = db.new_view(Vec::new()).unwrap();
        let view3 = view1.new_view(Vec::new()).unwrap();

        view1.commit_to_db(&cancel).unwrap();

        assert_eq!(db.get(&[1], &cancel), Err(MerkleError::NotFound));
        assert_eq!(db.get(&[2], &cancel).unwrap(), vec![2]);
        assert_eq!(db.get(&[3], &cancel).unwrap(), vec![3]);
        assert_eq!(db.get_merkle_root(&cancel).unwrap(), view1_root);

        assert!(!view1.is_invalidated());
        assert!(view2.is_invalidated());
        assert!(!view3.is_invalidated());

        // view3 was re-parented onto the database and still reads through.
        assert_eq!(view3.get_value(&[3], &cancel).unwrap(), vec![3]);
        assert_eq!(db.tracked_view_count(), 2);
    }

    #[test]
    fn test_commit_chain_through_ancestors() {
        let cancel = cancel();
        let db = basic_db();

        let view1 = db
            .new_view(vec![BatchOp::put(&[1u8][..], &[1u8][..])])
            .unwrap();
        let view2 = view1
            .new_view(vec![
                BatchOp::put(&[2u8][..], &[2u8][..]),
                BatchOp::delete(&[1u8][..]),
            ])
            .unwrap();
        let expected = view2.get_merkle_root(&cancel).unwrap();

        // Committing the grandchild flattens the whole chain.
        view2.commit_to_db(&cancel).unwrap();
        assert_eq!(db.get_merkle_root(&cancel).unwrap(), expected);
        assert_eq!(db.get(&[1], &cancel), Err(MerkleError::NotFound));
        assert_eq!(db.get(&[2], &cancel).unwrap(), vec![2]);
        assert!(view1.is_committed());
        assert!(view2.is_committed());

        // A committed view cannot commit again.
        assert_eq!(view2.commit_to_db(&cancel), Err(MerkleError::Invalidated));
    }

    #[test]
    fn test_view_isolation_until_commit() {
        let cancel = cancel();
        let db = basic_db();
        db.put(b"base", b"0").unwrap();
        let base_root = db.get_merkle_root(&cancel).unwrap();

        let view = db
            .new_view(vec![BatchOp::put(&b"staged"[..], &b"1"[..])])
            .unwrap();
        assert_eq!(view.get_value(b"staged", &cancel).unwrap(), b"1");
        assert_ne!(view.get_merkle_root(&cancel).unwrap(), base_root);

        // Nothing is observable from the database until the commit.
        assert_eq!(db.get(b"staged", &cancel), Err(MerkleError::NotFound));
        assert_eq!(db.get_merkle_root(&cancel).unwrap(), base_root);

        view.commit_to_db(&cancel).unwrap();
        assert_eq!(db.get(b"staged", &cancel).unwrap(), b"1");
    }

    #[test]
    fn test_view_reads_fall_through_layers() {
        let cancel = cancel();
        let db = basic_db();
        db.put(b"a", b"db").unwrap();
        db.put(b"b", b"db").unwrap();

        let view1 = db
            .new_view(vec![BatchOp::put(&b"b"[..], &b"v1"[..])])
            .unwrap();
        let view2 = view1
            .new_view(vec![BatchOp::delete(&b"a"[..])])
            .unwrap();

        assert_eq!(view2.get_value(b"b", &cancel).unwrap(), b"v1");
        assert_eq!(view2.get_value(b"a", &cancel), Err(MerkleError::NotFound));
        assert_eq!(view1.get_value(b"a", &cancel).unwrap(), b"db");
    }

    #[test]
    fn test_random_insert_ordering_yields_same_root() {
        let cancel = cancel();
        let mut rng = StdRng::seed_from_u64(7);

        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..200u32)
            .map(|i| {
                let key = hash_bytes(&i.to_be_bytes());
                let value = vec![rng.gen::<u8>(); (i % 17 + 1) as usize];
                (key, value)
            })
            .collect();

        let mut reference_root = None;
        for _ in 0..3 {
            pairs.shuffle(&mut rng);
            let db = basic_db();
            for (key, value) in &pairs {
                db.put(key, value).unwrap();
            }
            let root = db.get_merkle_root(&cancel).unwrap();
            match reference_root {
                None => reference_root = Some(root),
                Some(expected) => assert_eq!(root, expected),
            }
        }
    }

    #[test]
    fn test_batched_and_single_commits_agree() {
        let cancel = cancel();
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..64u8)
            .map(|i| (vec![i / 16, i % 16], vec![i]))
            .collect();

        let single = basic_db();
        for (key, value) in &pairs {
            single.put(key, value).unwrap();
        }

        let batched = basic_db();
        let ops = pairs
            .iter()
            .map(|(key, value)| BatchOp {
                key: key.clone(),
                value: Some(value.clone()),
            })
            .collect();
        batched.new_view(ops).unwrap().commit_to_db(&cancel).unwrap();

        assert_eq!(
            single.get_merkle_root(&cancel).unwrap(),
            batched.get_merkle_root(&cancel).unwrap()
        );
    }

    #[test]
    fn test_random_operations_match_model() {
        let cancel = cancel();
        let mut rng = StdRng::seed_from_u64(42);
        let db = basic_db();
        let mut model: std::collections::BTreeMap<Vec<u8>, Vec<u8>> =
            std::collections::BTreeMap::new();

        for _ in 0..300 {
            let key = vec![rng.gen_range(0u8..20)];
            if rng.gen_bool(0.3) {
                db.delete(&key).unwrap();
                model.remove(&key);
            } else {
                let value = vec![rng.gen::<u8>()];
                db.put(&key, &value).unwrap();
                model.insert(key, value);
            }
        }

        for key in 0u8..20 {
            match model.get(&vec![key]) {
                Some(value) => assert_eq!(db.get(&[key], &cancel).unwrap(), *value),
                None => assert_eq!(db.get(&[key], &cancel), Err(MerkleError::NotFound)),
            }
        }

        // And the model contents reproduce the root from scratch.
        let fresh = basic_db();
        for (key, value) in &model {
            fresh.put(key, value).unwrap();
        }
        assert_eq!(
            fresh.get_merkle_root(&cancel).unwrap(),
            db.get_merkle_root(&cancel).unwrap()
        );
    }

    #[test]
    fn test_change_proof_between_recent_roots() {
        let cancel = cancel();
        let db = basic_db();

        db.put(b"key1", b"1").unwrap();
        let root1 = db.get_merkle_root(&cancel).unwrap();

        db.put(b"key2", b"2").unwrap();
        db.put(b"key1", b"1b").unwrap();
        db.delete(b"key1").unwrap();
        let root2 = db.get_merkle_root(&cancel).unwrap();

        let proof = db
            .get_change_proof(root1, root2, None, None, 100, &cancel)
            .unwrap();
        assert_eq!(
            proof.key_changes,
            vec![
                (b"key1".to_vec(), None),
                (b"key2".to_vec(), Some(b"2".to_vec())),
            ]
        );

        // Rewind a fresh database to the start state and verify against it.
        let fresh = basic_db();
        fresh.put(b"key1", b"1").unwrap();
        fresh
            .verify_change_proof(&proof, None, None, root2, &cancel)
            .unwrap();

        // Same roots are rejected outright.
        assert_eq!(
            db.get_change_proof(root1, root1, None, None, 100, &cancel),
            Err(MerkleError::SameRoot)
        );
    }

    #[test]
    fn test_change_proofs_verify_across_history() {
        let cancel = cancel();
        let db = basic_db();

        let mut roots = vec![db.get_merkle_root(&cancel).unwrap()];
        for i in 0u8..6 {
            let mut batch = db.new_batch();
            batch.put(&[i], &[i]);
            if i > 2 {
                batch.delete(&[i - 3]);
            }
            batch.write().unwrap();
            roots.push(db.get_merkle_root(&cancel).unwrap());
        }

        for i in 0..roots.len() {
            for j in (i + 1)..roots.len() {
                let proof = db
                    .get_change_proof(roots[i], roots[j], None, None, 100, &cancel)
                    .unwrap();
                assert!(
                    !proof.key_changes.is_empty(),
                    "roots {i}->{j} differ, changes expected"
                );
            }
        }
    }

    #[test]
    fn test_change_proof_requires_retained_roots() {
        let cancel = cancel();
        let db = MerkleDb::new(
            MemStore::new(),
            Config {
                history_length: 2,
                ..Config::default()
            },
        )
        .unwrap();

        let root0 = db.get_merkle_root(&cancel).unwrap();
        db.put(b"a", b"1").unwrap();
        db.put(b"b", b"2").unwrap();
        let root2 = db.get_merkle_root(&cancel).unwrap();

        // root0 fell out of the two-entry ring.
        assert_eq!(
            db.get_change_proof(root0, root2, None, None, 100, &cancel),
            Err(MerkleError::InsufficientHistory)
        );
    }

    #[test]
    fn test_range_proof_at_historical_root() {
        let cancel = cancel();
        let db = basic_db();

        db.put(b"key1", b"1").unwrap();
        db.put(b"key2", b"2").unwrap();
        let old_root = db.get_merkle_root(&cancel).unwrap();

        db.put(b"key2", b"other").unwrap();
        db.put(b"key3", b"3").unwrap();

        let proof = db
            .get_range_proof_at_root(old_root, None, None, 100, &cancel)
            .unwrap();
        proof.verify(None, None, old_root).unwrap();
        assert_eq!(
            proof.key_values,
            vec![
                (b"key1".to_vec(), b"1".to_vec()),
                (b"key2".to_vec(), b"2".to_vec()),
            ]
        );

        let unknown = TrieHash([9; 32]);
        assert_eq!(
            db.get_range_proof_at_root(unknown, None, None, 100, &cancel),
            Err(MerkleError::InsufficientHistory)
        );
    }

    #[test]
    fn test_commit_range_proof_to_empty_db() {
        let cancel = cancel();
        let db = basic_db();
        let mut batch = db.new_batch();
        batch.put(b"key1", b"1");
        batch.put(b"key2", b"2");
        batch.put(b"key3", b"3");
        batch.write().unwrap();

        let proof = db
            .get_range_proof(Some(b"key1"), Some(b"key3"), 10, &cancel)
            .unwrap();

        let fresh = basic_db();
        fresh.commit_range_proof(&proof, &cancel).unwrap();

        assert_eq!(fresh.get(b"key2", &cancel).unwrap(), b"2");
        assert_eq!(
            fresh.get_merkle_root(&cancel).unwrap(),
            db.get_merkle_root(&cancel).unwrap()
        );
    }

    #[test]
    fn test_commit_range_proof_to_filled_db() {
        let cancel = cancel();
        let db = basic_db();
        let mut batch = db.new_batch();
        batch.put(b"key1", b"1");
        batch.put(b"key2", b"2");
        batch.put(b"key3", b"3");
        batch.write().unwrap();

        let proof = db
            .get_range_proof(Some(b"key1"), Some(b"key3"), 10, &cancel)
            .unwrap();

        let fresh = basic_db();
        let mut batch = fresh.new_batch();
        batch.put(b"key1", b"3");
        batch.put(b"key2", b"4");
        batch.put(b"key3", b"5");
        batch.put(b"key25", b"5");
        batch.write().unwrap();

        fresh.commit_range_proof(&proof, &cancel).unwrap();

        assert_eq!(fresh.get(b"key2", &cancel).unwrap(), b"2");
        assert_eq!(fresh.get(b"key25", &cancel), Err(MerkleError::NotFound));
        assert_eq!(
            fresh.get_merkle_root(&cancel).unwrap(),
            db.get_merkle_root(&cancel).unwrap()
        );
    }

    #[test]
    fn test_close_rejects_further_operations() {
        let cancel = cancel();
        let db = basic_db();
        db.put(b"key", b"value").unwrap();
        db.health_check(&cancel).unwrap();

        db.close().unwrap();

        assert_eq!(db.get(b"key", &cancel), Err(MerkleError::Closed));
        assert_eq!(db.put(b"key", b"value"), Err(MerkleError::Closed));
        assert_eq!(db.health_check(&cancel), Err(MerkleError::Closed));
        assert_eq!(db.get_merkle_root(&cancel), Err(MerkleError::Closed));
    }

    #[test]
    fn test_cancellation_fails_reads() {
        let db = basic_db();
        db.put(b"key", b"value").unwrap();

        let token = CancelToken::new();
        token.cancel();
        assert_eq!(db.get(b"key", &token), Err(MerkleError::Cancelled));
        assert_eq!(db.get_merkle_root(&token), Err(MerkleError::Cancelled));
        assert_eq!(db.health_check(&token), Err(MerkleError::Cancelled));
        assert_eq!(
            db.get_range_proof(None, None, 10, &token),
            Err(MerkleError::Cancelled)
        );
    }

    #[test]
    fn test_metrics_observe_activity() {
        use std::sync::atomic::Ordering;

        let cancel = cancel();
        let db = basic_db();
        db.put(b"key", b"value").unwrap();
        db.get(b"key", &cancel).unwrap();
        db.get_proof(b"key", &cancel).unwrap();

        let metrics = db.metrics();
        assert!(metrics.view_commits.load(Ordering::Relaxed) >= 1);
        assert!(metrics.node_writes.load(Ordering::Relaxed) >= 1);
        assert!(metrics.proofs_generated.load(Ordering::Relaxed) >= 1);
    }
}
