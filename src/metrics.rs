//! Operation counters for the trie database.
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracking database activity.
///
/// All counters are relaxed atomics updated on the hot path; readers obtain
/// the handle via `MerkleDb::metrics()` and scrape whenever they like. This is
/// the crate's realization of the opaque metrics-registry configuration knob.
#[derive(Debug, Default)]
pub struct TrieMetrics {
    /// Nodes fetched from the byte store.
    pub node_reads: AtomicU64,
    /// Nodes written to the byte store.
    pub node_writes: AtomicU64,
    /// Node lookups answered by the cache, including tombstone hits.
    pub cache_hits: AtomicU64,
    /// Node lookups that fell through to the byte store.
    pub cache_misses: AtomicU64,
    /// Views successfully committed into the database.
    pub view_commits: AtomicU64,
    /// Proofs generated (existence, range, and change).
    pub proofs_generated: AtomicU64,
}

impl TrieMetrics {
    pub(crate) fn record_node_read(&self) {
        self.node_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_node_writes(&self, count: u64) {
        self.node_writes.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.view_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_proof(&self) {
        self.proofs_generated.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = TrieMetrics::default();
        metrics.record_node_read();
        metrics.record_node_writes(3);
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_commit();
        metrics.record_proof();

        assert_eq!(metrics.node_reads.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.node_writes.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.cache_hits.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.cache_misses.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.view_commits.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.proofs_generated.load(Ordering::Relaxed), 1);
    }
}
