use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy)]
pub struct BTreeStatsSnapshot {
    /// Number of leaf searches performed.
    pub leaf_searches: u64,
    /// Number of node searches performed.
    pub node_searches: u64,
    /// Number of leaf splits performed.
    pub leaf_splits: u64,
    /// Number of node splits performed.
    pub node_splits: u64,
    /// Number of leaf merges performed.
    pub leaf_merges: u64,
    /// Number of root collapses (tree height reductions).
    pub root_collapses: u64,
    /// Number of dirty pages flushed by `save`.
    pub pages_flushed: u64,
    /// Number of pages ingested by `transfer_from`.
    pub pages_ingested: u64,
}

/// Thread-safe statistics tracking for tree operations.
#[derive(Default)]
pub struct BTreeStats {
    leaf_searches: AtomicU64,
    node_searches: AtomicU64,
    leaf_splits: AtomicU64,
    node_splits: AtomicU64,
    leaf_merges: AtomicU64,
    root_collapses: AtomicU64,
    pages_flushed: AtomicU64,
    pages_ingested: AtomicU64,
}

impl BTreeStats {
    pub(crate) fn inc_leaf_searches(&self) {
        self.leaf_searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_node_searches(&self) {
        self.node_searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_node_splits(&self) {
        self.node_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_merges(&self) {
        self.leaf_merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_collapses(&self) {
        self.root_collapses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_pages_flushed(&self, count: u64) {
        self.pages_flushed.fetch_add(count, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_pages_ingested(&self, count: u64) {
        self.pages_ingested
            .fetch_add(count, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            leaf_searches: self.leaf_searches.load(AtomicOrdering::Relaxed),
            node_searches: self.node_searches.load(AtomicOrdering::Relaxed),
            leaf_splits: self.leaf_splits.load(AtomicOrdering::Relaxed),
            node_splits: self.node_splits.load(AtomicOrdering::Relaxed),
            leaf_merges: self.leaf_merges.load(AtomicOrdering::Relaxed),
            root_collapses: self.root_collapses.load(AtomicOrdering::Relaxed),
            pages_flushed: self.pages_flushed.load(AtomicOrdering::Relaxed),
            pages_ingested: self.pages_ingested.load(AtomicOrdering::Relaxed),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "vesper_btree::stats",
            leaf_searches = snapshot.leaf_searches,
            node_searches = snapshot.node_searches,
            leaf_splits = snapshot.leaf_splits,
            node_splits = snapshot.node_splits,
            leaf_merges = snapshot.leaf_merges,
            root_collapses = snapshot.root_collapses,
            pages_flushed = snapshot.pages_flushed,
            pages_ingested = snapshot.pages_ingested,
            "btree stats snapshot"
        );
    }
}
