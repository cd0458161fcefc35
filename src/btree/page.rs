//! Page structure and split primitives.
//!
//! A page is the copy-on-write unit of storage: once published under a
//! root it is never mutated in place, only superseded by a rebuilt copy
//! relinked through a fresh parent chain. The dirty flag is bookkeeping
//! metadata outside that discipline and may flip on a shared page.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use super::arena::PageId;
use super::codecs::KeyCodec;
use super::replication::HostSet;

/// Approximate in-memory footprint of an empty page.
const PAGE_BASE_MEMORY: usize = 128;
/// Per-entry bookkeeping overhead in a leaf.
const LEAF_ENTRY_OVERHEAD: usize = 16;
/// Per-child bookkeeping overhead in a node.
const NODE_CHILD_OVERHEAD: usize = 48;

/// Encoded key/value pair stored in a leaf.
pub type LeafEntry = (Vec<u8>, Vec<u8>);

/// Tagged page payload: a leaf of ordered entries or an internal node of
/// separators and child references, with `children.len() ==
/// separators.len() + 1`.
pub enum PageData {
    /// Ordered sequence of encoded key/value pairs, strictly increasing.
    Leaf {
        /// The entries, strictly increasing by encoded key.
        entries: Vec<LeafEntry>,
    },
    /// Separator keys and child references; all keys under `children[i]`
    /// sort before `separators[i]`, which sorts at or before all keys
    /// under `children[i + 1]`.
    Node {
        /// Separator keys between adjacent children.
        separators: Vec<Vec<u8>>,
        /// Child references, one more than `separators`.
        children: Vec<PageRef>,
    },
}

/// The copy-on-write unit of storage.
pub struct Page {
    pub(crate) data: PageData,
    pub(crate) hosts: HostSet,
    dirty: AtomicBool,
}

impl Page {
    /// A fresh empty leaf, as installed at map open and by `clear`.
    pub(crate) fn empty_leaf() -> Self {
        Self::leaf(Vec::new(), HostSet::new())
    }

    pub(crate) fn leaf(entries: Vec<LeafEntry>, hosts: HostSet) -> Self {
        Self {
            data: PageData::Leaf { entries },
            hosts,
            dirty: AtomicBool::new(true),
        }
    }

    pub(crate) fn node(separators: Vec<Vec<u8>>, children: Vec<PageRef>, hosts: HostSet) -> Self {
        debug_assert_eq!(children.len(), separators.len() + 1);
        Self {
            data: PageData::Node {
                separators,
                children,
            },
            hosts,
            dirty: AtomicBool::new(true),
        }
    }

    /// Whether this page is a leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self.data, PageData::Leaf { .. })
    }

    /// Replication host set attached to this page.
    pub fn hosts(&self) -> &HostSet {
        &self.hosts
    }

    /// Number of entries (leaf) or children (node).
    pub fn len(&self) -> usize {
        match &self.data {
            PageData::Leaf { entries } => entries.len(),
            PageData::Node { children, .. } => children.len(),
        }
    }

    /// Whether the page holds no entries or children.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn mark_clean(&self) {
        self.dirty.store(false, AtomicOrdering::Release);
    }

    /// Approximate in-memory size in bytes, compared against the
    /// configured split size.
    pub(crate) fn memory(&self) -> usize {
        match &self.data {
            PageData::Leaf { entries } => leaf_memory(entries),
            PageData::Node {
                separators,
                children,
            } => node_memory(separators, children.len()),
        }
    }

    /// Occupied fraction of the configured split size.
    pub(crate) fn fill_rate(&self, split_size: usize) -> f32 {
        if split_size == 0 {
            return 1.0;
        }
        self.memory() as f32 / split_size as f32
    }

    pub(crate) fn leaf_entries(&self) -> &[LeafEntry] {
        match &self.data {
            PageData::Leaf { entries } => entries,
            PageData::Node { .. } => &[],
        }
    }

    pub(crate) fn node_children(&self) -> &[PageRef] {
        match &self.data {
            PageData::Node { children, .. } => children,
            PageData::Leaf { .. } => &[],
        }
    }

    pub(crate) fn node_separators(&self) -> &[Vec<u8>] {
        match &self.data {
            PageData::Node { separators, .. } => separators,
            PageData::Leaf { .. } => &[],
        }
    }

    /// Smallest key stored under this page, if any.
    pub(crate) fn first_key(&self) -> Option<&[u8]> {
        match &self.data {
            PageData::Leaf { entries } => entries.first().map(|(k, _)| k.as_slice()),
            PageData::Node { children, .. } => {
                children.first().and_then(|child| child.page.first_key())
            }
        }
    }

    /// Largest key stored under this page, if any.
    pub(crate) fn last_key(&self) -> Option<&[u8]> {
        match &self.data {
            PageData::Leaf { entries } => entries.last().map(|(k, _)| k.as_slice()),
            PageData::Node { children, .. } => {
                children.last().and_then(|child| child.page.last_key())
            }
        }
    }
}

/// Child handle held by a node: the child's arena identity, the
/// materialized page, a cached copy of the child's replication host set,
/// and the lower-bound separator for the child's subtree (`None` for a
/// leftmost child). The cached pieces let range routing reason about a
/// child without walking into it.
#[derive(Clone)]
pub struct PageRef {
    pub(crate) id: PageId,
    pub(crate) page: Arc<Page>,
    pub(crate) hosts: HostSet,
    pub(crate) lower_bound: Option<Vec<u8>>,
}

impl PageRef {
    pub(crate) fn new(
        id: PageId,
        page: Arc<Page>,
        lower_bound: Option<Vec<u8>>,
    ) -> Self {
        let hosts = page.hosts.clone();
        Self {
            id,
            page,
            hosts,
            lower_bound,
        }
    }

    /// Arena identity of the child.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Cached replication host set of the child.
    pub fn hosts(&self) -> &HostSet {
        &self.hosts
    }
}

/// Approximate in-memory size of a leaf with `entries`.
pub(crate) fn leaf_memory(entries: &[LeafEntry]) -> usize {
    PAGE_BASE_MEMORY
        + entries
            .iter()
            .map(|(k, v)| k.len() + v.len() + LEAF_ENTRY_OVERHEAD)
            .sum::<usize>()
}

/// Approximate in-memory size of a node with the given shape.
pub(crate) fn node_memory(separators: &[Vec<u8>], child_count: usize) -> usize {
    PAGE_BASE_MEMORY
        + separators.iter().map(Vec::len).sum::<usize>()
        + child_count * NODE_CHILD_OVERHEAD
}

/// Index of the child whose subtree covers `key`: the number of
/// separators at or below it.
pub(crate) fn child_index<K: KeyCodec>(separators: &[Vec<u8>], key: &[u8]) -> usize {
    separators.partition_point(|sep| K::compare_encoded(sep, key) != Ordering::Greater)
}

/// Splits leaf entries at the median. The separator is the first key of
/// the right half.
pub(crate) fn split_leaf_entries(
    mut entries: Vec<LeafEntry>,
) -> (Vec<LeafEntry>, Vec<u8>, Vec<LeafEntry>) {
    debug_assert!(entries.len() >= 2);
    let mid = entries.len() / 2;
    let right = entries.split_off(mid);
    let separator = right[0].0.clone();
    (entries, separator, right)
}

/// Splits a node's children at the median boundary, promoting the
/// separator between the halves.
pub(crate) fn split_node_children(
    mut separators: Vec<Vec<u8>>,
    mut children: Vec<PageRef>,
) -> (
    (Vec<Vec<u8>>, Vec<PageRef>),
    Vec<u8>,
    (Vec<Vec<u8>>, Vec<PageRef>),
) {
    debug_assert!(children.len() >= 2);
    let mid = children.len() / 2;
    let right_children = children.split_off(mid);
    let mut right_separators = separators.split_off(mid - 1);
    let promoted = right_separators.remove(0);
    (
        (separators, children),
        promoted,
        (right_separators, right_children),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: u8) -> LeafEntry {
        (vec![key], vec![key, key])
    }

    #[test]
    fn leaf_split_separator_is_first_right_key() {
        let entries = vec![entry(1), entry(2), entry(3), entry(4), entry(5)];
        let (left, separator, right) = split_leaf_entries(entries);
        assert_eq!(left.len(), 2);
        assert_eq!(right.len(), 3);
        assert_eq!(separator, vec![3]);
        assert_eq!(right[0].0, vec![3]);
    }

    #[test]
    fn node_split_promotes_median_separator() {
        let arena = crate::btree::arena::PageArena::new();
        let mut children = Vec::new();
        for _ in 0..4 {
            let (id, page) = arena.allocate(Page::empty_leaf());
            children.push(PageRef::new(id, page, None));
        }
        let separators = vec![vec![10], vec![20], vec![30]];
        let ((left_seps, left_children), promoted, (right_seps, right_children)) =
            split_node_children(separators, children);
        assert_eq!(promoted, vec![20]);
        assert_eq!(left_children.len(), 2);
        assert_eq!(left_seps, vec![vec![10]]);
        assert_eq!(right_children.len(), 2);
        assert_eq!(right_seps, vec![vec![30]]);
    }

    #[test]
    fn memory_grows_with_entries() {
        let empty = Page::empty_leaf();
        let full = Page::leaf(vec![entry(1), entry(2)], HostSet::new());
        assert!(full.memory() > empty.memory());
        assert!(full.fill_rate(1024) > 0.0);
    }
}
