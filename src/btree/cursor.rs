//! Forward-only cursor over a copy-on-write snapshot of the tree.

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::Result;

use super::codecs::{KeyCodec, ValCodec};
use super::page::{child_index, LeafEntry, Page};

/// Forward-only, single-pass cursor yielding entries in ascending key
/// order. Not restartable: open a new cursor to rescan.
///
/// Pages the cursor has entered are pinned, so it observes a consistent,
/// unmutated view of every subtree already visited; subtrees it has not
/// reached yet may reflect concurrent writes.
pub struct Cursor<K: KeyCodec, V: ValCodec> {
    source: Source,
    from: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
    dedup: bool,
    peeked: Option<LeafEntry>,
    _marker: PhantomData<(K, V)>,
}

enum Source {
    Tree(TreeWalk),
    Pages(PageList),
}

/// In-order descent through the live tree, pinning the entered path.
struct TreeWalk {
    /// Node frames: the page and the index of the next child to visit.
    stack: Vec<(Arc<Page>, usize)>,
    /// Current leaf and the index of the next entry to yield.
    leaf: Option<(Arc<Page>, usize)>,
}

impl TreeWalk {
    fn new<K: KeyCodec>(root: Arc<Page>, from: Option<&[u8]>) -> Self {
        let mut walk = Self {
            stack: Vec::new(),
            leaf: None,
        };
        let mut page = root;
        loop {
            if page.is_leaf() {
                let start = from.map_or(0, |key| {
                    page.leaf_entries()
                        .partition_point(|(k, _)| K::compare_encoded(k, key) == Ordering::Less)
                });
                walk.leaf = Some((page, start));
                return walk;
            }
            let idx = from.map_or(0, |key| child_index::<K>(page.node_separators(), key));
            let child = Arc::clone(&page.node_children()[idx].page);
            walk.stack.push((page, idx + 1));
            page = child;
        }
    }

    fn pull(&mut self) -> Option<LeafEntry> {
        loop {
            if let Some((leaf, idx)) = self.leaf.as_mut() {
                let entries = leaf.leaf_entries();
                if *idx < entries.len() {
                    let entry = entries[*idx].clone();
                    *idx += 1;
                    return Some(entry);
                }
                self.leaf = None;
            }
            let next = self.next_leaf()?;
            self.leaf = Some((next, 0));
        }
    }

    fn next_leaf(&mut self) -> Option<Arc<Page>> {
        loop {
            let (node, idx) = self.stack.last_mut()?;
            let children = node.node_children();
            if *idx >= children.len() {
                self.stack.pop();
                continue;
            }
            let mut current = Arc::clone(&children[*idx].page);
            *idx += 1;
            loop {
                if current.is_leaf() {
                    return Some(current);
                }
                let first = Arc::clone(&current.node_children()[0].page);
                self.stack.push((current, 1));
                current = first;
            }
        }
    }
}

/// Pre-resolved leaf list for a page-key-restricted scan, already in key
/// order and deduplicated by page identity.
struct PageList {
    leaves: Vec<Arc<Page>>,
    page: usize,
    entry: usize,
}

impl PageList {
    fn pull(&mut self) -> Option<LeafEntry> {
        loop {
            let leaf = self.leaves.get(self.page)?;
            let entries = leaf.leaf_entries();
            if self.entry < entries.len() {
                let entry = entries[self.entry].clone();
                self.entry += 1;
                return Some(entry);
            }
            self.page += 1;
            self.entry = 0;
        }
    }
}

impl<K: KeyCodec, V: ValCodec> Cursor<K, V> {
    pub(crate) fn full(root: Arc<Page>, from: Option<Vec<u8>>) -> Self {
        let walk = TreeWalk::new::<K>(root, from.as_deref());
        Self {
            source: Source::Tree(walk),
            from,
            last_key: None,
            dedup: false,
            peeked: None,
            _marker: PhantomData,
        }
    }

    pub(crate) fn over_pages(leaves: Vec<Arc<Page>>, from: Option<Vec<u8>>) -> Self {
        Self {
            source: Source::Pages(PageList {
                leaves,
                page: 0,
                entry: 0,
            }),
            from,
            last_key: None,
            dedup: true,
            peeked: None,
            _marker: PhantomData,
        }
    }

    /// Whether another entry is available. Idempotent and observably
    /// side-effect-free; call it before every [`Cursor::next`].
    pub fn has_next(&mut self) -> bool {
        while self.peeked.is_none() {
            let entry = match &mut self.source {
                Source::Tree(walk) => walk.pull(),
                Source::Pages(list) => list.pull(),
            };
            let Some(entry) = entry else {
                return false;
            };
            if let Some(from) = &self.from {
                if K::compare_encoded(&entry.0, from) == Ordering::Less {
                    continue;
                }
            }
            if self.dedup {
                if let Some(last) = &self.last_key {
                    if K::compare_encoded(&entry.0, last) != Ordering::Greater {
                        continue;
                    }
                }
            }
            self.peeked = Some(entry);
        }
        true
    }

    /// Advances and returns the next entry.
    ///
    /// # Panics
    ///
    /// Panics when no further entry is available — advancing without a
    /// prior confirming [`Cursor::has_next`] is a programming error and
    /// fails fast rather than wrapping around.
    pub fn next(&mut self) -> Result<(K, V)> {
        if self.peeked.is_none() {
            self.has_next();
        }
        let Some((key, value)) = self.peeked.take() else {
            panic!("cursor advanced past the end; call has_next() first");
        };
        self.last_key = Some(key.clone());
        Ok((K::decode_key(&key)?, V::decode_val(&value)?))
    }
}
