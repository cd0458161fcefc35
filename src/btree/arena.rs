//! Page table: owns the live page set and allocates page identities.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::page::Page;

/// Identity of a page in the arena. Identifiers are allocated
/// monotonically and never reused; a parent's reference to a child page
/// carries one of these as a non-owning lookup key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

/// In-memory page table mapping [`PageId`] to the owning `Arc<Page>`.
///
/// Copy-on-write mutations allocate fresh entries for every rebuilt page
/// and unlink the superseded ones after the root swap; outstanding `Arc`
/// clones held by cursors keep unlinked pages alive until dropped.
pub(crate) struct PageArena {
    pages: RwLock<FxHashMap<PageId, Arc<Page>>>,
    next_id: AtomicU64,
}

impl PageArena {
    pub(crate) fn new() -> Self {
        Self {
            pages: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Moves `page` into the arena under a freshly allocated id.
    pub(crate) fn allocate(&self, page: Page) -> (PageId, Arc<Page>) {
        let id = PageId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        let page = Arc::new(page);
        self.pages.write().insert(id, Arc::clone(&page));
        (id, page)
    }

    /// Whether a page is still linked in the table.
    #[cfg(test)]
    pub(crate) fn is_live(&self, id: PageId) -> bool {
        self.pages.read().contains_key(&id)
    }

    /// Unlinks superseded pages. Ids are never reused.
    pub(crate) fn remove(&self, ids: &[PageId]) {
        if ids.is_empty() {
            return;
        }
        let mut pages = self.pages.write();
        for id in ids {
            pages.remove(id);
        }
    }

    /// Unlinks every page except those in `keep`; used by `clear`.
    pub(crate) fn retain_only(&self, keep: &[PageId]) {
        let mut pages = self.pages.write();
        pages.retain(|id, _| keep.contains(id));
    }

    /// Number of live pages.
    pub(crate) fn len(&self) -> usize {
        self.pages.read().len()
    }
}
