use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::btree::arena::{PageArena, PageId};
use crate::btree::codecs::{KeyCodec, ValCodec};
use crate::btree::cursor::Cursor;
use crate::btree::page::{self, child_index, LeafEntry, Page, PageData, PageRef};
use crate::btree::page_key::PageKey;
use crate::btree::partition;
use crate::btree::replication::HostSet;
use crate::btree::stats::{BTreeStats, BTreeStatsSnapshot};
use crate::btree::transfer::{self, ByteChannel};
use crate::error::{Result, VesperError};
use crate::store::{MemoryPageStore, PageStore};

/// When under-filled pages are merged back together.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompactPolicy {
    /// Merge the edited leaf with an adjacent sibling during the removal
    /// that under-filled it.
    Immediate,
    /// Defer merging to a compaction sweep at the start of `save`.
    #[default]
    OnSave,
}

/// Configuration knobs for a map, threaded in by the storage builder.
#[derive(Clone)]
pub struct BTreeOptions {
    /// Size threshold in bytes above which a page must split.
    pub split_size: usize,
    /// Fill fraction below which a page becomes a merge candidate.
    pub min_fill_rate: f32,
    /// Whether persisted/transferred page payloads are compressed.
    pub compress: bool,
    /// Pass-through knob for stores that can rewrite page slots in
    /// place (see `FilePageStore`).
    pub reuse_space: bool,
    /// When under-filled pages are merged.
    pub compact_policy: CompactPolicy,
    /// Persistence target for `save`; defaults to an in-memory store.
    pub store: Option<Arc<dyn PageStore>>,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            split_size: 16 * 1024,
            min_fill_rate: 0.3,
            compress: false,
            reuse_space: false,
            compact_policy: CompactPolicy::default(),
            store: None,
        }
    }
}

/// The published root: page identity plus the materialized page. Swapped
/// wholesale under the root lock — the sole publication point.
#[derive(Clone)]
struct RootHolder {
    id: PageId,
    page: Arc<Page>,
}

/// One step of a write descent: the node traversed and the child slot
/// the descent took.
struct Frame {
    node: Arc<Page>,
    node_id: PageId,
    child_idx: usize,
}

/// Result of rebuilding one level of the path during a copy-on-write
/// mutation.
enum Replacement {
    One(Page),
    Split {
        left: Page,
        separator: Vec<u8>,
        right: Page,
    },
    Removed,
}

enum LeafOp<'a> {
    Put {
        key: &'a [u8],
        value: &'a [u8],
    },
    PutIfAbsent {
        key: &'a [u8],
        value: &'a [u8],
    },
    CasReplace {
        key: &'a [u8],
        expected: &'a [u8],
        value: &'a [u8],
    },
    Remove {
        key: &'a [u8],
    },
}

impl LeafOp<'_> {
    fn key(&self) -> &[u8] {
        match self {
            LeafOp::Put { key, .. }
            | LeafOp::PutIfAbsent { key, .. }
            | LeafOp::CasReplace { key, .. }
            | LeafOp::Remove { key } => key,
        }
    }
}

#[derive(Default)]
struct EditOutcome {
    previous: Option<Vec<u8>>,
    applied: bool,
    inserted: bool,
    removed: bool,
}

/// Ordered key-value map backed by a copy-on-write B-tree.
///
/// Structural mutations are serialized through a single per-map write
/// exclusion point; reads never block on it and run against published
/// copy-on-write snapshots.
pub struct BTreeMap<K: KeyCodec, V: ValCodec> {
    name: String,
    options: BTreeOptions,
    arena: PageArena,
    root: RwLock<RootHolder>,
    write_lock: Mutex<()>,
    closed: AtomicBool,
    size: AtomicU64,
    store: Arc<dyn PageStore>,
    host_table: RwLock<FxHashMap<PageKey, HostSet>>,
    stats: Arc<BTreeStats>,
    _marker: PhantomData<(K, V)>,
}

impl<K: KeyCodec, V: ValCodec> BTreeMap<K, V> {
    /// Opens a new map with the given name and options. The root starts
    /// as a single empty leaf.
    pub fn open(name: &str, mut options: BTreeOptions) -> Result<Self> {
        if options.split_size < 256 {
            return Err(VesperError::InvalidArgument("split size below 256 bytes"));
        }
        if !(0.0..1.0).contains(&options.min_fill_rate) {
            return Err(VesperError::InvalidArgument(
                "min fill rate outside [0, 1)",
            ));
        }
        let store = options
            .store
            .take()
            .unwrap_or_else(|| Arc::new(MemoryPageStore::new()));
        let arena = PageArena::new();
        let (id, root_page) = arena.allocate(Page::empty_leaf());
        tracing::debug!(
            target: "vesper_btree::open",
            name,
            split_size = options.split_size,
            "opened map"
        );
        Ok(Self {
            name: name.to_string(),
            options,
            arena,
            root: RwLock::new(RootHolder {
                id,
                page: root_page,
            }),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            size: AtomicU64::new(0),
            store,
            host_table: RwLock::new(FxHashMap::default()),
            stats: Arc::new(BTreeStats::default()),
            _marker: PhantomData,
        })
    }

    /// Name the map was opened under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live statistics counters for this map.
    pub fn stats(&self) -> Arc<BTreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of the current statistics counters.
    pub fn stats_snapshot(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of pages currently linked in the page table.
    pub fn live_pages(&self) -> usize {
        self.arena.len()
    }

    /// Number of live keys, maintained incrementally.
    pub fn size(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.size.load(AtomicOrdering::Relaxed))
    }

    /// Whether the map holds no keys.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Retrieves the value stored under `key`, if any.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.ensure_open()?;
        let encoded = encode_key::<K>(key);
        match self.lookup_raw(&encoded) {
            Some(value) => Ok(Some(V::decode_val(&value)?)),
            None => Ok(None),
        }
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.ensure_open()?;
        let encoded = encode_key::<K>(key);
        Ok(self.lookup_raw(&encoded).is_some())
    }

    /// Inserts or replaces the value under `key`, returning the previous
    /// value if the key was present.
    pub fn put(&self, key: &K, value: &V) -> Result<Option<V>> {
        let key_buf = encode_key::<K>(key);
        let val_buf = encode_val::<V>(value);
        let outcome = self.write_entry(LeafOp::Put {
            key: &key_buf,
            value: &val_buf,
        })?;
        decode_previous::<V>(outcome.previous)
    }

    /// Inserts the value under `key` only if absent; returns the existing
    /// value otherwise.
    pub fn put_if_absent(&self, key: &K, value: &V) -> Result<Option<V>> {
        let key_buf = encode_key::<K>(key);
        let val_buf = encode_val::<V>(value);
        let outcome = self.write_entry(LeafOp::PutIfAbsent {
            key: &key_buf,
            value: &val_buf,
        })?;
        decode_previous::<V>(outcome.previous)
    }

    /// Atomic compare-and-set: replaces the value under `key` with
    /// `value` only when the stored value equals `expected`. A mismatch
    /// is not an error; it returns `false` and leaves the map unchanged.
    pub fn replace(&self, key: &K, expected: &V, value: &V) -> Result<bool> {
        let key_buf = encode_key::<K>(key);
        let expected_buf = encode_val::<V>(expected);
        let val_buf = encode_val::<V>(value);
        let outcome = self.write_entry(LeafOp::CasReplace {
            key: &key_buf,
            expected: &expected_buf,
            value: &val_buf,
        })?;
        Ok(outcome.applied)
    }

    /// Removes `key`, returning the previous value if it was present.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let key_buf = encode_key::<K>(key);
        let outcome = self.write_entry(LeafOp::Remove { key: &key_buf })?;
        decode_previous::<V>(outcome.previous)
    }

    /// Smallest live key.
    pub fn first_key(&self) -> Result<Option<K>> {
        self.ensure_open()?;
        let root = self.root_snapshot();
        decode_key_opt::<K>(root.page.first_key())
    }

    /// Largest live key.
    pub fn last_key(&self) -> Result<Option<K>> {
        self.ensure_open()?;
        let root = self.root_snapshot();
        decode_key_opt::<K>(root.page.last_key())
    }

    /// Smallest live key strictly greater than `key`.
    pub fn higher_key(&self, key: &K) -> Result<Option<K>> {
        self.neighbor(key, Neighbor::Forward { inclusive: false })
    }

    /// Smallest live key at or above `key`.
    pub fn ceiling_key(&self, key: &K) -> Result<Option<K>> {
        self.neighbor(key, Neighbor::Forward { inclusive: true })
    }

    /// Largest live key strictly less than `key`.
    pub fn lower_key(&self, key: &K) -> Result<Option<K>> {
        self.neighbor(key, Neighbor::Backward { inclusive: false })
    }

    /// Largest live key at or below `key`.
    pub fn floor_key(&self, key: &K) -> Result<Option<K>> {
        self.neighbor(key, Neighbor::Backward { inclusive: true })
    }

    /// Replaces the root with a fresh empty leaf; all prior pages become
    /// unreachable and are unlinked from the page table.
    pub fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        self.ensure_open()?;
        let (id, root_page) = self.arena.allocate(Page::empty_leaf());
        *self.root.write() = RootHolder {
            id,
            page: root_page,
        };
        self.arena.retain_only(&[id]);
        self.size.store(0, AtomicOrdering::Relaxed);
        self.host_table.write().clear();
        Ok(())
    }

    /// Flushes dirty pages bottom-up through the configured store, so no
    /// persisted page ever references an unpersisted child. With
    /// [`CompactPolicy::OnSave`], runs the compaction sweep first.
    pub fn save(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        self.ensure_open()?;
        if self.options.compact_policy == CompactPolicy::OnSave {
            self.compact_locked();
        }
        let root = self.root_snapshot();
        let mut flushed = 0u64;
        let root_key = PageKey::root(root.page.is_leaf());
        self.flush_page(&root.page, &root_key, &mut flushed)?;
        self.store.sync()?;
        self.stats.add_pages_flushed(flushed);
        tracing::debug!(target: "vesper_btree::save", pages = flushed, "flushed dirty pages");
        Ok(())
    }

    /// Terminal OPEN to CLOSED transition; idempotent. Waits for any
    /// in-flight structural mutation to drain, then fails every later
    /// operation except `close`/`is_closed`.
    pub fn close(&self) {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return;
        }
        let _guard = self.write_lock.lock();
        self.closed.store(true, AtomicOrdering::SeqCst);
        tracing::debug!(target: "vesper_btree::open", name = %self.name, "closed map");
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    /// Ascending cursor over the whole map, optionally starting at an
    /// inclusive `from` key.
    pub fn cursor(&self, from: Option<&K>) -> Result<Cursor<K, V>> {
        self.ensure_open()?;
        let root = self.root_snapshot();
        Ok(Cursor::full(root.page, from.map(encode_key::<K>)))
    }

    /// Ascending cursor restricted to entries whose containing page's
    /// key belongs to `page_keys` (a node page key covers its whole
    /// subtree). Entries are visited in ascending key order across
    /// pages regardless of the input order, without duplicates, starting
    /// at the optional inclusive `from` key. Page keys that no longer
    /// resolve are skipped.
    pub fn cursor_over(&self, page_keys: &[PageKey], from: Option<&K>) -> Result<Cursor<K, V>> {
        self.ensure_open()?;
        let root = self.root_snapshot();
        let mut keys: Vec<PageKey> = page_keys.to_vec();
        keys.sort();
        keys.dedup();
        let mut seen = FxHashSet::default();
        let mut leaves = Vec::new();
        for page_key in &keys {
            match self.resolve_page(&root, page_key) {
                Some((id, page)) => collect_leaves(&page, id, &mut seen, &mut leaves),
                None => {
                    tracing::trace!(
                        target: "vesper_btree::cursor",
                        key = %page_key,
                        "page key no longer resolves; skipping"
                    );
                }
            }
        }
        Ok(Cursor::over_pages(leaves, from.map(encode_key::<K>)))
    }

    /// Groups the page keys covering the closed range `[from, to]` by
    /// replicating endpoint. With `exclude`, a page replicated only by
    /// that endpoint is omitted entirely, and the endpoint itself
    /// receives no entries.
    pub fn endpoint_page_keys(
        &self,
        exclude: Option<&str>,
        from: &K,
        to: &K,
    ) -> Result<FxHashMap<Arc<str>, Vec<PageKey>>> {
        self.ensure_open()?;
        let from_buf = encode_key::<K>(from);
        let to_buf = encode_key::<K>(to);
        if K::compare_encoded(&from_buf, &to_buf) == Ordering::Greater {
            return Ok(FxHashMap::default());
        }
        let root = self.root_snapshot();
        Ok(partition::collect::<K>(
            &root.page,
            exclude,
            &from_buf,
            &to_buf,
        ))
    }

    /// Attaches a replication host set to the page at `page_key`,
    /// refreshing the cached copy on its parent reference and recording
    /// it in the side table. Assigned by the external replication
    /// manager; the engine only carries the tokens.
    pub fn set_replication_hosts(&self, page_key: &PageKey, hosts: HostSet) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        self.ensure_open()?;
        let root = self.root_snapshot();
        let mut frames = Vec::new();
        let mut page = Arc::clone(&root.page);
        let mut id = root.id;
        for &step in page_key.path() {
            let idx = step as usize;
            let child = match page.node_children().get(idx) {
                Some(child) => child.clone(),
                None => {
                    return Err(VesperError::InvalidArgument("page key does not resolve"));
                }
            };
            frames.push(Frame {
                node: Arc::clone(&page),
                node_id: id,
                child_idx: idx,
            });
            id = child.id;
            page = child.page;
        }
        if page.is_leaf() != page_key.is_leaf() {
            return Err(VesperError::InvalidArgument("page key does not resolve"));
        }
        let rebuilt = match &page.data {
            PageData::Leaf { entries } => Page::leaf(entries.clone(), hosts.clone()),
            PageData::Node {
                separators,
                children,
            } => Page::node(separators.clone(), children.clone(), hosts.clone()),
        };
        let mut superseded = vec![id];
        let new_root =
            self.rebuild_path(&root, frames, Replacement::One(rebuilt), false, &mut superseded);
        self.publish(new_root, &superseded);
        self.host_table.write().insert(page_key.clone(), hosts);
        Ok(())
    }

    /// Replication host set recorded for `page_key`: the side-table
    /// entry if one exists, otherwise the set carried by the page.
    pub fn replication_hosts(&self, page_key: &PageKey) -> Result<Option<HostSet>> {
        self.ensure_open()?;
        if let Some(hosts) = self.host_table.read().get(page_key) {
            return Ok(Some(hosts.clone()));
        }
        let root = self.root_snapshot();
        Ok(self
            .resolve_page(&root, page_key)
            .map(|(_, page)| page.hosts().clone()))
    }

    /// Page key of the current root.
    pub fn root_page_key(&self) -> Result<PageKey> {
        self.ensure_open()?;
        let root = self.root_snapshot();
        Ok(PageKey::root(root.page.is_leaf()))
    }

    /// Page keys of the children of the page at `of`; empty for a leaf.
    pub fn child_page_keys(&self, of: &PageKey) -> Result<Vec<PageKey>> {
        self.ensure_open()?;
        let root = self.root_snapshot();
        let (_, page) = self
            .resolve_page(&root, of)
            .ok_or(VesperError::InvalidArgument("page key does not resolve"))?;
        Ok(page
            .node_children()
            .iter()
            .enumerate()
            .map(|(i, child)| of.child(i as u16, child.page.is_leaf()))
            .collect())
    }

    /// Serializes every page covering the closed range `[first, last]`
    /// into a contiguous byte stream at the channel's current position.
    /// Page-aligned: a boundary page only partially covered by the range
    /// is included in full. Returns the number of bytes written.
    pub fn transfer_to(
        &self,
        channel: &mut dyn ByteChannel,
        first: &K,
        last: &K,
    ) -> Result<u64> {
        self.ensure_open()?;
        let first_buf = encode_key::<K>(first);
        let last_buf = encode_key::<K>(last);
        if K::compare_encoded(&first_buf, &last_buf) == Ordering::Greater {
            return Ok(0);
        }
        let root = self.root_snapshot();
        let mut leaves = Vec::new();
        collect_range_leaves::<K>(&root.page, &first_buf, &last_buf, &mut leaves);
        let mut written = 0u64;
        for leaf in &leaves {
            let record = transfer::record_from_page(leaf);
            let bytes = transfer::encode_page_record(&record, self.options.compress)?;
            channel.write_all(&bytes)?;
            written += bytes.len() as u64;
        }
        tracing::debug!(
            target: "vesper_btree::transfer",
            pages = leaves.len(),
            bytes = written,
            "transferred key range"
        );
        Ok(written)
    }

    /// Reads exactly `length` bytes at `offset` from the channel,
    /// validates the page records they contain, and links their entries
    /// into the local tree. All-or-nothing at page granularity: a
    /// malformed record rejects the call without touching the map
    /// further, and the map remains usable afterwards.
    pub fn transfer_from(
        &self,
        channel: &mut dyn ByteChannel,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        self.ensure_open()?;
        let len = usize::try_from(length)
            .map_err(|_| VesperError::InvalidArgument("transfer length exceeds address space"))?;
        let mut buf = vec![0u8; len];
        channel.read_exact_at(offset, &mut buf)?;
        let mut pos = 0usize;
        let mut ingested = 0u64;
        while pos < buf.len() {
            let (record, consumed) = transfer::decode_page_record(&buf[pos..])?;
            pos += consumed;
            if !record.leaf {
                return Err(VesperError::Corruption(
                    "transfer stream contains a non-leaf page",
                ));
            }
            for pair in record.entries.windows(2) {
                if K::compare_encoded(&pair[0].0, &pair[1].0) != Ordering::Less {
                    return Err(VesperError::Corruption(
                        "transferred page keys out of order",
                    ));
                }
            }
            self.ingest_page(record)?;
            ingested += 1;
        }
        self.stats.add_pages_ingested(ingested);
        tracing::debug!(
            target: "vesper_btree::transfer",
            pages = ingested,
            "ingested transferred pages"
        );
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(VesperError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn root_snapshot(&self) -> RootHolder {
        self.root.read().clone()
    }

    fn publish(&self, new_root: RootHolder, superseded: &[PageId]) {
        *self.root.write() = new_root;
        self.arena.remove(superseded);
    }

    fn lookup_raw(&self, key: &[u8]) -> Option<Vec<u8>> {
        let root = self.root_snapshot();
        let mut page = root.page;
        loop {
            let next = match &page.data {
                PageData::Leaf { entries } => {
                    self.stats.inc_leaf_searches();
                    return match entries.binary_search_by(|(k, _)| K::compare_encoded(k, key)) {
                        Ok(idx) => Some(entries[idx].1.clone()),
                        Err(_) => None,
                    };
                }
                PageData::Node {
                    separators,
                    children,
                } => {
                    self.stats.inc_node_searches();
                    let idx = child_index::<K>(separators, key);
                    Arc::clone(&children[idx].page)
                }
            };
            page = next;
        }
    }

    fn neighbor(&self, key: &K, direction: Neighbor) -> Result<Option<K>> {
        self.ensure_open()?;
        let encoded = encode_key::<K>(key);
        let root = self.root_snapshot();
        let found = match direction {
            Neighbor::Forward { inclusive } => {
                first_at_least::<K>(&root.page, &encoded, inclusive)
            }
            Neighbor::Backward { inclusive } => {
                last_at_most::<K>(&root.page, &encoded, inclusive)
            }
        };
        decode_key_opt::<K>(found.map(|(k, _)| k.as_slice()))
    }

    fn write_entry(&self, op: LeafOp<'_>) -> Result<EditOutcome> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        self.ensure_open()?;
        self.apply_locked(op)
    }

    /// Applies one leaf edit. Caller must hold the write exclusion.
    fn apply_locked(&self, op: LeafOp<'_>) -> Result<EditOutcome> {
        let root = self.root_snapshot();
        let (frames, leaf, leaf_id) = self.locate_leaf(&root, op.key());
        let (rebuilt, outcome) = mutate_entries::<K>(&op, leaf.leaf_entries());
        let Some(entries) = rebuilt else {
            return Ok(outcome);
        };
        let mut superseded = vec![leaf_id];
        let replacement =
            self.leaf_replacement(entries, leaf.hosts().clone(), frames.is_empty());
        let try_merge =
            outcome.removed && self.options.compact_policy == CompactPolicy::Immediate;
        let new_root = self.rebuild_path(&root, frames, replacement, try_merge, &mut superseded);
        self.publish(new_root, &superseded);
        if outcome.inserted {
            self.size.fetch_add(1, AtomicOrdering::Relaxed);
        }
        if outcome.removed {
            self.size.fetch_sub(1, AtomicOrdering::Relaxed);
        }
        Ok(outcome)
    }

    fn locate_leaf(&self, root: &RootHolder, key: &[u8]) -> (Vec<Frame>, Arc<Page>, PageId) {
        let mut frames = Vec::new();
        let mut page = Arc::clone(&root.page);
        let mut id = root.id;
        loop {
            let next = match &page.data {
                PageData::Leaf { .. } => {
                    self.stats.inc_leaf_searches();
                    return (frames, page, id);
                }
                PageData::Node {
                    separators,
                    children,
                } => {
                    self.stats.inc_node_searches();
                    let idx = child_index::<K>(separators, key);
                    let child = &children[idx];
                    let step = (child.id, Arc::clone(&child.page));
                    frames.push(Frame {
                        node: Arc::clone(&page),
                        node_id: id,
                        child_idx: idx,
                    });
                    step
                }
            };
            id = next.0;
            page = next.1;
        }
    }

    fn leaf_replacement(
        &self,
        entries: Vec<LeafEntry>,
        hosts: HostSet,
        is_root: bool,
    ) -> Replacement {
        if entries.is_empty() && !is_root {
            return Replacement::Removed;
        }
        if page::leaf_memory(&entries) > self.options.split_size && entries.len() >= 2 {
            self.stats.inc_leaf_splits();
            tracing::trace!(
                target: "vesper_btree::split",
                entries = entries.len(),
                "splitting leaf"
            );
            let (left, separator, right) = page::split_leaf_entries(entries);
            return Replacement::Split {
                left: Page::leaf(left, hosts.clone()),
                separator,
                right: Page::leaf(right, hosts),
            };
        }
        Replacement::One(Page::leaf(entries, hosts))
    }

    /// Rebuilds the copied parent chain bottom-up, splitting or dropping
    /// nodes along the way, and installs the new root.
    fn rebuild_path(
        &self,
        root: &RootHolder,
        frames: Vec<Frame>,
        mut current: Replacement,
        mut try_merge: bool,
        superseded: &mut Vec<PageId>,
    ) -> RootHolder {
        for frame in frames.into_iter().rev() {
            superseded.push(frame.node_id);
            let mut separators = frame.node.node_separators().to_vec();
            let mut children = frame.node.node_children().to_vec();
            let idx = frame.child_idx;
            match current {
                Replacement::One(rebuilt) => {
                    let lower = children[idx].lower_bound.clone();
                    children[idx] = self.make_ref(rebuilt, lower);
                    if try_merge {
                        self.try_merge_leaf(&mut separators, &mut children, idx, superseded);
                    }
                }
                Replacement::Split {
                    left,
                    separator,
                    right,
                } => {
                    let lower = children[idx].lower_bound.clone();
                    let right_ref = self.make_ref(right, Some(separator.clone()));
                    children[idx] = self.make_ref(left, lower);
                    children.insert(idx + 1, right_ref);
                    separators.insert(idx, separator);
                }
                Replacement::Removed => {
                    superseded.push(children[idx].id);
                    children.remove(idx);
                    if !separators.is_empty() {
                        separators.remove(idx.saturating_sub(1));
                    }
                }
            }
            try_merge = false;
            if children.is_empty() {
                current = Replacement::Removed;
                continue;
            }
            if page::node_memory(&separators, children.len()) > self.options.split_size
                && children.len() >= 2
            {
                self.stats.inc_node_splits();
                tracing::trace!(
                    target: "vesper_btree::split",
                    children = children.len(),
                    "splitting node"
                );
                let ((left_seps, left_children), promoted, (right_seps, right_children)) =
                    page::split_node_children(separators, children);
                let hosts = frame.node.hosts().clone();
                current = Replacement::Split {
                    left: Page::node(left_seps, left_children, hosts.clone()),
                    separator: promoted,
                    right: Page::node(right_seps, right_children, hosts),
                };
            } else {
                current = Replacement::One(Page::node(
                    separators,
                    children,
                    frame.node.hosts().clone(),
                ));
            }
        }
        self.install_root(root, current, superseded)
    }

    fn install_root(
        &self,
        old_root: &RootHolder,
        current: Replacement,
        superseded: &mut Vec<PageId>,
    ) -> RootHolder {
        match current {
            Replacement::Removed => {
                let (id, page) = self.arena.allocate(Page::empty_leaf());
                RootHolder { id, page }
            }
            Replacement::One(rebuilt) => {
                if !rebuilt.is_leaf() && rebuilt.node_children().len() == 1 {
                    // Tree height shrinks by one.
                    let child = rebuilt.node_children()[0].clone();
                    self.stats.inc_root_collapses();
                    tracing::trace!(
                        target: "vesper_btree::split",
                        "collapsing single-child root"
                    );
                    return RootHolder {
                        id: child.id,
                        page: child.page,
                    };
                }
                let (id, page) = self.arena.allocate(rebuilt);
                RootHolder { id, page }
            }
            Replacement::Split {
                left,
                separator,
                right,
            } => {
                // Root split: tree height grows by exactly one.
                let hosts = old_root.page.hosts().clone();
                let right_ref = self.make_ref(right, Some(separator.clone()));
                let left_ref = self.make_ref(left, None);
                tracing::trace!(target: "vesper_btree::split", "growing tree by one level");
                let root_page = Page::node(vec![separator], vec![left_ref, right_ref], hosts);
                let (id, page) = self.arena.allocate(root_page);
                RootHolder { id, page }
            }
        }
    }

    fn make_ref(&self, page: Page, lower_bound: Option<Vec<u8>>) -> PageRef {
        let (id, arc) = self.arena.allocate(page);
        PageRef::new(id, arc, lower_bound)
    }

    /// Immediate-policy merge: folds an under-filled leaf at `idx` into
    /// an adjacent leaf sibling under the same parent when the combined
    /// page still fits the split size.
    fn try_merge_leaf(
        &self,
        separators: &mut Vec<Vec<u8>>,
        children: &mut Vec<PageRef>,
        idx: usize,
        superseded: &mut Vec<PageId>,
    ) {
        if !children[idx].page.is_leaf() {
            return;
        }
        if children[idx].page.fill_rate(self.options.split_size) >= self.options.min_fill_rate {
            return;
        }
        let sibling_idx = if idx > 0 {
            idx - 1
        } else if idx + 1 < children.len() {
            idx + 1
        } else {
            return;
        };
        if !children[sibling_idx].page.is_leaf() {
            return;
        }
        let left_idx = idx.min(sibling_idx);
        let right_idx = idx.max(sibling_idx);
        let mut merged = children[left_idx].page.leaf_entries().to_vec();
        merged.extend_from_slice(children[right_idx].page.leaf_entries());
        if page::leaf_memory(&merged) > self.options.split_size {
            return;
        }
        let mut hosts = children[left_idx].page.hosts().clone();
        hosts.merge(children[right_idx].page.hosts());
        superseded.push(children[left_idx].id);
        superseded.push(children[right_idx].id);
        let lower = children[left_idx].lower_bound.clone();
        children[left_idx] = self.make_ref(Page::leaf(merged, hosts), lower);
        children.remove(right_idx);
        separators.remove(left_idx);
        self.stats.inc_leaf_merges();
        tracing::trace!(target: "vesper_btree::merge", "merged adjacent leaves");
    }

    /// OnSave-policy sweep: coalesces adjacent under-filled leaf siblings
    /// across the whole tree, then collapses any single-child root chain.
    fn compact_locked(&self) {
        let root = self.root_snapshot();
        let mut superseded = Vec::new();
        let Some(rebuilt) = self.compact_subtree(&root.page, &mut superseded) else {
            return;
        };
        superseded.push(root.id);
        let (id, page) = self.arena.allocate(rebuilt);
        let mut holder = RootHolder { id, page };
        while !holder.page.is_leaf() && holder.page.node_children().len() == 1 {
            let child = holder.page.node_children()[0].clone();
            superseded.push(holder.id);
            holder = RootHolder {
                id: child.id,
                page: child.page,
            };
            self.stats.inc_root_collapses();
        }
        self.publish(holder, &superseded);
    }

    fn compact_subtree(&self, page: &Arc<Page>, superseded: &mut Vec<PageId>) -> Option<Page> {
        if page.is_leaf() {
            return None;
        }
        let mut separators = page.node_separators().to_vec();
        let mut children = page.node_children().to_vec();
        let mut changed = false;
        for child in children.iter_mut() {
            if let Some(rebuilt) = self.compact_subtree(&child.page, superseded) {
                superseded.push(child.id);
                let lower = child.lower_bound.clone();
                *child = self.make_ref(rebuilt, lower);
                changed = true;
            }
        }
        let mut i = 0;
        while i + 1 < children.len() {
            let plan = {
                let a = &children[i];
                let b = &children[i + 1];
                if a.page.is_leaf()
                    && b.page.is_leaf()
                    && (a.page.fill_rate(self.options.split_size) < self.options.min_fill_rate
                        || b.page.fill_rate(self.options.split_size)
                            < self.options.min_fill_rate)
                {
                    let mut merged = a.page.leaf_entries().to_vec();
                    merged.extend_from_slice(b.page.leaf_entries());
                    if page::leaf_memory(&merged) <= self.options.split_size {
                        let mut hosts = a.page.hosts().clone();
                        hosts.merge(b.page.hosts());
                        Some((merged, hosts, a.id, b.id, a.lower_bound.clone()))
                    } else {
                        None
                    }
                } else {
                    None
                }
            };
            let Some((merged, hosts, left_id, right_id, lower)) = plan else {
                i += 1;
                continue;
            };
            superseded.push(left_id);
            superseded.push(right_id);
            children[i] = self.make_ref(Page::leaf(merged, hosts), lower);
            children.remove(i + 1);
            separators.remove(i);
            self.stats.inc_leaf_merges();
            changed = true;
        }
        if !changed {
            return None;
        }
        Some(Page::node(separators, children, page.hosts().clone()))
    }

    fn flush_page(&self, page: &Arc<Page>, key: &PageKey, flushed: &mut u64) -> Result<()> {
        if let PageData::Node { children, .. } = &page.data {
            for (i, child) in children.iter().enumerate() {
                let child_key = key.child(i as u16, child.page.is_leaf());
                self.flush_page(&child.page, &child_key, flushed)?;
            }
        }
        if page.is_dirty() {
            let record = transfer::record_from_page(page);
            let bytes = transfer::encode_page_record(&record, self.options.compress)?;
            self.store.write_page(key, &bytes)?;
            page.mark_clean();
            *flushed += 1;
        }
        Ok(())
    }

    fn resolve_page(&self, root: &RootHolder, page_key: &PageKey) -> Option<(PageId, Arc<Page>)> {
        let mut id = root.id;
        let mut page = Arc::clone(&root.page);
        for &step in page_key.path() {
            let child = page.node_children().get(step as usize)?.clone();
            id = child.id;
            page = child.page;
        }
        if page.is_leaf() != page_key.is_leaf() {
            return None;
        }
        Some((id, page))
    }

    fn leaf_page_key_for(&self, root: &RootHolder, key: &[u8]) -> PageKey {
        let mut path: SmallVec<[u16; 8]> = SmallVec::new();
        let mut page = Arc::clone(&root.page);
        loop {
            let next = match &page.data {
                PageData::Leaf { .. } => return PageKey::new(path, true),
                PageData::Node {
                    separators,
                    children,
                } => {
                    let idx = child_index::<K>(separators, key);
                    path.push(idx as u16);
                    Arc::clone(&children[idx].page)
                }
            };
            page = next;
        }
    }

    /// Ingests one validated transferred page as a single serialized
    /// structural mutation.
    fn ingest_page(&self, record: transfer::PageRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.ensure_open()?;
        let first = record.entries.first().map(|(k, _)| k.clone());
        for (key, value) in &record.entries {
            self.apply_locked(LeafOp::Put { key, value })?;
        }
        if let Some(first) = first {
            if !record.hosts.is_empty() {
                let root = self.root_snapshot();
                let page_key = self.leaf_page_key_for(&root, &first);
                self.host_table.write().insert(page_key, record.hosts);
            }
        }
        Ok(())
    }
}

enum Neighbor {
    Forward { inclusive: bool },
    Backward { inclusive: bool },
}

fn encode_key<K: KeyCodec>(key: &K) -> Vec<u8> {
    let mut buf = Vec::new();
    K::encode_key(key, &mut buf);
    buf
}

fn encode_val<V: ValCodec>(value: &V) -> Vec<u8> {
    let mut buf = Vec::new();
    V::encode_val(value, &mut buf);
    buf
}

fn decode_previous<V: ValCodec>(previous: Option<Vec<u8>>) -> Result<Option<V>> {
    match previous {
        Some(bytes) => Ok(Some(V::decode_val(&bytes)?)),
        None => Ok(None),
    }
}

fn decode_key_opt<K: KeyCodec>(bytes: Option<&[u8]>) -> Result<Option<K>> {
    match bytes {
        Some(bytes) => Ok(Some(K::decode_key(bytes)?)),
        None => Ok(None),
    }
}

/// Applies `op` against a leaf's entries. Returns the rebuilt entry list
/// when a mutation is required, `None` when the map is left unchanged.
fn mutate_entries<K: KeyCodec>(
    op: &LeafOp<'_>,
    entries: &[LeafEntry],
) -> (Option<Vec<LeafEntry>>, EditOutcome) {
    let key = op.key();
    let found = entries.binary_search_by(|(k, _)| K::compare_encoded(k, key));
    match (op, found) {
        (LeafOp::Put { value, .. }, Ok(idx)) => {
            let previous = entries[idx].1.clone();
            let mut rebuilt = entries.to_vec();
            rebuilt[idx].1 = value.to_vec();
            (
                Some(rebuilt),
                EditOutcome {
                    previous: Some(previous),
                    applied: true,
                    ..EditOutcome::default()
                },
            )
        }
        (LeafOp::Put { value, .. } | LeafOp::PutIfAbsent { value, .. }, Err(idx)) => {
            let mut rebuilt = entries.to_vec();
            rebuilt.insert(idx, (key.to_vec(), value.to_vec()));
            (
                Some(rebuilt),
                EditOutcome {
                    applied: true,
                    inserted: true,
                    ..EditOutcome::default()
                },
            )
        }
        (LeafOp::PutIfAbsent { .. }, Ok(idx)) => (
            None,
            EditOutcome {
                previous: Some(entries[idx].1.clone()),
                ..EditOutcome::default()
            },
        ),
        (LeafOp::CasReplace { expected, value, .. }, Ok(idx)) => {
            if entries[idx].1.as_slice() == *expected {
                let mut rebuilt = entries.to_vec();
                rebuilt[idx].1 = value.to_vec();
                (
                    Some(rebuilt),
                    EditOutcome {
                        applied: true,
                        ..EditOutcome::default()
                    },
                )
            } else {
                (None, EditOutcome::default())
            }
        }
        (LeafOp::CasReplace { .. }, Err(_)) => (None, EditOutcome::default()),
        (LeafOp::Remove { .. }, Ok(idx)) => {
            let previous = entries[idx].1.clone();
            let mut rebuilt = entries.to_vec();
            rebuilt.remove(idx);
            (
                Some(rebuilt),
                EditOutcome {
                    previous: Some(previous),
                    applied: true,
                    removed: true,
                    ..EditOutcome::default()
                },
            )
        }
        (LeafOp::Remove { .. }, Err(_)) => (None, EditOutcome::default()),
    }
}

fn first_at_least<'a, K: KeyCodec>(
    page: &'a Page,
    key: &[u8],
    inclusive: bool,
) -> Option<&'a LeafEntry> {
    match &page.data {
        PageData::Leaf { entries } => {
            let idx = entries.partition_point(|(k, _)| match K::compare_encoded(k, key) {
                Ordering::Less => true,
                Ordering::Equal => !inclusive,
                Ordering::Greater => false,
            });
            entries.get(idx)
        }
        PageData::Node {
            separators,
            children,
        } => {
            let start = child_index::<K>(separators, key);
            children[start..]
                .iter()
                .find_map(|child| first_at_least::<K>(&child.page, key, inclusive))
        }
    }
}

fn last_at_most<'a, K: KeyCodec>(
    page: &'a Page,
    key: &[u8],
    inclusive: bool,
) -> Option<&'a LeafEntry> {
    match &page.data {
        PageData::Leaf { entries } => {
            let idx = entries.partition_point(|(k, _)| match K::compare_encoded(k, key) {
                Ordering::Less => true,
                Ordering::Equal => inclusive,
                Ordering::Greater => false,
            });
            idx.checked_sub(1).and_then(|i| entries.get(i))
        }
        PageData::Node {
            separators,
            children,
        } => {
            let start = child_index::<K>(separators, key);
            children[..=start]
                .iter()
                .rev()
                .find_map(|child| last_at_most::<K>(&child.page, key, inclusive))
        }
    }
}

fn collect_leaves(
    page: &Arc<Page>,
    id: PageId,
    seen: &mut FxHashSet<PageId>,
    out: &mut Vec<Arc<Page>>,
) {
    if page.is_leaf() {
        if seen.insert(id) {
            out.push(Arc::clone(page));
        }
        return;
    }
    for child in page.node_children() {
        collect_leaves(&child.page, child.id, seen, out);
    }
}

fn collect_range_leaves<K: KeyCodec>(
    page: &Arc<Page>,
    from: &[u8],
    to: &[u8],
    out: &mut Vec<Arc<Page>>,
) {
    match &page.data {
        PageData::Leaf { entries } => {
            if entries.is_empty() {
                return;
            }
            let first = entries[0].0.as_slice();
            let last = entries[entries.len() - 1].0.as_slice();
            if K::compare_encoded(first, to) == Ordering::Greater
                || K::compare_encoded(last, from) == Ordering::Less
            {
                return;
            }
            out.push(Arc::clone(page));
        }
        PageData::Node {
            separators,
            children,
        } => {
            let lo = child_index::<K>(separators, from);
            let hi = child_index::<K>(separators, to);
            for child in &children[lo..=hi] {
                collect_range_leaves::<K>(&child.page, from, to, out);
            }
        }
    }
}
