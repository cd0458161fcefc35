//! Range partitioner: decomposes a closed key range into the minimal page
//! set covering it, grouped by replicating endpoint, so a distributed
//! coordinator can route scan fragments without shipping the whole tree.

use std::cmp::Ordering;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::codecs::KeyCodec;
use super::page::{Page, PageData};
use super::page_key::PageKey;
use super::replication::HostSet;

/// Walks the tree from `root` and groups the page keys covering the
/// closed range `[from, to]` by replicating endpoint.
///
/// A subtree fully inside the range whose reference carries a cached host
/// set is resolved at the node level, without materializing its leaves.
/// A page whose only replicating endpoint is `exclude` is omitted
/// entirely; for other pages, `exclude` simply receives no entry.
pub(crate) fn collect<K: KeyCodec>(
    root: &Arc<Page>,
    exclude: Option<&str>,
    from: &[u8],
    to: &[u8],
) -> FxHashMap<Arc<str>, Vec<PageKey>> {
    let mut collector = Collector {
        exclude,
        groups: FxHashMap::default(),
        emitted: FxHashSet::default(),
    };
    visit::<K>(root, SmallVec::new(), None, None, from, to, &mut collector);
    collector.groups
}

struct Collector<'a> {
    exclude: Option<&'a str>,
    groups: FxHashMap<Arc<str>, Vec<PageKey>>,
    /// Guards the no-repeated-page-key-per-endpoint contract: each page
    /// is emitted at most once, to every endpoint replicating it.
    emitted: FxHashSet<PageKey>,
}

impl Collector<'_> {
    fn emit(&mut self, page_key: PageKey, hosts: &HostSet) {
        if hosts.is_empty() {
            return;
        }
        if let Some(exclude) = self.exclude {
            if hosts.only_contains(exclude) {
                return;
            }
        }
        if !self.emitted.insert(page_key.clone()) {
            return;
        }
        for host in hosts.iter() {
            if self.exclude == Some(host.as_ref()) {
                continue;
            }
            self.groups
                .entry(Arc::clone(host))
                .or_default()
                .push(page_key.clone());
        }
    }
}

fn visit<K: KeyCodec>(
    page: &Arc<Page>,
    path: SmallVec<[u16; 8]>,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    from: &[u8],
    to: &[u8],
    out: &mut Collector<'_>,
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
            out.emit(PageKey::new(path, true), page.hosts());
        }
        PageData::Node {
            separators,
            children,
        } => {
            for (i, child) in children.iter().enumerate() {
                // The subtree under children[i] covers [child_lower, child_upper).
                let child_lower = if i == 0 {
                    lower
                } else {
                    Some(separators[i - 1].as_slice())
                };
                let child_upper = if i == children.len() - 1 {
                    upper
                } else {
                    Some(separators[i].as_slice())
                };
                if let Some(hi) = child_upper {
                    if K::compare_encoded(from, hi) != Ordering::Less {
                        continue;
                    }
                }
                if let Some(lo) = child_lower {
                    if K::compare_encoded(lo, to) == Ordering::Greater {
                        continue;
                    }
                }
                let mut child_path = path.clone();
                child_path.push(i as u16);
                let contained = matches!((child_lower, child_upper), (Some(lo), Some(hi))
                    if K::compare_encoded(from, lo) != Ordering::Greater
                        && K::compare_encoded(hi, to) != Ordering::Greater);
                if contained && !child.page.is_leaf() && !child.hosts().is_empty() {
                    out.emit(PageKey::new(child_path, false), child.hosts());
                    continue;
                }
                visit::<K>(
                    &child.page,
                    child_path,
                    child_lower,
                    child_upper,
                    from,
                    to,
                    out,
                );
            }
        }
    }
}
