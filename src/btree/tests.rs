use std::collections::BTreeMap as StdBTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashSet;

use super::{BTreeMap, BTreeOptions, CompactPolicy, HostSet, MemoryChannel, PageKey};
use crate::error::{Result, VesperError};
use crate::store::{MemoryPageStore, PageStore};

fn open_map(options: BTreeOptions) -> BTreeMap<u64, String> {
    BTreeMap::open("tests", options).expect("open map")
}

fn small_pages() -> BTreeOptions {
    BTreeOptions {
        split_size: 1024,
        ..BTreeOptions::default()
    }
}

fn value(i: u64) -> String {
    format!("value{i}")
}

fn fill(map: &BTreeMap<u64, String>, range: std::ops::RangeInclusive<u64>) -> Result<()> {
    for i in range {
        map.put(&i, &value(i))?;
    }
    Ok(())
}

fn collect_keys(map: &BTreeMap<u64, String>, from: Option<u64>) -> Result<Vec<u64>> {
    let mut cursor = map.cursor(from.as_ref())?;
    let mut keys = Vec::new();
    while cursor.has_next() {
        let (key, _) = cursor.next()?;
        keys.push(key);
    }
    Ok(keys)
}

fn all_page_keys(map: &BTreeMap<u64, String>) -> Result<Vec<PageKey>> {
    let mut out = Vec::new();
    let mut queue = vec![map.root_page_key()?];
    while let Some(page_key) = queue.pop() {
        queue.extend(map.child_page_keys(&page_key)?);
        out.push(page_key);
    }
    Ok(out)
}

fn inject_hosts(
    map: &BTreeMap<u64, String>,
    rng: &mut ChaCha8Rng,
    endpoints: &[&str],
) -> Result<()> {
    for page_key in all_page_keys(map)? {
        let mut hosts = HostSet::new();
        while hosts.len() < 3 {
            hosts.insert(endpoints[rng.gen_range(0..endpoints.len())]);
        }
        map.set_replication_hosts(&page_key, hosts)?;
    }
    Ok(())
}

#[test]
fn put_get_remove_roundtrip() -> Result<()> {
    let map = open_map(BTreeOptions::default());
    assert!(map.put(&10, &"a".to_string())?.is_none());
    assert_eq!(map.get(&10)?.as_deref(), Some("a"));
    assert!(map.contains_key(&10)?);
    assert!(!map.contains_key(&11)?);

    let previous = map.put(&10, &"b".to_string())?;
    assert_eq!(previous.as_deref(), Some("a"));
    assert_eq!(map.get(&10)?.as_deref(), Some("b"));

    assert_eq!(map.remove(&10)?.as_deref(), Some("b"));
    assert!(map.get(&10)?.is_none());
    assert!(map.remove(&10)?.is_none());
    assert_eq!(map.size()?, 0);
    Ok(())
}

#[test]
fn put_if_absent_keeps_existing() -> Result<()> {
    let map = open_map(BTreeOptions::default());
    assert!(map.put_if_absent(&10, &"a".to_string())?.is_none());
    let existing = map.put_if_absent(&10, &"a1".to_string())?;
    assert_eq!(existing.as_deref(), Some("a"));
    assert_eq!(map.get(&10)?.as_deref(), Some("a"));
    assert!(map.put_if_absent(&20, &"b".to_string())?.is_none());
    assert_eq!(map.size()?, 2);
    Ok(())
}

#[test]
fn replace_is_compare_and_set() -> Result<()> {
    let map = open_map(BTreeOptions::default());
    fill(&map, 1..=200)?;

    assert!(!map.replace(&100, &"value100a".to_string(), &"value100".to_string())?);
    assert_eq!(map.get(&100)?.as_deref(), Some("value100"));
    assert!(map.replace(&100, &"value100".to_string(), &"value100a".to_string())?);
    assert_eq!(map.get(&100)?.as_deref(), Some("value100a"));
    assert!(map.replace(&100, &"value100a".to_string(), &"value100".to_string())?);
    assert!(!map.replace(&9999, &"x".to_string(), &"y".to_string())?);
    Ok(())
}

#[test]
fn neighbor_queries_match_boundary_semantics() -> Result<()> {
    let map = open_map(BTreeOptions::default());
    fill(&map, 1..=200)?;

    assert_eq!(map.first_key()?, Some(1));
    assert_eq!(map.last_key()?, Some(200));
    assert_eq!(map.higher_key(&101)?, Some(102));
    assert_eq!(map.ceiling_key(&101)?, Some(101));
    assert_eq!(map.lower_key(&101)?, Some(100));
    assert_eq!(map.floor_key(&101)?, Some(101));

    assert_eq!(map.higher_key(&200)?, None);
    assert_eq!(map.ceiling_key(&201)?, None);
    assert_eq!(map.lower_key(&1)?, None);
    assert_eq!(map.floor_key(&0)?, None);
    Ok(())
}

#[test]
fn cursor_scans_ascending_with_start_key() -> Result<()> {
    let map = open_map(BTreeOptions::default());
    fill(&map, 1..=200)?;
    assert_eq!(map.size()?, 200);

    let keys = collect_keys(&map, None)?;
    assert_eq!(keys, (1..=200).collect::<Vec<_>>());

    let tail = collect_keys(&map, Some(151))?;
    assert_eq!(tail, (151..=200).collect::<Vec<_>>());

    assert!(map.remove(&150)?.is_some());
    assert_eq!(map.size()?, 199);
    Ok(())
}

#[test]
#[should_panic(expected = "cursor advanced past the end")]
fn cursor_advance_past_end_panics() {
    let map = open_map(BTreeOptions::default());
    map.put(&1, &value(1)).expect("put");
    let mut cursor = map.cursor(None).expect("cursor");
    assert!(cursor.has_next());
    cursor.next().expect("first entry");
    assert!(!cursor.has_next());
    let _ = cursor.next();
}

#[test]
fn split_produces_node_root_and_ordered_scan() -> Result<()> {
    let map = open_map(small_pages());
    fill(&map, 1..=200)?;

    let root = map.root_page_key()?;
    assert!(!root.is_leaf());
    let children = map.child_page_keys(&root)?;
    assert!(children.len() >= 2);

    assert_eq!(collect_keys(&map, None)?, (1..=200).collect::<Vec<_>>());
    assert!(map.stats_snapshot().leaf_splits >= 1);
    Ok(())
}

#[test]
fn clear_discards_all_pages() -> Result<()> {
    let map = open_map(small_pages());
    fill(&map, 1..=500)?;
    assert!(map.live_pages() > 1);

    map.clear()?;
    assert_eq!(map.size()?, 0);
    assert_eq!(map.live_pages(), 1);
    assert!(collect_keys(&map, None)?.is_empty());

    // The map stays usable after clear.
    fill(&map, 1..=10)?;
    assert_eq!(map.size()?, 10);
    Ok(())
}

#[test]
fn close_is_terminal_and_idempotent() -> Result<()> {
    let map = open_map(BTreeOptions::default());
    fill(&map, 1..=10)?;
    assert!(!map.is_closed());
    map.close();
    map.close();
    assert!(map.is_closed());

    let err = map.put(&10, &"a".to_string()).unwrap_err();
    assert!(matches!(err, VesperError::Closed(_)));
    let err = map.get(&10).unwrap_err();
    assert!(matches!(err, VesperError::Closed(_)));
    let err = map.cursor(None).err().expect("cursor after close");
    assert!(matches!(err, VesperError::Closed(_)));
    Ok(())
}

#[test]
fn random_operations_match_reference_model() -> Result<()> {
    let map = open_map(small_pages());
    let mut reference = StdBTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0xB7EE);

    for _ in 0..4000 {
        let key = rng.gen_range(0..600u64);
        if rng.gen_bool(0.7) {
            let val = value(rng.gen_range(0..10_000));
            assert_eq!(map.put(&key, &val)?, reference.insert(key, val));
        } else {
            assert_eq!(map.remove(&key)?, reference.remove(&key));
        }
    }

    assert_eq!(map.size()?, reference.len() as u64);
    let keys = collect_keys(&map, None)?;
    assert_eq!(keys, reference.keys().copied().collect::<Vec<_>>());
    for key in 0..600 {
        assert_eq!(map.get(&key)?, reference.get(&key).cloned());
    }
    Ok(())
}

#[test]
fn immediate_policy_merges_underfilled_leaves() -> Result<()> {
    let map = open_map(BTreeOptions {
        split_size: 1024,
        min_fill_rate: 0.5,
        compact_policy: CompactPolicy::Immediate,
        ..BTreeOptions::default()
    });
    fill(&map, 1..=100)?;
    // Thin out every leaf so each drops below the fill floor.
    for i in (2..=100).step_by(2) {
        map.remove(&i)?;
    }
    let odds: Vec<u64> = (1..=100).step_by(2).collect();
    assert_eq!(collect_keys(&map, None)?, odds);
    assert!(map.stats_snapshot().leaf_merges >= 1);
    Ok(())
}

#[test]
fn on_save_policy_compacts_during_save() -> Result<()> {
    let map = open_map(BTreeOptions {
        split_size: 1024,
        min_fill_rate: 0.5,
        compact_policy: CompactPolicy::OnSave,
        ..BTreeOptions::default()
    });
    fill(&map, 1..=100)?;
    for i in (2..=100).step_by(2) {
        map.remove(&i)?;
    }
    let before = map.stats_snapshot().leaf_merges;
    map.save()?;
    assert!(map.stats_snapshot().leaf_merges > before);
    let odds: Vec<u64> = (1..=100).step_by(2).collect();
    assert_eq!(collect_keys(&map, None)?, odds);
    Ok(())
}

#[test]
fn save_flushes_dirty_pages_bottom_up_once() -> Result<()> {
    let store = Arc::new(MemoryPageStore::new());
    let map = open_map(BTreeOptions {
        split_size: 1024,
        store: Some(Arc::clone(&store) as Arc<dyn PageStore>),
        ..BTreeOptions::default()
    });
    fill(&map, 1..=200)?;
    map.save()?;
    assert!(store.page_count() >= 2, "root and leaves persisted");
    let flushed = map.stats_snapshot().pages_flushed;
    assert!(flushed >= 2);

    // Nothing dirty on a quiescent map: the second save is a no-op.
    map.save()?;
    assert_eq!(map.stats_snapshot().pages_flushed, flushed);

    map.put(&1, &"rewritten".to_string())?;
    map.save()?;
    assert!(map.stats_snapshot().pages_flushed > flushed);
    Ok(())
}

#[test]
fn restricted_cursor_dedupes_overlapping_page_keys() -> Result<()> {
    let map = open_map(small_pages());
    fill(&map, 1..=200)?;

    let root = map.root_page_key()?;
    let mut overlapping = vec![root.clone()];
    overlapping.extend(map.child_page_keys(&root)?);
    // The root covers every child; overlap must not produce duplicates.
    let mut cursor = map.cursor_over(&overlapping, Some(&51))?;
    let mut keys = Vec::new();
    while cursor.has_next() {
        keys.push(cursor.next()?.0);
    }
    assert_eq!(keys, (51..=200).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn restricted_cursor_visits_subset_in_key_order() -> Result<()> {
    let map = open_map(small_pages());
    fill(&map, 1..=200)?;

    let root = map.root_page_key()?;
    let children = map.child_page_keys(&root)?;
    assert!(children.len() >= 2);
    // Present the pages in reverse; the scan must still ascend.
    let chosen: Vec<PageKey> = children.iter().rev().cloned().collect();
    let mut cursor = map.cursor_over(&chosen, None)?;
    let mut keys = Vec::new();
    while cursor.has_next() {
        keys.push(cursor.next()?.0);
    }
    assert_eq!(keys, (1..=200).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn endpoint_partition_on_empty_map_is_empty() -> Result<()> {
    let map = open_map(BTreeOptions::default());
    let groups = map.endpoint_page_keys(None, &3, &5999)?;
    assert!(groups.is_empty());
    Ok(())
}

#[test]
fn endpoint_partition_covers_requested_range() -> Result<()> {
    let endpoints = ["a", "b", "c", "d", "e", "f"];
    let mut rng = ChaCha8Rng::seed_from_u64(0x9E0D);
    for count in [10u64, 6000] {
        let map = open_map(small_pages());
        fill(&map, 1..=count)?;
        inject_hosts(&map, &mut rng, &endpoints)?;

        let (from, to) = (3u64, 5999u64);
        let groups = map.endpoint_page_keys(None, &from, &to)?;
        assert!(!groups.is_empty());

        let mut union: Vec<PageKey> = Vec::new();
        let mut seen = FxHashSet::default();
        for (_, page_keys) in groups.iter() {
            let mut per_endpoint = FxHashSet::default();
            for page_key in page_keys {
                assert!(
                    per_endpoint.insert(page_key.clone()),
                    "page key repeated for one endpoint"
                );
                if seen.insert(page_key.clone()) {
                    union.push(page_key.clone());
                }
            }
        }

        let mut cursor = map.cursor_over(&union, Some(&from))?;
        let mut keys = Vec::new();
        while cursor.has_next() {
            keys.push(cursor.next()?.0);
        }
        let expected_last = to.min(count);
        assert!(keys.windows(2).all(|w| w[0] < w[1]), "ascending, no dups");
        let expected: Vec<u64> = (from..=expected_last).collect();
        // Page alignment may pull in trailing keys beyond `to`.
        assert!(keys.len() >= expected.len());
        assert_eq!(&keys[..expected.len()], expected.as_slice());
    }
    Ok(())
}

#[test]
fn endpoint_partition_respects_exclusion() -> Result<()> {
    let map = open_map(BTreeOptions::default());
    fill(&map, 1..=10)?;
    let root = map.root_page_key()?;

    let solo: HostSet = ["a"].into_iter().collect();
    map.set_replication_hosts(&root, solo)?;
    let groups = map.endpoint_page_keys(Some("a"), &1, &10)?;
    assert!(groups.is_empty(), "page replicated only by excluded endpoint");

    let pair: HostSet = ["a", "b"].into_iter().collect();
    map.set_replication_hosts(&root, pair)?;
    let groups = map.endpoint_page_keys(Some("a"), &1, &10)?;
    assert_eq!(groups.len(), 1);
    let (endpoint, page_keys) = groups.iter().next().expect("one endpoint");
    assert_eq!(endpoint.as_ref(), "b");
    assert_eq!(page_keys.len(), 1);
    Ok(())
}

#[test]
fn replication_hosts_cached_on_references_and_side_table() -> Result<()> {
    let map = open_map(small_pages());
    fill(&map, 1..=200)?;
    let root = map.root_page_key()?;
    let first_child = map.child_page_keys(&root)?.remove(0);

    let hosts: HostSet = ["n1", "n2"].into_iter().collect();
    map.set_replication_hosts(&first_child, hosts.clone())?;
    assert_eq!(map.replication_hosts(&first_child)?, Some(hosts));

    // Untouched pages report whatever their page carries (empty here).
    let other = map.child_page_keys(&root)?.pop().expect("child");
    assert_eq!(map.replication_hosts(&other)?, Some(HostSet::new()));
    Ok(())
}

#[test]
fn transfer_roundtrip_bootstraps_replica() -> Result<()> {
    for compress in [false, true] {
        let source = open_map(BTreeOptions {
            split_size: 1024,
            compress,
            ..BTreeOptions::default()
        });
        fill(&source, 1000..=3999)?;

        let mut channel = MemoryChannel::new();
        let written = source.transfer_to(&mut channel, &2000, &3000)?;
        assert_eq!(written, channel.data().len() as u64);
        assert!(written > 0);

        let replica = open_map(small_pages());
        replica.transfer_from(&mut channel, 0, written)?;

        for key in 2000..=3000u64 {
            assert_eq!(replica.get(&key)?.as_deref(), Some(value(key).as_str()));
        }
        // Page alignment ships boundary pages whole, never more than the
        // two partially covered ones.
        assert!(replica.size()? >= 1001);
        let keys = collect_keys(&replica, None)?;
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert!(replica.stats_snapshot().pages_ingested >= 1);
    }
    Ok(())
}

#[test]
fn transfer_from_rejects_corrupt_payload_and_stays_usable() -> Result<()> {
    let source = open_map(small_pages());
    fill(&source, 1..=300)?;
    let mut channel = MemoryChannel::new();
    let written = source.transfer_to(&mut channel, &1, &300)?;

    let mid = channel.data().len() / 2;
    channel.data_mut()[mid] ^= 0xff;

    let replica = open_map(small_pages());
    replica.put(&7, &"keep".to_string())?;
    let err = replica.transfer_from(&mut channel, 0, written).unwrap_err();
    assert!(matches!(
        err,
        VesperError::Corruption(_) | VesperError::Io(_)
    ));

    // Fatal to that call only; the map remains usable.
    assert_eq!(replica.get(&7)?.as_deref(), Some("keep"));
    replica.put(&8, &"more".to_string())?;
    assert_eq!(replica.get(&8)?.as_deref(), Some("more"));
    Ok(())
}

#[test]
fn transfer_from_short_channel_surfaces_io_error() -> Result<()> {
    let source = open_map(small_pages());
    fill(&source, 1..=50)?;
    let mut channel = MemoryChannel::new();
    let written = source.transfer_to(&mut channel, &1, &50)?;

    let replica = open_map(small_pages());
    let err = replica
        .transfer_from(&mut channel, 0, written + 10)
        .unwrap_err();
    assert!(matches!(err, VesperError::Io(_)));
    assert_eq!(replica.size()?, 0, "nothing partially linked");
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn scan_matches_reference_for_any_op_sequence(
        ops in prop::collection::vec((0u64..200, prop::bool::ANY), 1..400)
    ) {
        let map = open_map(small_pages());
        let mut reference = StdBTreeMap::new();
        for (key, insert) in ops {
            if insert {
                let val = value(key);
                prop_assert_eq!(map.put(&key, &val).unwrap(), reference.insert(key, val));
            } else {
                prop_assert_eq!(map.remove(&key).unwrap(), reference.remove(&key));
            }
        }
        prop_assert_eq!(map.size().unwrap(), reference.len() as u64);
        let keys = collect_keys(&map, None).unwrap();
        let expected: Vec<u64> = reference.keys().copied().collect();
        prop_assert_eq!(keys, expected);
    }
}
