//! Range-to-endpoint partitioning over trees of increasing height, with
//! externally injected replication host sets.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;

use vesper::btree::{BTreeMap, BTreeOptions, HostSet, PageKey};
use vesper::Result;

const ENDPOINTS: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

fn open() -> BTreeMap<u64, String> {
    let options = BTreeOptions {
        split_size: 1024,
        ..BTreeOptions::default()
    };
    BTreeMap::open("endpoint_partition", options).expect("open map")
}

fn inject_replication_hosts(map: &BTreeMap<u64, String>, rng: &mut ChaCha8Rng) -> Result<()> {
    let mut queue = vec![map.root_page_key()?];
    while let Some(page_key) = queue.pop() {
        queue.extend(map.child_page_keys(&page_key)?);
        let mut hosts = HostSet::new();
        while hosts.len() < 3 {
            hosts.insert(ENDPOINTS[rng.gen_range(0..ENDPOINTS.len())]);
        }
        map.set_replication_hosts(&page_key, hosts)?;
    }
    Ok(())
}

fn check_partition(map: &BTreeMap<u64, String>, live_keys: u64) -> Result<()> {
    let (from, to) = (3u64, 5999u64);
    let groups = map.endpoint_page_keys(None, &from, &to)?;

    let mut union: Vec<PageKey> = Vec::new();
    let mut seen: HashSet<PageKey> = HashSet::new();
    for page_keys in groups.values() {
        let mut per_endpoint: HashSet<&PageKey> = HashSet::new();
        for page_key in page_keys {
            assert!(per_endpoint.insert(page_key), "duplicate page key: {page_key}");
            if seen.insert(page_key.clone()) {
                union.push(page_key.clone());
            }
        }
    }

    // Scatter-gather: a cursor over each endpoint's page set, merged,
    // must cover the requested range exactly once.
    let mut cursor = map.cursor_over(&union, Some(&from))?;
    let mut keys = Vec::new();
    while cursor.has_next() {
        keys.push(cursor.next()?.0);
    }
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    let expected: Vec<u64> = (from..=to.min(live_keys)).collect();
    assert!(keys.len() >= expected.len());
    assert_eq!(&keys[..expected.len()], expected.as_slice());
    Ok(())
}

#[test]
fn partition_across_tree_shapes() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0x7A6E);
    let map = open();

    // Empty map: an empty mapping, not an error.
    assert!(map.endpoint_page_keys(None, &3, &5999)?.is_empty());

    // Single root leaf.
    for i in 1..=10u64 {
        map.put(&i, &format!("value{i}"))?;
    }
    inject_replication_hosts(&map, &mut rng)?;
    check_partition(&map, 10)?;

    // Node root with two levels of fan-out.
    map.clear()?;
    for i in 1..=6000u64 {
        map.put(&i, &format!("value{i}"))?;
    }
    assert!(!map.root_page_key()?.is_leaf());
    inject_replication_hosts(&map, &mut rng)?;
    check_partition(&map, 6000)?;

    map.close();
    assert!(map.is_closed());
    Ok(())
}

#[test]
fn excluded_endpoint_receives_nothing() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0x51CA);
    let map = open();
    for i in 1..=6000u64 {
        map.put(&i, &format!("value{i}"))?;
    }
    inject_replication_hosts(&map, &mut rng)?;

    let groups = map.endpoint_page_keys(Some("a"), &3, &5999)?;
    assert!(!groups.contains_key("a"));

    // Every page still routed somewhere unless "a" was its only replica;
    // here every page carries three distinct endpoints, so coverage holds.
    let union: Vec<PageKey> = {
        let mut seen = HashSet::new();
        groups
            .values()
            .flatten()
            .filter(|pk| seen.insert((*pk).clone()))
            .cloned()
            .collect()
    };
    let mut cursor = map.cursor_over(&union, Some(&3))?;
    let mut count = 0u64;
    while cursor.has_next() {
        cursor.next()?;
        count += 1;
    }
    assert!(count >= 5997);
    Ok(())
}
