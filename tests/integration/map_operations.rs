//! End-to-end map operation scenario: point ops, neighbor queries,
//! cursors, compare-and-set and the terminal close transition.

use vesper::btree::{BTreeMap, BTreeOptions};
use vesper::{Result, VesperError};

fn open() -> BTreeMap<u64, String> {
    let options = BTreeOptions {
        split_size: 1024,
        min_fill_rate: 0.3,
        compress: true,
        reuse_space: true,
        ..BTreeOptions::default()
    };
    BTreeMap::open("map_operations", options).expect("open map")
}

#[test]
fn full_map_lifecycle() -> Result<()> {
    let map = open();

    assert!(map.put(&10, &"a".to_string())?.is_none());
    assert_eq!(map.get(&10)?.as_deref(), Some("a"));
    assert!(map.contains_key(&10)?);

    let existing = map.put_if_absent(&10, &"a1".to_string())?;
    assert_eq!(existing.as_deref(), Some("a"));
    assert!(map.put_if_absent(&20, &"b".to_string())?.is_none());
    assert_eq!(map.get(&20)?.as_deref(), Some("b"));

    map.clear()?;
    assert_eq!(map.size()?, 0);

    for i in 1..=200u64 {
        map.put(&i, &format!("value{i}"))?;
    }
    assert_eq!(map.size()?, 200);

    assert_eq!(map.first_key()?, Some(1));
    assert_eq!(map.last_key()?, Some(200));
    assert_eq!(map.higher_key(&101)?, Some(102));
    assert_eq!(map.ceiling_key(&101)?, Some(101));
    assert_eq!(map.lower_key(&101)?, Some(100));
    assert_eq!(map.floor_key(&101)?, Some(101));

    assert!(!map.replace(&100, &"value100a".to_string(), &"value100".to_string())?);
    assert!(map.replace(&100, &"value100".to_string(), &"value100a".to_string())?);
    assert_eq!(map.get(&100)?.as_deref(), Some("value100a"));
    assert!(map.replace(&100, &"value100a".to_string(), &"value100".to_string())?);

    let mut cursor = map.cursor(None)?;
    let mut count = 0;
    while cursor.has_next() {
        cursor.next()?;
        count += 1;
    }
    assert_eq!(count, 200);

    let mut cursor = map.cursor(Some(&151))?;
    let mut count = 0;
    while cursor.has_next() {
        cursor.next()?;
        count += 1;
    }
    assert_eq!(count, 50);

    assert!(map.remove(&150)?.is_some());
    assert_eq!(map.size()?, 199);

    map.close();
    assert!(map.is_closed());
    let err = map.put(&10, &"a".to_string()).unwrap_err();
    assert!(matches!(err, VesperError::Closed(_)));
    Ok(())
}

#[test]
fn save_then_keep_operating() -> Result<()> {
    let map = open();
    map.put(&1, &"v1".to_string())?;
    map.put(&50, &"v50".to_string())?;
    map.put(&100, &"v100".to_string())?;
    map.save()?;

    for i in 1..=200u64 {
        map.put(&i, &format!("value{i}"))?;
    }
    map.save()?;

    for i in 50..=200u64 {
        map.put(&i, &format!("value{i}"))?;
    }
    map.save()?;

    assert_eq!(map.size()?, 200);
    assert_eq!(map.get(&100)?.as_deref(), Some("value100"));
    Ok(())
}
