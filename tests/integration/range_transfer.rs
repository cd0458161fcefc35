//! Bulk key-range transfer between maps over a file channel, and
//! file-backed persistence through `save`.

use std::fs::OpenOptions;
use std::io::Seek;
use std::sync::Arc;

use tempfile::tempdir;

use vesper::btree::{BTreeMap, BTreeOptions};
use vesper::store::{FilePageStore, PageStore};
use vesper::{Result, VesperError};

fn open(options: BTreeOptions) -> BTreeMap<u64, String> {
    BTreeMap::open("range_transfer", options).expect("open map")
}

fn small_pages() -> BTreeOptions {
    BTreeOptions {
        split_size: 1024,
        ..BTreeOptions::default()
    }
}

#[test]
fn transfer_range_through_file_channel() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("transfer.vsp");

    let source = open(small_pages());
    for i in 1000..4000u64 {
        source.put(&i, &format!("value{i}"))?;
    }
    source.save()?;

    let mut channel = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    channel.seek(std::io::SeekFrom::End(0))?;
    let written = source.transfer_to(&mut channel, &2000, &3000)?;
    assert!(written > 0);
    assert_eq!(channel.metadata()?.len(), written);

    let replica = open(small_pages());
    replica.transfer_from(&mut channel, 0, written)?;
    for i in 2000..=3000u64 {
        assert_eq!(replica.get(&i)?.as_deref(), Some(format!("value{i}").as_str()));
    }
    assert!(replica.get(&1500)?.is_none(), "only the requested range ships");
    assert!(replica.size()? >= 1001);
    Ok(())
}

#[test]
fn truncated_file_transfer_surfaces_io_error() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("short.vsp");

    let source = open(small_pages());
    for i in 1..=500u64 {
        source.put(&i, &format!("value{i}"))?;
    }
    let mut channel = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    let written = source.transfer_to(&mut channel, &1, &500)?;

    let replica = open(small_pages());
    let err = replica
        .transfer_from(&mut channel, 0, written + 64)
        .unwrap_err();
    assert!(matches!(err, VesperError::Io(_)));
    assert_eq!(replica.size()?, 0);
    Ok(())
}

#[test]
fn save_persists_pages_to_file_store() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(FilePageStore::create(
        dir.path().join("pages.vsp"),
        true,
    )?);
    let map = open(BTreeOptions {
        split_size: 1024,
        reuse_space: true,
        compress: true,
        store: Some(Arc::clone(&store) as Arc<dyn PageStore>),
        ..BTreeOptions::default()
    });

    for i in 1..=300u64 {
        map.put(&i, &format!("value{i}"))?;
    }
    map.save()?;
    let persisted = store.page_count();
    assert!(persisted >= 2, "root and leaves persisted");

    let root_key = map.root_page_key()?;
    assert!(store.read_page(&root_key)?.is_some());

    // Rewriting a key dirties one leaf chain; reuse keeps the same keys.
    map.put(&1, &"rewritten".to_string())?;
    map.save()?;
    assert!(store.page_count() >= persisted);
    Ok(())
}
