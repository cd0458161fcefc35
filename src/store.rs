//! Persistence target for `save`: a page store keyed by [`PageKey`].
//!
//! Disk layout beyond page payload boundaries belongs to an external
//! collaborator; the stores here only place whole encoded pages and hand
//! them back verbatim. Handles are explicit values threaded through
//! `BTreeMap::open` — there is no process-wide store state.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::btree::PageKey;
use crate::error::Result;

/// Sink/source for encoded pages, keyed by their stable address.
pub trait PageStore: Send + Sync {
    /// Stores the encoded page under `key`, replacing any prior version.
    fn write_page(&self, key: &PageKey, bytes: &[u8]) -> Result<()>;

    /// Reads the encoded page stored under `key`, if present.
    fn read_page(&self, key: &PageKey) -> Result<Option<Vec<u8>>>;

    /// Number of distinct page keys stored.
    fn page_count(&self) -> usize;

    /// Forces buffered writes down to the backing medium.
    fn sync(&self) -> Result<()>;
}

/// Heap-backed page store; the default when a map is opened without an
/// explicit store handle.
#[derive(Default)]
pub struct MemoryPageStore {
    pages: Mutex<FxHashMap<PageKey, Vec<u8>>>,
}

impl MemoryPageStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageStore for MemoryPageStore {
    fn write_page(&self, key: &PageKey, bytes: &[u8]) -> Result<()> {
        self.pages.lock().insert(key.clone(), bytes.to_vec());
        Ok(())
    }

    fn read_page(&self, key: &PageKey) -> Result<Option<Vec<u8>>> {
        Ok(self.pages.lock().get(key).cloned())
    }

    fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct Slot {
    offset: u64,
    /// Bytes currently stored.
    len: u32,
    /// Bytes reserved at `offset`; a rewrite may shrink `len` but the
    /// reservation never grows.
    capacity: u32,
}

/// Single-file page store. Pages are appended; when opened with
/// `reuse_space`, a rewrite that fits its previous reservation lands in
/// place instead of growing the file.
pub struct FilePageStore {
    file: Mutex<File>,
    slots: Mutex<FxHashMap<PageKey, Slot>>,
    reuse_space: bool,
}

impl FilePageStore {
    /// Creates (or truncates) the store file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, reuse_space: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            slots: Mutex::new(FxHashMap::default()),
            reuse_space,
        })
    }
}

impl PageStore for FilePageStore {
    fn write_page(&self, key: &PageKey, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| crate::error::VesperError::InvalidArgument("page exceeds 4 GiB"))?;
        let mut slots = self.slots.lock();
        let mut file = self.file.lock();
        let slot = match slots.get(key) {
            Some(existing) if self.reuse_space && len <= existing.capacity => Slot {
                offset: existing.offset,
                len,
                capacity: existing.capacity,
            },
            _ => {
                let offset = file.seek(SeekFrom::End(0))?;
                Slot {
                    offset,
                    len,
                    capacity: len,
                }
            }
        };
        file.seek(SeekFrom::Start(slot.offset))?;
        file.write_all(bytes)?;
        slots.insert(key.clone(), slot);
        Ok(())
    }

    fn read_page(&self, key: &PageKey) -> Result<Option<Vec<u8>>> {
        let slot = match self.slots.lock().get(key) {
            Some(slot) => *slot,
            None => return Ok(None),
        };
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(slot.offset))?;
        let mut buf = vec![0u8; slot.len as usize];
        file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    fn page_count(&self) -> usize {
        self.slots.lock().len()
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}
