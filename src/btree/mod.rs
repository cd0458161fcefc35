#![forbid(unsafe_code)]

//! Copy-on-write B-tree map with replication-aware page addressing.

/// Page structure and split/merge primitives.
pub mod page;

/// Key/value codec traits and stock implementations.
pub mod codecs;
/// Stable path-based page addressing.
pub mod page_key;
/// Replication host metadata.
pub mod replication;
/// Page-aligned bulk transfer.
pub mod transfer;

mod arena;
mod cursor;
mod partition;
mod stats;
mod tree;

pub use arena::PageId;
pub use codecs::{KeyCodec, ValCodec};
pub use cursor::Cursor;
pub use page_key::PageKey;
pub use replication::HostSet;
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use transfer::{ByteChannel, MemoryChannel};
pub use tree::{BTreeMap, BTreeOptions, CompactPolicy};

#[cfg(test)]
mod tests;
