mod definition;

pub use definition::{BTreeMap, BTreeOptions, CompactPolicy};
