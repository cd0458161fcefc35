//! Copy-on-write B-tree storage engine for distributed ordered maps.
//!
//! The engine persists sorted key ranges as pages, tracks which replica
//! endpoints hold each page, partitions key ranges into per-endpoint page
//! sets for scatter-gather scans, and bulk-transfers contiguous key ranges
//! between replicas.

#![warn(missing_docs)]

pub mod btree;
pub mod error;
pub mod store;

pub use error::{Result, VesperError};
