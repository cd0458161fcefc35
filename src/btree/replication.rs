//! Replication host metadata carried with pages and page references.
//!
//! Host identifiers are opaque tokens assigned by the distributed layer;
//! the engine only stores them, copies them onto page references, and
//! groups pages by them when partitioning a key range.

use smallvec::SmallVec;
use std::sync::Arc;

/// Unordered set of replica endpoint identifiers attached to a page.
///
/// Deduplicated, insertion-ordered, cheap to clone. Typical deployments
/// replicate a page to a handful of endpoints, so storage is inline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostSet {
    hosts: SmallVec<[Arc<str>; 3]>,
}

impl HostSet {
    /// An empty host set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an endpoint; returns false if it was already present.
    pub fn insert(&mut self, endpoint: &str) -> bool {
        if self.contains(endpoint) {
            return false;
        }
        self.hosts.push(Arc::from(endpoint));
        true
    }

    /// Whether `endpoint` is in the set.
    pub fn contains(&self, endpoint: &str) -> bool {
        self.hosts.iter().any(|h| h.as_ref() == endpoint)
    }

    /// Iterates the endpoints in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<str>> {
        self.hosts.iter()
    }

    /// Number of endpoints in the set.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Whether the set would be empty once `exclude` is removed.
    pub(crate) fn only_contains(&self, exclude: &str) -> bool {
        self.hosts.len() == 1 && self.hosts[0].as_ref() == exclude
    }

    /// Adds every endpoint of `other` not already present.
    pub(crate) fn merge(&mut self, other: &HostSet) {
        for host in &other.hosts {
            if !self.contains(host.as_ref()) {
                self.hosts.push(Arc::clone(host));
            }
        }
    }
}

impl<'a> FromIterator<&'a str> for HostSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut set = Self::new();
        for endpoint in iter {
            set.insert(endpoint);
        }
        set
    }
}
