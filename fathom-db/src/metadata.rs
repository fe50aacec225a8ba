//! Concrete metadata-version ring cache (§3 `Metadata-Version Cache`):
//! "bounded ring of `(version, metadata_version_value)` pairs;
//! binary-searchable; written by every successful GRV and commit."
//!
//! Entries are pushed in strictly increasing version order (GRV and commit
//! replies are both monotonic within one `DatabaseContext`), so a plain
//! sorted `VecDeque` gives us the binary search for free without needing a
//! `BTreeMap`'s per-entry allocation overhead.

use std::collections::VecDeque;

use fathom_base::{Value, Version};
use fathom_txn::MetadataVersionReader;
use parking_lot::Mutex;

pub struct MetadataVersionRing {
    inner: Mutex<VecDeque<(Version, Option<Value>)>>,
    capacity: usize,
}

impl MetadataVersionRing {
    pub fn new(capacity: usize) -> Self {
        MetadataVersionRing { inner: Mutex::new(VecDeque::with_capacity(capacity)), capacity: capacity.max(1) }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataVersionReader for MetadataVersionRing {
    fn lookup(&self, version: Version) -> Option<Value> {
        let mut ring = self.inner.lock();
        let slice = ring.make_contiguous();
        slice.binary_search_by_key(&version, |(v, _)| *v).ok().and_then(|i| slice[i].1.clone())
    }

    /// Ignores out-of-order or duplicate writes rather than erroring; two
    /// concurrent GRVs at the same version racing to record is expected,
    /// and only the ring's monotonic invariant matters to callers.
    fn record(&self, version: Version, value: Option<Value>) {
        let mut ring = self.inner.lock();
        if let Some((last, _)) = ring.back() {
            if version <= *last {
                return;
            }
        }
        ring.push_back((version, value));
        if ring.len() > self.capacity {
            ring.pop_front();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn records_and_finds_exact_version() {
        let ring = MetadataVersionRing::new(4);
        ring.record(Version(10), Some(Value(b"a".to_vec())));
        ring.record(Version(20), Some(Value(b"b".to_vec())));
        assert_eq!(ring.lookup(Version(10)), Some(Value(b"a".to_vec())));
        assert_eq!(ring.lookup(Version(20)), Some(Value(b"b".to_vec())));
        assert_eq!(ring.lookup(Version(15)), None);
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let ring = MetadataVersionRing::new(2);
        ring.record(Version(1), None);
        ring.record(Version(2), None);
        ring.record(Version(3), None);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.lookup(Version(1)), None);
        // Version(1) was recorded with value None too, so absence from the
        // ring and "recorded as no metadata key" both read as `None` here;
        // check via `len` above that eviction actually happened.
    }

    #[test]
    fn ignores_non_monotonic_writes() {
        let ring = MetadataVersionRing::new(4);
        ring.record(Version(10), Some(Value(b"a".to_vec())));
        ring.record(Version(5), Some(Value(b"stale".to_vec())));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.lookup(Version(10)), Some(Value(b"a".to_vec())));
    }
}
