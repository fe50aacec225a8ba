//! §7 "Counts each class in the database-level metrics", plus the handful
//! of other numbers status readers are expected to answer. Everything of
//! substance is already logged via `tracing::event!` at the call site
//! (retry classification, cache eviction, batch dispatch, TSS mismatch);
//! this struct exists only so a caller can read a plain number back out of
//! the process without scraping trace output.

use std::sync::atomic::{AtomicU64, Ordering};

use fathom_base::RetryClass;

#[derive(Default)]
pub struct Counters {
    pub transient_retries: AtomicU64,
    pub version_drift_retries: AtomicU64,
    pub shard_cache_invalidations: AtomicU64,
    pub fatal_errors: AtomicU64,
    pub location_cache_evictions: AtomicU64,
    pub grv_batches_dispatched: AtomicU64,
    pub tss_mismatches: AtomicU64,
    pub commits_succeeded: AtomicU64,
    pub commits_conflicted: AtomicU64,
}

/// Plain-old-data snapshot for status readers; atomics don't implement
/// `Clone`, so a caller who wants to hold values across an await point
/// reads this instead of the live struct.
#[derive(Clone, Copy, Debug, Default)]
pub struct CountersSnapshot {
    pub transient_retries: u64,
    pub version_drift_retries: u64,
    pub shard_cache_invalidations: u64,
    pub fatal_errors: u64,
    pub location_cache_evictions: u64,
    pub grv_batches_dispatched: u64,
    pub tss_mismatches: u64,
    pub commits_succeeded: u64,
    pub commits_conflicted: u64,
}

impl Counters {
    pub fn record_retry_class(&self, class: RetryClass) {
        let counter = match class {
            RetryClass::TransientRetry => &self.transient_retries,
            RetryClass::VersionDrift => &self.version_drift_retries,
            RetryClass::ShardCacheInvalidation => &self.shard_cache_invalidations,
            RetryClass::Fatal => &self.fatal_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_location_cache_eviction(&self) {
        self.location_cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grv_batch_dispatched(&self) {
        self.grv_batches_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tss_mismatch(&self) {
        self.tss_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_succeeded(&self) {
        self.commits_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_conflicted(&self) {
        self.commits_conflicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
            version_drift_retries: self.version_drift_retries.load(Ordering::Relaxed),
            shard_cache_invalidations: self.shard_cache_invalidations.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
            location_cache_evictions: self.location_cache_evictions.load(Ordering::Relaxed),
            grv_batches_dispatched: self.grv_batches_dispatched.load(Ordering::Relaxed),
            tss_mismatches: self.tss_mismatches.load(Ordering::Relaxed),
            commits_succeeded: self.commits_succeeded.load(Ordering::Relaxed),
            commits_conflicted: self.commits_conflicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn records_and_reads_back() {
        let counters = Counters::default();
        counters.record_retry_class(RetryClass::TransientRetry);
        counters.record_retry_class(RetryClass::Fatal);
        counters.record_tss_mismatch();
        let snap = counters.snapshot();
        assert_eq!(snap.transient_retries, 1);
        assert_eq!(snap.fatal_errors, 1);
        assert_eq!(snap.tss_mismatches, 1);
    }
}
