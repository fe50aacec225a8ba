//! Public facade for the transaction-execution runtime of a distributed,
//! strictly-serializable key-value database client: [`Database`] and
//! [`Transaction`], the key/value/version/selector types, the option
//! enums, and the opaque [`Error`]/[`ErrorKind`] taxonomy.
//!
//! Everything here is a thin re-export or a small convenience wrapper; the
//! actual read pipeline, commit pipeline, retry loop, caches, and
//! background tasks live in the `fathom-*` crates this one assembles.

use std::sync::Arc;

use futures::future::BoxFuture;

pub use fathom_base::{
    err, key_after, kind_err, metadata_version_key, self_conflict_key, DatabaseOption,
    DistributedClientTracer, Error, ErrorKind, Key, KeyRange, KeySelector, Knobs, NetworkOption,
    Priority, Result, RetryClass, TraceFormat, TransactionOptions, Value, Version, Versionstamp,
};
pub use fathom_db::{ClusterDescriptor, Counters, CountersSnapshot, DatabaseStatus};
pub use fathom_tss::MismatchRecord;
pub use fathom_txn::{CommitOutcome, Transaction};
pub use fathom_wire::{ProxyId, Ssi, SsiId, Transport};

use fathom_db::DatabaseContext;
use tokio::sync::mpsc;

/// A handle to one cluster connection. Cheap to clone: internally an
/// `Arc<DatabaseContext>`, the same object every [`Transaction`] it hands
/// out borrows its services from.
#[derive(Clone)]
pub struct Database {
    context: Arc<DatabaseContext>,
}

impl Database {
    /// Opens a context against `transport`, starting from `cluster`'s
    /// initial descriptor. `transport` is the collaborator-supplied wire
    /// codec/RPC implementation (§6); this crate never constructs one.
    pub fn open(transport: Arc<dyn Transport>, cluster: ClusterDescriptor, knobs: Knobs) -> Self {
        Database { context: DatabaseContext::open(transport, cluster, knobs) }
    }

    pub fn create_transaction(&self) -> Transaction {
        self.context.create_transaction()
    }

    pub fn set_option(&self, option: DatabaseOption) -> Result<()> {
        self.context.set_option(option)
    }

    pub fn status(&self) -> DatabaseStatus {
        self.context.status()
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.context.counters().snapshot()
    }

    pub fn update_cluster_descriptor(&self, descriptor: ClusterDescriptor) {
        self.context.update_cluster_descriptor(descriptor)
    }

    pub fn cluster_descriptor(&self) -> ClusterDescriptor {
        self.context.cluster_descriptor()
    }

    /// Feed for the dispatch path's primary/shadow mismatch reports (§4.2,
    /// §4.10); not produced anywhere in this workspace, since request
    /// duplication and comparison is part of the out-of-scope transport.
    pub fn tss_mismatch_sender(&self) -> mpsc::Sender<MismatchRecord> {
        self.context.tss_mismatch_sender()
    }

    /// §7 "framework-handled" retry loop: runs `body` against a fresh
    /// transaction, commits, and on conflict or a retriable error calls
    /// `on_error` and tries again. User-fatal errors from either `body` or
    /// the commit propagate immediately (§7 "Propagation policy").
    pub async fn transact<T>(
        &self,
        mut body: impl for<'a> FnMut(&'a mut Transaction) -> BoxFuture<'a, Result<T>>,
    ) -> Result<T> {
        loop {
            let mut txn = self.create_transaction();
            let value = match body(&mut txn).await {
                Ok(value) => value,
                Err(e) => {
                    txn.on_error(e).await?;
                    continue;
                }
            };
            match txn.commit().await {
                Ok(CommitOutcome::Committed(_)) | Ok(CommitOutcome::UnknownButDidNotCommit) => {
                    return Ok(value);
                }
                Ok(CommitOutcome::Conflict) => {
                    txn.on_error(kind_err(ErrorKind::NotCommitted, "commit conflict")).await?;
                }
                Ok(CommitOutcome::TrulyUnknown) => {
                    return Err(kind_err(ErrorKind::CommitUnknownResult, "commit outcome unknown"));
                }
                Err(e) => {
                    txn.on_error(e).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fathom_wire::mock::MockTransport;
    use test_log::test;

    fn cluster(mock: &Arc<MockTransport>) -> ClusterDescriptor {
        ClusterDescriptor { name: "test".into(), coordinators: vec![mock.proxy()], commit_proxy: mock.proxy() }
    }

    #[test(tokio::test)]
    async fn transact_commits_a_set_on_first_try() {
        let mock = MockTransport::new();
        let db = Database::open(mock.clone(), cluster(&mock), Knobs::default());

        db.transact(|txn| {
            Box::pin(async move {
                txn.set(Key(b"k".to_vec()), Value(b"v".to_vec()))?;
                Ok(())
            })
        })
        .await
        .unwrap();

        let mut check = db.create_transaction();
        assert_eq!(check.get(Key(b"k".to_vec()), false).await.unwrap(), Some(Value(b"v".to_vec())));
    }

    #[test(tokio::test)]
    async fn transact_retries_through_a_commit_conflict() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mock = MockTransport::new();
        mock.seed(Key(b"x".to_vec()), Value(b"0".to_vec()));
        let db = Database::open(mock.clone(), cluster(&mock), Knobs::default());

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_for_closure = attempts.clone();
        let db_for_closure = db.clone();
        db.transact(move |txn| {
            // Only the first attempt races a concurrent committer, so the
            // second attempt is expected to succeed cleanly.
            let first_attempt = attempts_for_closure.fetch_add(1, Ordering::SeqCst) == 0;
            let db = db_for_closure.clone();
            Box::pin(async move {
                let _ = txn.get(Key(b"x".to_vec()), false).await?;
                if first_attempt {
                    let mut racer = db.create_transaction();
                    let _ = racer.get(Key(b"x".to_vec()), false).await?;
                    racer.set(Key(b"x".to_vec()), Value(b"1".to_vec()))?;
                    racer.commit().await?;
                }
                txn.set(Key(b"x".to_vec()), Value(b"2".to_vec()))?;
                Ok(())
            })
        })
        .await
        .unwrap();

        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }
}
