//! The transaction-execution runtime: read pipeline (§4.4), commit pipeline
//! (§4.6), retry/backoff classification (§4.7), and the services a
//! `Transaction` borrows from its owning `DatabaseContext` (§4.8).
//!
//! `fathom-db` wires a real [`TxnServices`] (transport, location cache,
//! failure monitor, GRV batcher set, watch map, metadata-version cache) and
//! hands out [`Transaction`]s from it; this crate knows nothing about
//! `fathom-db` itself, only the [`MetadataVersionReader`] seam it implements.

mod commit;
mod retry;
mod services;
mod transaction;

pub use commit::CommitOutcome;
pub use fathom_failure::pick_replica;
pub use retry::{Backoff, RetryAction, TagThrottleContext};
pub use services::{MetadataVersionReader, NullMetadataVersionReader, TxnServices};
pub use transaction::{Transaction, WatchHandle};

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use fathom_base::{ErrorKind, Key, Knobs, TransactionOptions, Value, Version};
    use fathom_wire::mock::MockTransport;
    use test_log::test;

    use super::*;

    fn services_over(mock: &Arc<MockTransport>) -> Arc<TxnServices> {
        TxnServices::new(mock.clone(), mock.proxy(), mock.proxy(), Knobs::default())
    }

    /// §8 scenario 3 "Commit conflict": T1 reads "x", T2 writes "x" and
    /// commits first, T1's commit reports `Conflict`; `on_error` resets T1
    /// and a second attempt succeeds.
    #[test(tokio::test)]
    async fn commit_conflict_then_retry_succeeds() {
        let mock = MockTransport::new();
        mock.seed(Key(b"x".to_vec()), Value(b"0".to_vec()));
        let services = services_over(&mock);

        let mut t1 = Transaction::new(services.clone(), TransactionOptions::default());
        let _ = t1.get(Key(b"x".to_vec()), false).await.unwrap();

        let mut t2 = Transaction::new(services.clone(), TransactionOptions::default());
        let _ = t2.get(Key(b"x".to_vec()), false).await.unwrap();
        t2.set(Key(b"x".to_vec()), Value(b"1".to_vec())).unwrap();
        assert_eq!(t2.commit().await.unwrap(), CommitOutcome::Committed(Version(2)));

        t1.set(Key(b"x".to_vec()), Value(b"2".to_vec())).unwrap();
        assert_eq!(t1.commit().await.unwrap(), CommitOutcome::Conflict);

        t1.on_error(fathom_base::kind_err(ErrorKind::NotCommitted, "conflict")).await.unwrap();
        let _ = t1.get(Key(b"x".to_vec()), false).await.unwrap();
        t1.set(Key(b"x".to_vec()), Value(b"2".to_vec())).unwrap();
        assert!(matches!(t1.commit().await.unwrap(), CommitOutcome::Committed(_)));
    }

    /// §8 scenario 4 "commit_unknown_result recovery": the commit RPC fails
    /// with `CommitUnknownResult` after the mutation never actually lands
    /// (our mock fails before applying); the dummy-transaction check must
    /// find the self-conflict key untouched and report
    /// `UnknownButDidNotCommit` rather than leaving the caller to assume the
    /// write committed.
    #[test(tokio::test)]
    async fn commit_unknown_result_recovers_via_dummy_transaction() {
        let mock = MockTransport::new();
        let services = services_over(&mock);

        let mut txn = Transaction::new(services.clone(), TransactionOptions::default());
        let _ = txn.get_read_version().await.unwrap();
        txn.set(Key(b"y".to_vec()), Value(b"1".to_vec())).unwrap();

        mock.inject_commit_failure(ErrorKind::CommitUnknownResult);
        let outcome = txn.commit().await.unwrap();
        assert_eq!(outcome, CommitOutcome::UnknownButDidNotCommit);

        // The original mutation never applied; only the dummy transaction's
        // marker write against the self-conflict key did.
        assert!(txn.get(Key(b"y".to_vec()), true).await.unwrap().is_none());
    }

    #[test(tokio::test)]
    async fn on_error_propagates_fatal_kinds_without_resetting() {
        let mock = MockTransport::new();
        let services = services_over(&mock);
        let mut txn = Transaction::new(services, TransactionOptions::default());
        txn.set(Key(b"z".to_vec()), Value(b"1".to_vec())).unwrap();
        let err = fathom_base::kind_err(ErrorKind::KeyTooLarge, "too large");
        let result = txn.on_error(err).await;
        assert!(result.is_err());
        // Fatal errors don't reset; the buffered mutation should survive.
        assert_eq!(txn.mutations.len(), 1);
    }
}
