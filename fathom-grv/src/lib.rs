//! GRV batching (§4.3): coalesce concurrent `getReadVersion` calls from a
//! single client process into one RPC per `(priority, flags)` class within
//! an adaptively sized window, and track the throttle table piggybacked on
//! every reply.

mod batcher;
mod throttle;

pub use batcher::{GrvBatcher, GrvBatcherSet, GrvResult, VersionRequestHandle};
pub use throttle::ThrottleTable;

#[cfg(test)]
mod test {
    use super::*;
    use fathom_base::{Knobs, Priority};
    use fathom_wire::mock::MockTransport;
    use fathom_wire::{ProxyId, TransactionFlags};
    use test_log::test;

    #[tokio::test]
    async fn batches_concurrent_requests_into_one_rpc_with_shared_version() {
        let transport = MockTransport::new();
        let before = transport.current_version();

        let mut knobs = Knobs::default();
        knobs.grv_batch_timeout = std::time::Duration::from_millis(50);
        let set = GrvBatcherSet::new(ProxyId(0), transport.clone(), knobs);

        let flags = TransactionFlags::default();
        let h1 = set.submit(Priority::Default, flags, vec![], None).await;
        let h2 = set.submit(Priority::Default, flags, vec![], None).await;
        let h3 = set.submit(Priority::Default, flags, vec![], None).await;

        let r1 = h1.recv().await.unwrap();
        let r2 = h2.recv().await.unwrap();
        let r3 = h3.recv().await.unwrap();

        assert_eq!(r1.version, r2.version);
        assert_eq!(r2.version, r3.version);
        assert!(r1.version.0 >= before.0);
    }

    #[tokio::test]
    async fn distinct_priority_classes_get_independent_batchers() {
        let transport = MockTransport::new();
        let knobs = Knobs::default();
        let set = GrvBatcherSet::new(ProxyId(0), transport, knobs);
        let flags = TransactionFlags::default();

        let a = set.submit(Priority::Default, flags, vec![], None).await;
        let b = set.submit(Priority::Batch, flags, vec![], None).await;

        a.recv().await.unwrap();
        b.recv().await.unwrap();
    }
}
