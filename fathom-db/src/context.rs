//! `DatabaseContext` (§4.8): the long-lived object one `open()` call hands
//! back, wiring every per-process/per-cluster-handle component together and
//! dispatching `set_option` per the "direct mutation vs. transaction
//! default" split.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fathom_base::{DatabaseOption, Key, KeyRange, Knobs, Result, TransactionOptions};
use fathom_failure::{FailureMonitor, TssRegistry};
use fathom_locations::LocationCache;
use fathom_stream::StreamContext;
use fathom_tss::{MismatchRecord, TssMismatchHandler, TssPolicy};
use fathom_txn::{Transaction, TxnServices};
use fathom_wire::{ProxyId, Transport};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::counters::{Counters, CountersSnapshot};
use crate::metadata::MetadataVersionRing;

/// Persisted cluster-descriptor state (§6): `name:id@host:port,…`. Produced
/// by an out-of-scope leader/coordinator monitor collaborator; a
/// `DatabaseContext` only ever subscribes to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterDescriptor {
    pub name: String,
    pub coordinators: Vec<ProxyId>,
    pub commit_proxy: ProxyId,
}

#[derive(Clone, Debug, Default)]
struct Locality {
    machine_id: Option<String>,
    datacenter_id: Option<String>,
}

/// A point-in-time view for status readers; see [`DatabaseContext::status`].
#[derive(Clone, Debug)]
pub struct DatabaseStatus {
    pub cluster: ClusterDescriptor,
    pub known_locations: usize,
    pub cached_locations: usize,
    pub live_watches: usize,
    pub metadata_ring_len: usize,
    pub counters: CountersSnapshot,
}

pub struct DatabaseContext {
    pub services: Arc<TxnServices>,
    metadata: Arc<MetadataVersionRing>,
    tss_registry: TssRegistry,
    counters: Arc<Counters>,
    transaction_defaults: Mutex<TransactionOptions>,
    locality: Mutex<Locality>,
    snapshot_ryw: AtomicBool,
    use_config_database: AtomicBool,
    tss_mismatch_tx: mpsc::Sender<MismatchRecord>,
    cluster: watch::Sender<ClusterDescriptor>,
}

impl DatabaseContext {
    /// Opens a context against `transport` with the cluster's initial
    /// descriptor. Spawns the TSS mismatch-drain task (§4.10) for the
    /// lifetime of the returned `Arc`; dropping every clone drops the
    /// channel sender and the drain task exits.
    pub fn open(transport: Arc<dyn Transport>, cluster: ClusterDescriptor, knobs: Knobs) -> Arc<Self> {
        let coordinator = *cluster.coordinators.first().unwrap_or(&cluster.commit_proxy);
        let metadata = Arc::new(MetadataVersionRing::new(knobs.metadata_version_ring_size));

        let tss_registry = TssRegistry::new();
        let (tss_tx, tss_rx) = mpsc::channel(1024);
        let services = TxnServices::with_metadata_and_tss(
            transport,
            coordinator,
            cluster.commit_proxy,
            knobs,
            metadata.clone(),
            tss_registry.clone(),
            tss_tx.clone(),
        );

        let handler = TssMismatchHandler::new(services.clone(), tss_registry.clone(), TssPolicy::default());
        tokio::spawn(async move {
            handler.run(tss_rx).await;
        });

        let (cluster_tx, _cluster_rx) = watch::channel(cluster);

        Arc::new(DatabaseContext {
            services,
            metadata,
            tss_registry,
            counters: Arc::new(Counters::default()),
            transaction_defaults: Mutex::new(TransactionOptions::default()),
            locality: Mutex::new(Locality::default()),
            snapshot_ryw: AtomicBool::new(false),
            use_config_database: AtomicBool::new(false),
            tss_mismatch_tx: tss_tx,
            cluster: cluster_tx,
        })
    }

    /// A fresh transaction stamped with the current transaction-default
    /// options (§4.8 "Option handling").
    pub fn create_transaction(&self) -> Transaction {
        let options = self.transaction_defaults.lock().clone();
        Transaction::new(self.services.clone(), options)
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn tss_registry(&self) -> &TssRegistry {
        &self.tss_registry
    }

    /// Hand-off point for the dispatch path (§4.2) once it detects a
    /// primary/shadow reply mismatch; not itself part of this crate.
    pub fn tss_mismatch_sender(&self) -> mpsc::Sender<MismatchRecord> {
        self.tss_mismatch_tx.clone()
    }

    /// A `fathom-stream::stream_range` context sharing this database's
    /// transport, location cache, and failure monitor (§4.5).
    pub fn stream_context(&self, coordinator: ProxyId) -> Arc<StreamContext> {
        Arc::new(StreamContext {
            transport: self.services.transport.clone(),
            locations: self.services.locations.clone(),
            failure: self.services.failure.clone(),
            coordinator,
            wrong_shard_server_delay: self.services.knobs.wrong_shard_server_delay,
            buffered_fragments_limit: self.services.knobs.rangestream_buffered_fragments_limit,
            fragment_split_bytes: self.services.knobs.rangestream_fragment_split_bytes,
            tss_registry: self.services.tss_registry.clone(),
            tss_mismatch_tx: self.services.tss_mismatch_tx.clone(),
            load_balance_tss_timeout: self.services.knobs.load_balance_tss_timeout,
        })
    }

    /// Records a new descriptor from the (external) coordinator-monitor
    /// feed and invalidates the location cache: a coordinator/commit-proxy
    /// change means every cached shard assignment could be stale.
    pub fn update_cluster_descriptor(&self, descriptor: ClusterDescriptor) {
        info!(target: "fathom", name = %descriptor.name, "cluster descriptor updated");
        self.cluster.send_replace(descriptor);
        self.invalidate_all_locations();
        self.rearm_watches_after_reconnect();
    }

    /// §4.4.4 "re-arm every live watch after a connection-file change": a
    /// watch's old `Ssi` may not survive a coordinator/commit-proxy change,
    /// so every live watch is reissued against a freshly resolved replica.
    /// Runs in the background; `update_cluster_descriptor` itself doesn't
    /// wait on it.
    fn rearm_watches_after_reconnect(&self) {
        let watches = self.services.watches.clone();
        let transport = self.services.transport.clone();
        let locations = self.services.locations.clone();
        let failure = self.services.failure.clone();
        let coordinator = self.services.coordinator;
        tokio::spawn(async move {
            watches
                .rearm_all(|key| {
                    let transport = transport.clone();
                    let locations = locations.clone();
                    let failure = failure.clone();
                    async move { resolve_ssi(&transport, &locations, coordinator, &key, &failure).await }
                })
                .await;
        });
    }

    pub fn cluster_descriptor(&self) -> ClusterDescriptor {
        self.cluster.borrow().clone()
    }

    fn invalidate_all_locations(&self) {
        let mut cache = self.services.locations.lock();
        cache.invalidate(&KeyRange::all());
        self.counters.record_location_cache_eviction();
    }

    /// §4.8 "Option handling": each database option is either a default
    /// stamped onto every future transaction or a direct mutation of
    /// context state; locality changes additionally invalidate every
    /// cached location, since shard replica preference depends on it.
    pub fn set_option(&self, option: DatabaseOption) -> Result<()> {
        match option {
            DatabaseOption::LocationCacheSize(size) => {
                let mut cache = self.services.locations.lock();
                *cache = LocationCache::with_eviction_batch(size, self.services.knobs.cache_eviction_batch);
                debug!(target: "fathom", size, "location cache resized");
            }
            DatabaseOption::MachineId(id) => {
                self.locality.lock().machine_id = Some(id);
                self.invalidate_all_locations();
            }
            DatabaseOption::DatacenterId(id) => {
                self.locality.lock().datacenter_id = Some(id);
                self.invalidate_all_locations();
            }
            DatabaseOption::MaxWatches(limit) => {
                self.services.set_max_watches(limit);
            }
            DatabaseOption::SnapshotRywEnable => self.snapshot_ryw.store(true, Ordering::Relaxed),
            DatabaseOption::SnapshotRywDisable => self.snapshot_ryw.store(false, Ordering::Relaxed),
            DatabaseOption::TransactionLoggingEnable(id) => {
                let mut defaults = self.transaction_defaults.lock();
                defaults.log_transaction = true;
                defaults.debug_transaction_identifier = Some(id);
            }
            DatabaseOption::TransactionLoggingDisable => {
                let mut defaults = self.transaction_defaults.lock();
                defaults.log_transaction = false;
                defaults.debug_transaction_identifier = None;
            }
            DatabaseOption::UseConfigDatabase => self.use_config_database.store(true, Ordering::Relaxed),
            DatabaseOption::TestCausalReadRisky => {
                self.transaction_defaults.lock().causal_read_risky = true;
            }
        }
        Ok(())
    }

    pub fn max_watches(&self) -> usize {
        self.services.max_watches()
    }

    pub fn snapshot_ryw_enabled(&self) -> bool {
        self.snapshot_ryw.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot for a health-metrics/status endpoint.
    pub fn status(&self) -> DatabaseStatus {
        let cache = self.services.locations.lock();
        DatabaseStatus {
            cluster: self.cluster_descriptor(),
            known_locations: cache.known_count(),
            cached_locations: cache.len(),
            live_watches: self.services.watches.live_count(),
            metadata_ring_len: self.metadata.len(),
            counters: self.counters.snapshot(),
        }
    }
}

/// Minimal location resolve for re-arming: cache hit, or one
/// `GetKeyServerLocations` round trip against `coordinator`, then the same
/// queue-depth-aware pick every other call site uses.
async fn resolve_ssi(
    transport: &Arc<dyn Transport>,
    locations: &Mutex<LocationCache>,
    coordinator: ProxyId,
    key: &Key,
    failure: &FailureMonitor,
) -> Option<fathom_wire::Ssi> {
    let cached = {
        let cache = locations.lock();
        cache.get(key, false).1
    };
    let info = match cached {
        Some(info) => info,
        None => {
            let req = fathom_wire::protocol::GetKeyServerLocationsRequest { begin: key.clone(), end: None, limit: 1, reverse: false };
            let reply = transport.get_key_server_locations(coordinator, req).await.ok()?;
            let (range, ssis) = reply.results.into_iter().next()?;
            let info = Arc::new(fathom_wire::LocationInfo::new(ssis, false));
            locations.lock().insert(&range, info.clone());
            info
        }
    };
    fathom_failure::pick_replica(&info, failure)
}

#[cfg(test)]
mod test {
    use super::*;
    use fathom_base::Key;
    use fathom_wire::mock::MockTransport;
    use test_log::test;

    fn descriptor(mock: &Arc<MockTransport>) -> ClusterDescriptor {
        ClusterDescriptor { name: "test".into(), coordinators: vec![mock.proxy()], commit_proxy: mock.proxy() }
    }

    #[test(tokio::test)]
    async fn create_transaction_stamps_defaults() {
        let mock = MockTransport::new();
        let ctx = DatabaseContext::open(mock.clone(), descriptor(&mock), Knobs::default());
        ctx.set_option(DatabaseOption::TestCausalReadRisky).unwrap();
        let txn = ctx.create_transaction();
        assert!(txn_causal_read_risky(&txn));
    }

    fn txn_causal_read_risky(txn: &Transaction) -> bool {
        txn.options().causal_read_risky
    }

    #[test(tokio::test)]
    async fn location_cache_size_option_replaces_cache() {
        let mock = MockTransport::new();
        let ctx = DatabaseContext::open(mock.clone(), descriptor(&mock), Knobs::default());
        ctx.set_option(DatabaseOption::LocationCacheSize(4)).unwrap();
        let status = ctx.status();
        assert_eq!(status.cached_locations, 1); // fresh cache: just the root sentinel entry
    }

    #[test(tokio::test)]
    async fn machine_id_change_invalidates_locations() {
        let mock = MockTransport::new();
        let ctx = DatabaseContext::open(mock.clone(), descriptor(&mock), Knobs::default());
        {
            let mut cache = ctx.services.locations.lock();
            cache.insert(
                &KeyRange::new(Key::from("a"), Key::from("z")),
                Arc::new(fathom_wire::LocationInfo::new(vec![], false)),
            );
        }
        assert_eq!(ctx.status().known_locations, 1);
        ctx.set_option(DatabaseOption::MachineId("m1".into())).unwrap();
        assert_eq!(ctx.status().known_locations, 0);
    }

    #[test(tokio::test)]
    async fn tss_mismatch_sender_reaches_handler() {
        let mock = MockTransport::new();
        let ctx = DatabaseContext::open(mock.clone(), descriptor(&mock), Knobs::default());
        ctx.tss_registry().install(fathom_wire::SsiId(1), fathom_wire::SsiId(2));
        let tx = ctx.tss_mismatch_sender();
        tx.send(MismatchRecord { shadow_id: fathom_wire::SsiId(2), timestamp: 1, mismatch_uid: 1, trace: "x".into() })
            .await
            .unwrap();
        // Give the spawned drain task a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(ctx.tss_registry().shadow_for(fathom_wire::SsiId(1)), None);
    }
}
