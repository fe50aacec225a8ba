// The shared, per-`DatabaseContext` services a `Transaction` borrows from.
// `fathom-db` owns the concrete instance and constructs one `TxnServices`
// per context; every `Transaction` holds an `Arc` clone of it (§4.8).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fathom_base::{Knobs, Result, Value, Version};
use fathom_failure::{FailureMonitor, MismatchRecord, TssRegistry};
use fathom_grv::GrvBatcherSet;
use fathom_locations::LocationCache;
use fathom_watch::WatchMap;
use fathom_wire::{ProxyId, Transport};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Seam over the metadata-version ring cache (§3 `Metadata-Version Cache`),
/// which `fathom-db` owns concretely; defined here so `fathom-txn` doesn't
/// need to depend upward on `fathom-db` to read and update it.
pub trait MetadataVersionReader: Send + Sync {
    fn lookup(&self, version: Version) -> Option<Value>;
    fn record(&self, version: Version, value: Option<Value>);
}

/// A reader that never has anything cached; used when a context hasn't
/// wired a real ring (tests, or a context with the feature unused).
pub struct NullMetadataVersionReader;

impl MetadataVersionReader for NullMetadataVersionReader {
    fn lookup(&self, _version: Version) -> Option<Value> {
        None
    }
    fn record(&self, _version: Version, _value: Option<Value>) {}
}

pub struct TxnServices {
    pub transport: Arc<dyn Transport>,
    pub locations: Arc<Mutex<LocationCache>>,
    pub failure: FailureMonitor,
    pub grv: Arc<GrvBatcherSet>,
    pub watches: Arc<WatchMap>,
    pub metadata: Arc<dyn MetadataVersionReader>,
    pub knobs: Knobs,
    pub coordinator: ProxyId,
    pub commit_proxy: ProxyId,
    /// TSS shadow pairing table consulted by the dispatcher (§4.2, §4.4.5).
    pub tss_registry: TssRegistry,
    /// Where the dispatcher reports a duplicated-shadow mismatch or
    /// timeout (§4.10); `fathom-db` owns the receiving
    /// `TssMismatchHandler`.
    pub tss_mismatch_tx: mpsc::Sender<MismatchRecord>,
    max_watches: AtomicUsize,
}

impl TxnServices {
    pub fn new(
        transport: Arc<dyn Transport>,
        coordinator: ProxyId,
        commit_proxy: ProxyId,
        knobs: Knobs,
    ) -> Arc<Self> {
        Self::with_metadata(transport, coordinator, commit_proxy, knobs, Arc::new(NullMetadataVersionReader))
    }

    /// Same as [`Self::new`], but with a caller-supplied metadata-version
    /// reader/writer instead of the null stub. `fathom-db` uses this to
    /// wire in its concrete ring cache (§3 `Metadata-Version Cache`).
    pub fn with_metadata(
        transport: Arc<dyn Transport>,
        coordinator: ProxyId,
        commit_proxy: ProxyId,
        knobs: Knobs,
        metadata: Arc<dyn MetadataVersionReader>,
    ) -> Arc<Self> {
        // No TSS pairs are ever installed on this empty registry, so
        // `shadow_for` always returns `None` and this sender is never
        // exercised; a context that wants real TSS duplication wires
        // `with_metadata_and_tss` instead.
        let (tss_mismatch_tx, _unused_rx) = mpsc::channel(1);
        Self::with_metadata_and_tss(transport, coordinator, commit_proxy, knobs, metadata, TssRegistry::new(), tss_mismatch_tx)
    }

    /// Same as [`Self::with_metadata`], additionally wiring the shared TSS
    /// registry and mismatch channel `fathom-db` spawns a
    /// `TssMismatchHandler` against (§4.2, §4.10).
    #[allow(clippy::too_many_arguments)]
    pub fn with_metadata_and_tss(
        transport: Arc<dyn Transport>,
        coordinator: ProxyId,
        commit_proxy: ProxyId,
        knobs: Knobs,
        metadata: Arc<dyn MetadataVersionReader>,
        tss_registry: TssRegistry,
        tss_mismatch_tx: mpsc::Sender<MismatchRecord>,
    ) -> Arc<Self> {
        let grv = Arc::new(GrvBatcherSet::new(commit_proxy, transport.clone(), knobs.clone()));
        let watches = WatchMap::new(transport.clone());
        Arc::new(TxnServices {
            transport,
            locations: Arc::new(Mutex::new(LocationCache::with_eviction_batch(knobs.location_cache_size, knobs.cache_eviction_batch))),
            failure: FailureMonitor::new(),
            grv,
            watches,
            metadata,
            knobs,
            coordinator,
            commit_proxy,
            tss_registry,
            tss_mismatch_tx,
            max_watches: AtomicUsize::new(usize::MAX),
        })
    }

    /// Current `MaxWatches` ceiling (§6 `DatabaseOption::MaxWatches`);
    /// `usize::MAX` means unset/unlimited.
    pub fn max_watches(&self) -> usize {
        self.max_watches.load(Ordering::Relaxed)
    }

    pub fn set_max_watches(&self, limit: usize) {
        self.max_watches.store(limit, Ordering::Relaxed);
    }
}
