// Failure monitor and TSS registry (§4.2). Both are small maps kept
// up to date by the load balancer and the dispatcher respectively; neither
// owns any retry policy of its own (that's `fathom-txn::retry`).

mod dispatch;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fathom_wire::SsiId;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

pub use dispatch::{dispatch, pick_replica};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointStatus {
    Ok,
    Failed,
}

struct Entry {
    tx: watch::Sender<EndpointStatus>,
}

/// Per-endpoint OK/FAILED status plus in-flight request count. Callers
/// query before dispatch (§4.4.5 load balancer: "prefer replicas whose
/// failure-monitor state is OK and whose per-endpoint queue depth is
/// lowest") and subscribe to the "became OK" transition to notice recovery
/// without polling.
#[derive(Clone)]
pub struct FailureMonitor {
    inner: Arc<Mutex<BTreeMap<SsiId, Entry>>>,
    in_flight: Arc<Mutex<BTreeMap<SsiId, u32>>>,
}

impl Default for FailureMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureMonitor {
    pub fn new() -> Self {
        FailureMonitor { inner: Arc::new(Mutex::new(BTreeMap::new())), in_flight: Arc::new(Mutex::new(BTreeMap::new())) }
    }

    fn entry_tx(&self, id: SsiId) -> watch::Sender<EndpointStatus> {
        let mut inner = self.inner.lock();
        inner
            .entry(id)
            .or_insert_with(|| {
                let (tx, _rx) = watch::channel(EndpointStatus::Ok);
                Entry { tx }
            })
            .tx
            .clone()
    }

    pub fn status(&self, id: SsiId) -> EndpointStatus {
        let inner = self.inner.lock();
        inner.get(&id).map(|e| *e.tx.borrow()).unwrap_or(EndpointStatus::Ok)
    }

    pub fn mark_failed(&self, id: SsiId) {
        let tx = self.entry_tx(id);
        if *tx.borrow() != EndpointStatus::Failed {
            warn!(target: "fathom", ?id, "endpoint marked failed");
        }
        tx.send_replace(EndpointStatus::Failed);
    }

    pub fn mark_ok(&self, id: SsiId) {
        let tx = self.entry_tx(id);
        if *tx.borrow() == EndpointStatus::Failed {
            debug!(target: "fathom", ?id, "endpoint recovered");
        }
        tx.send_replace(EndpointStatus::Ok);
    }

    /// Await the next "became OK" transition for `id`. Cancellation-safe:
    /// dropping the returned future leaves the monitor state untouched.
    pub async fn wait_for_ok(&self, id: SsiId) {
        let mut rx = {
            let tx = self.entry_tx(id);
            tx.subscribe()
        };
        loop {
            if *rx.borrow() == EndpointStatus::Ok {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Current number of in-flight requests against `id`, used to break
    /// ties between OK replicas in [`pick_replica`].
    pub fn queue_depth(&self, id: SsiId) -> u32 {
        self.in_flight.lock().get(&id).copied().unwrap_or(0)
    }

    /// Marks one request against `id` in flight until the returned guard
    /// drops.
    pub fn begin_request(&self, id: SsiId) -> InFlightGuard {
        *self.in_flight.lock().entry(id).or_insert(0) += 1;
        InFlightGuard { monitor: self.clone(), id }
    }
}

/// RAII handle from [`FailureMonitor::begin_request`]; decrements the
/// endpoint's queue depth on drop, including on a cancelled/panicking call.
pub struct InFlightGuard {
    monitor: FailureMonitor,
    id: SsiId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.monitor.in_flight.lock();
        if let Some(depth) = in_flight.get_mut(&self.id) {
            *depth = depth.saturating_sub(1);
        }
    }
}

#[derive(Default)]
struct PairMetrics {
    mismatches: AtomicU64,
    timeouts: AtomicU64,
}

/// One `(shadow_id, mismatch)` event off the verification channel, produced
/// by [`dispatch`] when a duplicated shadow reply disagrees with (or never
/// arrives in time to be compared with) the primary's (§4.2 "duplicate each
/// request to the shadow... report mismatches"). `fathom-tss` owns what
/// happens once this is handed off.
#[derive(Clone, Debug)]
pub struct MismatchRecord {
    pub shadow_id: SsiId,
    pub timestamp: i64,
    pub mismatch_uid: u128,
    pub trace: String,
}

/// Shadow-server (TSS) pairing table (§4.2, §4.10). `install` records a new
/// primary→shadow mapping; the dispatcher consults [`Self::shadow_for`] to
/// decide whether to duplicate a request; the mismatch handler calls
/// [`Self::remove`] once it has quarantined a pair (§4.10 step 3).
#[derive(Clone)]
pub struct TssRegistry {
    pairs: Arc<Mutex<BTreeMap<SsiId, SsiId>>>,
    metrics: Arc<Mutex<BTreeMap<SsiId, PairMetrics>>>,
}

impl Default for TssRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TssRegistry {
    pub fn new() -> Self {
        TssRegistry { pairs: Arc::new(Mutex::new(BTreeMap::new())), metrics: Arc::new(Mutex::new(BTreeMap::new())) }
    }

    pub fn install(&self, primary: SsiId, shadow: SsiId) {
        self.pairs.lock().insert(primary, shadow);
        self.metrics.lock().entry(primary).or_default();
    }

    pub fn remove(&self, primary: SsiId) -> Option<SsiId> {
        self.metrics.lock().remove(&primary);
        self.pairs.lock().remove(&primary)
    }

    pub fn shadow_for(&self, primary: SsiId) -> Option<SsiId> {
        self.pairs.lock().get(&primary).copied()
    }

    /// Reverse lookup for the mismatch handler (§4.10 step 1), which only
    /// ever learns the shadow's id from the verification channel.
    pub fn primary_for(&self, shadow: SsiId) -> Option<SsiId> {
        self.pairs.lock().iter().find(|(_, s)| **s == shadow).map(|(p, _)| *p)
    }

    pub fn record_mismatch(&self, primary: SsiId) {
        self.metrics.lock().entry(primary).or_default().mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self, primary: SsiId) {
        self.metrics.lock().entry(primary).or_default().timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mismatch_count(&self, primary: SsiId) -> u64 {
        self.metrics.lock().get(&primary).map(|m| m.mismatches.load(Ordering::Relaxed)).unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn fresh_endpoint_is_ok() {
        let fm = FailureMonitor::new();
        assert_eq!(fm.status(SsiId(1)), EndpointStatus::Ok);
    }

    #[test]
    fn mark_failed_then_ok() {
        let fm = FailureMonitor::new();
        fm.mark_failed(SsiId(1));
        assert_eq!(fm.status(SsiId(1)), EndpointStatus::Failed);
        fm.mark_ok(SsiId(1));
        assert_eq!(fm.status(SsiId(1)), EndpointStatus::Ok);
    }

    #[tokio::test]
    async fn wait_for_ok_resolves_on_recovery() {
        let fm = FailureMonitor::new();
        fm.mark_failed(SsiId(1));
        let fm2 = fm.clone();
        let handle = tokio::spawn(async move { fm2.wait_for_ok(SsiId(1)).await });
        tokio::task::yield_now().await;
        fm.mark_ok(SsiId(1));
        handle.await.unwrap();
    }

    #[test]
    fn tss_pairing_lifecycle() {
        let reg = TssRegistry::new();
        reg.install(SsiId(1), SsiId(2));
        assert_eq!(reg.shadow_for(SsiId(1)), Some(SsiId(2)));
        reg.record_mismatch(SsiId(1));
        assert_eq!(reg.mismatch_count(SsiId(1)), 1);
        assert_eq!(reg.primary_for(SsiId(2)), Some(SsiId(1)));
        reg.remove(SsiId(1));
        assert_eq!(reg.shadow_for(SsiId(1)), None);
        assert_eq!(reg.primary_for(SsiId(2)), None);
    }
}
