// Replica selection and shadow-duplicate dispatch (§4.2, §4.4.5). Both the
// read pipeline (`fathom-txn`) and the range-stream scanner (`fathom-stream`)
// pick replicas and duplicate to a paired shadow the same way, so it lives
// here rather than in either of those crates.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fathom_base::{err, Result};
use fathom_wire::{LocationInfo, Ssi};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{EndpointStatus, FailureMonitor, MismatchRecord, TssRegistry};

/// Picks one [`Ssi`] out of `info.ssis` to serve the next request: prefer
/// endpoints the failure monitor reports OK, then the lowest queue depth
/// among those, breaking remaining ties randomly. Returns `None` only when
/// `info.ssis` is empty, which should not occur for a `LocationInfo` the
/// cache actually returned.
pub fn pick_replica(info: &LocationInfo, monitor: &FailureMonitor) -> Option<Ssi> {
    if info.ssis.is_empty() {
        return None;
    }
    let ok: Vec<&Ssi> = info.ssis.iter().filter(|s| monitor.status(s.id) == EndpointStatus::Ok).collect();
    let pool: Vec<&Ssi> = if ok.is_empty() { info.ssis.iter().collect() } else { ok };
    let min_depth = pool.iter().map(|s| monitor.queue_depth(s.id)).min().unwrap_or(0);
    let lowest: Vec<&Ssi> = pool.into_iter().filter(|s| monitor.queue_depth(s.id) == min_depth).collect();
    let mut rng = thread_rng();
    lowest.choose(&mut rng).map(|s| (*s).clone())
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Picks a replica out of `info`, issues `call` against it, and — if the
/// chosen replica is paired with a TSS shadow — spawns a background
/// duplicate of `call` against the shadow, comparing replies within
/// `timeout` (§4.4.5 "If a TSS shadow is paired, duplicate the request on
/// success and enqueue for comparison"). A retriable-class error from the
/// primary marks its endpoint degraded before returning, per the load
/// balancer's failover policy.
pub async fn dispatch<T, F, Fut>(
    info: &LocationInfo,
    monitor: &FailureMonitor,
    registry: &TssRegistry,
    mismatch_tx: &mpsc::Sender<MismatchRecord>,
    timeout: Duration,
    call: F,
) -> Result<T>
where
    T: Clone + PartialEq + std::fmt::Debug + Send + 'static,
    F: Fn(Ssi) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
{
    let ssi = pick_replica(info, monitor).ok_or_else(|| err("no replicas available"))?;
    let guard = monitor.begin_request(ssi.id);
    let result = call(ssi.clone()).await;
    drop(guard);

    let value = match result {
        Ok(v) => v,
        Err(e) => {
            if e.is_retriable() {
                monitor.mark_failed(ssi.id);
            }
            return Err(e);
        }
    };

    if let Some(shadow_id) = registry.shadow_for(ssi.id) {
        if let Some(shadow) = info.ssis.iter().find(|s| s.id == shadow_id).cloned() {
            spawn_shadow_check(shadow, call, value.clone(), timeout, mismatch_tx.clone());
        }
    }
    Ok(value)
}

fn spawn_shadow_check<T, F, Fut>(shadow: Ssi, call: F, expected: T, timeout: Duration, mismatch_tx: mpsc::Sender<MismatchRecord>)
where
    T: PartialEq + std::fmt::Debug + Send + 'static,
    F: Fn(Ssi) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
{
    tokio::spawn(async move {
        let shadow_id = shadow.id;
        let outcome = tokio::time::timeout(timeout, call(shadow)).await;
        let trace = match outcome {
            Ok(Ok(actual)) if actual == expected => {
                debug!(target: "fathom", shadow_id = shadow_id.0, "shadow reply matched primary");
                return;
            }
            Ok(Ok(actual)) => format!("primary={expected:?} shadow={actual:?}"),
            Ok(Err(e)) => format!("shadow request errored: {e}"),
            Err(_) => "shadow request timed out".to_string(),
        };
        warn!(target: "fathom", shadow_id = shadow_id.0, "tss shadow mismatch detected");
        let record = MismatchRecord { shadow_id, timestamp: now_millis(), mismatch_uid: rand::random(), trace };
        let _ = mismatch_tx.send(record).await;
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use fathom_wire::EndpointToken;
    use fathom_wire::SsiId;
    use test_log::test;

    fn ssi(id: u64) -> Ssi {
        Ssi {
            id: SsiId(id),
            address: format!("mock://{id}"),
            get_value: EndpointToken(id),
            get_key: EndpointToken(id),
            get_key_values: EndpointToken(id),
            get_key_values_stream: EndpointToken(id),
            watch_value: EndpointToken(id),
            split_metrics: EndpointToken(id),
            get_read_hot_ranges: EndpointToken(id),
            get_range_split_points: EndpointToken(id),
        }
    }

    #[test]
    fn avoids_failed_replicas_when_an_ok_one_exists() {
        let monitor = FailureMonitor::new();
        monitor.mark_failed(SsiId(1));
        let info = LocationInfo::new(vec![ssi(1), ssi(2)], false);
        for _ in 0..20 {
            let picked = pick_replica(&info, &monitor).unwrap();
            assert_eq!(picked.id, SsiId(2));
        }
    }

    #[test]
    fn falls_back_to_degraded_replica_when_all_failed() {
        let monitor = FailureMonitor::new();
        monitor.mark_failed(SsiId(1));
        let info = LocationInfo::new(vec![ssi(1)], false);
        assert!(pick_replica(&info, &monitor).is_some());
    }

    #[test]
    fn prefers_lowest_queue_depth_among_ok_replicas() {
        let monitor = FailureMonitor::new();
        let _busy = monitor.begin_request(SsiId(1));
        let info = LocationInfo::new(vec![ssi(1), ssi(2)], false);
        for _ in 0..20 {
            let picked = pick_replica(&info, &monitor).unwrap();
            assert_eq!(picked.id, SsiId(2));
        }
    }

    #[test(tokio::test)]
    async fn retriable_error_marks_endpoint_failed() {
        let monitor = FailureMonitor::new();
        let registry = TssRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let info = LocationInfo::new(vec![ssi(1)], false);
        let result: Result<()> = dispatch(&info, &monitor, &registry, &tx, Duration::from_millis(50), |_ssi| async {
            Err(fathom_base::kind_err(fathom_base::ErrorKind::WrongShardServer, "moved"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(monitor.status(SsiId(1)), EndpointStatus::Failed);
    }

    #[test(tokio::test)]
    async fn shadow_mismatch_reported_on_channel() {
        let monitor = FailureMonitor::new();
        let registry = TssRegistry::new();
        registry.install(SsiId(1), SsiId(2));
        let (tx, mut rx) = mpsc::channel(1);
        let info = LocationInfo::new(vec![ssi(1), ssi(2)], false);
        let result = dispatch(&info, &monitor, &registry, &tx, Duration::from_millis(200), |ssi| async move {
            Ok::<_, fathom_base::Error>(ssi.id.0)
        })
        .await;
        assert!(result.is_ok());
        let record = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(record.shadow_id, SsiId(2));
    }
}
