//! Server-side watch single-flight map (§4.11, §4.4.4). At most one live
//! `watchValue` RPC per `(context, key)`; additional registrations on the
//! same key share the in-flight watch or retrigger it per the coalescing
//! table in §4.4.4.

use std::collections::BTreeMap;
use std::sync::Arc;

use fathom_base::{Key, Result, Value, Version};
use fathom_wire::protocol::WatchValueRequest;
use fathom_wire::{Ssi, Transport};
use parking_lot::Mutex;
use tokio::sync::watch as tokio_watch;
use tracing::{debug, trace, warn};

struct Slot {
    value: Option<Value>,
    version: Version,
    /// Bumped each time the slot genuinely fires; a [`WatchFuture`] created
    /// against generation `g` resolves once the channel carries any value
    /// other than `g`, standing in for a "server version < map version"
    /// ABA check: an arm task whose completion targets a generation that
    /// has since moved on is simply dropped.
    fire_tx: tokio_watch::Sender<u64>,
    generation: u64,
    holders: usize,
}

/// Shared across every transaction on one `DatabaseContext` (§4.8). Always
/// held behind an `Arc` so spawned arm tasks can outlive the caller that
/// registered them.
pub struct WatchMap {
    transport: Arc<dyn Transport>,
    entries: Mutex<BTreeMap<Key, Slot>>,
}

/// Returned by [`WatchMap::register`]; resolves when the value this caller
/// observed is known to have changed at or after the version it read.
pub struct WatchFuture {
    rx: tokio_watch::Receiver<u64>,
    start_gen: u64,
}

impl WatchFuture {
    pub async fn wait(mut self) -> Result<()> {
        loop {
            if *self.rx.borrow() != self.start_gen {
                return Ok(());
            }
            if self.rx.changed().await.is_err() {
                return Err(fathom_base::kind_err(
                    fathom_base::ErrorKind::WatchCancelled,
                    "watch map dropped before resolving",
                ));
            }
        }
    }
}

impl WatchMap {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(WatchMap { transport, entries: Mutex::new(BTreeMap::new()) })
    }

    pub fn live_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Register interest in `key` changing away from `value` at `version`
    /// or later, resolving the coalescing cases of §4.4.4. `read_current`
    /// is invoked only for the "different value, same version" tie-break,
    /// which needs a fresh point read; kept as a callback so this crate
    /// doesn't need to depend on the read pipeline in `fathom-txn`.
    pub async fn register<F>(
        self: &Arc<Self>,
        ssi: Ssi,
        key: Key,
        value: Option<Value>,
        version: Version,
        read_current: F,
    ) -> WatchFuture
    where
        F: std::future::Future<Output = Result<Option<Value>>>,
    {
        enum Action {
            Share { rx: tokio_watch::Receiver<u64>, start_gen: u64, same_version_conflict: bool },
            Arm { generation: u64, rx: tokio_watch::Receiver<u64> },
        }

        let action = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                None => {
                    let (tx, rx) = tokio_watch::channel(0u64);
                    entries.insert(
                        key.clone(),
                        Slot { value: value.clone(), version, fire_tx: tx, generation: 0, holders: 1 },
                    );
                    Action::Arm { generation: 0, rx }
                }
                Some(slot) if version > slot.version => {
                    if value == slot.value {
                        slot.version = version;
                        slot.holders += 1;
                        Action::Share {
                            rx: slot.fire_tx.subscribe(),
                            start_gen: slot.generation,
                            same_version_conflict: false,
                        }
                    } else {
                        slot.generation += 1;
                        let _ = slot.fire_tx.send(slot.generation);
                        slot.value = value.clone();
                        slot.version = version;
                        slot.holders = 1;
                        Action::Arm { generation: slot.generation, rx: slot.fire_tx.subscribe() }
                    }
                }
                Some(slot) if version == slot.version => {
                    let conflict = value != slot.value;
                    slot.holders += 1;
                    Action::Share { rx: slot.fire_tx.subscribe(), start_gen: slot.generation, same_version_conflict: conflict }
                }
                Some(slot) => {
                    // Lower version: the caller's history predates what we're
                    // already watching. No-op; share the live future.
                    slot.holders += 1;
                    Action::Share { rx: slot.fire_tx.subscribe(), start_gen: slot.generation, same_version_conflict: false }
                }
            }
        };

        match action {
            Action::Arm { generation, rx } => {
                self.spawn_arm(ssi, key, value, generation);
                WatchFuture { rx, start_gen: generation }
            }
            Action::Share { rx, start_gen, same_version_conflict: false } => WatchFuture { rx, start_gen },
            Action::Share { rx, start_gen, same_version_conflict: true } => {
                // Different value, same version: consult a fresh read to
                // decide whether to fire immediately or let it ride.
                match read_current.await {
                    Ok(current) if current == value => WatchFuture { rx, start_gen },
                    _ => {
                        let mut entries = self.entries.lock();
                        if let Some(slot) = entries.get_mut(&key) {
                            slot.generation += 1;
                            let _ = slot.fire_tx.send(slot.generation);
                            WatchFuture { rx: slot.fire_tx.subscribe(), start_gen: slot.generation - 1 }
                        } else {
                            WatchFuture { rx, start_gen }
                        }
                    }
                }
            }
        }
    }

    fn spawn_arm(self: &Arc<Self>, ssi: Ssi, key: Key, value: Option<Value>, generation: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let req = WatchValueRequest { key: key.clone(), value: value.clone(), version: Version::INVALID };
                match this.transport.watch_value(&ssi, req).await {
                    Ok(_reply) => {
                        let mut entries = this.entries.lock();
                        if let Some(slot) = entries.get_mut(&key) {
                            if slot.generation == generation {
                                trace!(target: "fathom", ?key, "watch fired");
                                slot.generation += 1;
                                let _ = slot.fire_tx.send(slot.generation);
                                entries.remove(&key);
                            } else {
                                debug!(target: "fathom", ?key, "stale watch arm superseded, dropping");
                            }
                        }
                        return;
                    }
                    Err(e) if e.is_retriable() => {
                        warn!(target: "fathom", ?key, "watch RPC failed, retrying");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        continue;
                    }
                    Err(_) => return,
                }
            }
        });
    }

    /// Re-arm every live watch after a connection-file change (§4.4.4).
    /// Existing waiters keep their generation; only the underlying RPC is
    /// reissued, against a freshly resolved `Ssi` per key since the old one
    /// may no longer be valid post-reconnect. `resolve` mirrors
    /// [`Self::register`]'s `read_current` callback: kept generic so this
    /// crate doesn't need to depend on the location cache in `fathom-txn`.
    pub async fn rearm_all<F, Fut>(self: &Arc<Self>, resolve: F)
    where
        F: Fn(Key) -> Fut,
        Fut: std::future::Future<Output = Option<Ssi>>,
    {
        let keys: Vec<(Key, Option<Value>, u64)> = {
            let entries = self.entries.lock();
            entries.iter().map(|(k, s)| (k.clone(), s.value.clone(), s.generation)).collect()
        };
        for (key, value, generation) in keys {
            match resolve(key.clone()).await {
                Some(ssi) => {
                    debug!(target: "fathom", ?key, "re-arming watch after reconnect");
                    self.spawn_arm(ssi, key, value, generation);
                }
                None => warn!(target: "fathom", ?key, "no replica available to re-arm watch"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fathom_wire::mock::MockTransport;
    use fathom_wire::{EndpointToken, SsiId};
    use test_log::test;

    fn ssi() -> Ssi {
        Ssi {
            id: SsiId(1),
            address: "mock://0".into(),
            get_value: EndpointToken(1),
            get_key: EndpointToken(2),
            get_key_values: EndpointToken(3),
            get_key_values_stream: EndpointToken(4),
            watch_value: EndpointToken(5),
            split_metrics: EndpointToken(6),
            get_read_hot_ranges: EndpointToken(7),
            get_range_split_points: EndpointToken(8),
        }
    }

    #[tokio::test]
    async fn fires_when_value_already_differs() {
        let transport = MockTransport::new();
        transport.seed(Key::from("k"), Value::from(b"new".as_slice()));
        let map = WatchMap::new(transport.clone());
        let fut = map
            .register(ssi(), Key::from("k"), Some(Value::from(b"old".as_slice())), Version(1), async { Ok(None) })
            .await;
        fut.wait().await.unwrap();
    }

    #[tokio::test]
    async fn second_registration_at_same_value_higher_version_shares_future() {
        let transport = MockTransport::new();
        let map = WatchMap::new(transport.clone());
        let f1 = map
            .register(ssi(), Key::from("k"), Some(Value::from(b"v1".as_slice())), Version(1), async { Ok(None) })
            .await;
        assert_eq!(map.live_count(), 1);
        let _f2 = map
            .register(ssi(), Key::from("k"), Some(Value::from(b"v1".as_slice())), Version(2), async { Ok(None) })
            .await;
        assert_eq!(map.live_count(), 1);

        transport.seed(Key::from("k"), Value::from(b"v2".as_slice()));
        tokio::time::timeout(std::time::Duration::from_secs(1), f1.wait()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rearm_all_reissues_watch_against_resolved_ssi() {
        let transport = MockTransport::new();
        transport.seed(Key::from("k"), Value::from(b"v1".as_slice()));
        let map = WatchMap::new(transport.clone());
        let _f = map
            .register(ssi(), Key::from("k"), Some(Value::from(b"v1".as_slice())), Version(1), async { Ok(None) })
            .await;
        // The mock can't actually block: the initial arm sees no change yet,
        // errors out non-retriably, and gives up without a live poll loop.
        tokio::task::yield_now().await;
        assert_eq!(map.live_count(), 1);

        // Value changes while nothing is actively watching for it.
        transport.seed(Key::from("k"), Value::from(b"v2".as_slice()));
        tokio::task::yield_now().await;
        assert_eq!(map.live_count(), 1, "stale arm never reissues on its own");

        // Re-arming after a reconnect reissues the RPC and observes the
        // change the stale arm missed.
        map.rearm_all(|_key| async { Some(ssi()) }).await;
        tokio::task::yield_now().await;
        assert_eq!(map.live_count(), 0);
    }

    #[tokio::test]
    async fn higher_version_different_value_fires_existing_waiter() {
        let transport = MockTransport::new();
        transport.seed(Key::from("k"), Value::from(b"v1".as_slice()));
        let map = WatchMap::new(transport.clone());
        let f1 = map
            .register(ssi(), Key::from("k"), Some(Value::from(b"v1".as_slice())), Version(1), async { Ok(None) })
            .await;
        // Second registration observes a different value at a higher
        // version: this fires f1's generation and installs a fresh watch.
        let _f2 = map
            .register(ssi(), Key::from("k"), Some(Value::from(b"v2".as_slice())), Version(2), async { Ok(None) })
            .await;
        tokio::time::timeout(std::time::Duration::from_secs(1), f1.wait()).await.unwrap().unwrap();
    }
}
